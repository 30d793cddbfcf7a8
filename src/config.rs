use serde::{Deserialize, Serialize};

/// Path sentinel selecting the in-memory backend instead of a database file.
pub const MEMORY_PATH: &str = ":memory:";

fn default_cache_enabled() -> bool {
    true
}

fn default_max_entries() -> u32 {
    4096
}

/// Lookup-cache sizing, part of [`MountConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: default_cache_enabled(),
            max_entries: default_max_entries(),
        }
    }
}

/// Open-time configuration for a filesystem instance.
///
/// `path` is either a database file path or [`MEMORY_PATH`]. Hosts hand this
/// across the extension boundary as JSON; all fields have serde defaults so
/// a bare `{"path": "..."}` is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    pub path: String,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl MountConfig {
    /// Config for a throwaway in-memory filesystem with default cache sizing.
    pub fn in_memory() -> Self {
        MountConfig {
            path: MEMORY_PATH.to_string(),
            cache: CacheConfig::default(),
        }
    }

    /// Config for a database file at `path`.
    pub fn at_path(path: impl Into<String>) -> Self {
        MountConfig {
            path: path.into(),
            cache: CacheConfig::default(),
        }
    }

    pub fn with_cache(mut self, enabled: bool, max_entries: u32) -> Self {
        self.cache = CacheConfig {
            enabled,
            max_entries,
        };
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == MEMORY_PATH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: MountConfig = serde_json::from_str(r#"{"path": ":memory:"}"#).unwrap();
        assert!(config.is_in_memory());
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_entries, 4096);
    }

    #[test]
    fn test_cache_overrides() {
        let config: MountConfig = serde_json::from_str(
            r#"{"path": "/tmp/agent.db", "cache": {"enabled": false, "max_entries": 16}}"#,
        )
        .unwrap();
        assert!(!config.is_in_memory());
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.max_entries, 16);
    }
}
