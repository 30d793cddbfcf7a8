//! Path resolution and the lookup cache.
//!
//! The resolver walks normalized absolute paths component by component
//! against a layer view, following symlinks in internal components up to a
//! fixed depth. The cache maps normalized path strings to their resolution
//! binding `(ino, kind)` only, never attribute values, so attribute
//! mutations need no cache work; only operations that change a binding
//! invalidate, including recursive prefix invalidation under directory
//! rename.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use fxhash::FxBuildHasher;
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{FsError, Result};
use crate::overlay::types::{kind_from_mode, CacheStats, FileKind};
use crate::overlay::view::LayerView;
use crate::store::ROOT_INO;

/// Longest accepted directory-entry name.
pub(crate) const MAX_NAME_LEN: usize = 255;

/// Symlink expansions tolerated within one resolution.
pub(crate) const MAX_SYMLINK_DEPTH: usize = 40;

/// Normalize an absolute path: collapse repeated separators and `.`,
/// resolve `..` lexically (clamped at the root), and validate component
/// lengths. The result is the canonical cache key for the path.
pub(crate) fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument(format!(
            "path must be absolute: {path}"
        )));
    }
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => {
                if name.len() > MAX_NAME_LEN {
                    return Err(FsError::NameTooLong(name.to_string()));
                }
                parts.push(name);
            }
        }
    }
    if parts.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

/// Split a canonical path into its parent's canonical path and the final
/// component. Returns `None` for the root.
pub(crate) fn parent_and_name(canonical: &str) -> Option<(String, String)> {
    if canonical == "/" {
        return None;
    }
    let idx = canonical.rfind('/').expect("canonical paths contain '/'");
    let parent = if idx == 0 {
        "/".to_string()
    } else {
        canonical[..idx].to_string()
    };
    Some((parent, canonical[idx + 1..].to_string()))
}

/// Walk `canonical` against `view` and return the binding at its end.
///
/// Symlinks in internal components are always expanded; the final
/// component is expanded only when `follow_final` is set. Expansion splices
/// the target's components into the remaining walk, so relative targets
/// (including `..`) resolve against the symlink's directory.
pub(crate) fn walk(
    view: &impl LayerView,
    canonical: &str,
    follow_final: bool,
) -> Result<(u64, FileKind)> {
    let mut remaining: VecDeque<String> = canonical
        .split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    let mut stack: Vec<u64> = vec![ROOT_INO];
    let mut expansions = 0usize;

    while let Some(comp) = remaining.pop_front() {
        if comp == "." {
            continue;
        }
        if comp == ".." {
            if stack.len() > 1 {
                stack.pop();
            }
            continue;
        }
        if comp.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong(comp));
        }

        let cur = *stack.last().expect("walk stack is never empty");
        let (cur_rec, _) = view
            .inode(cur)?
            .ok_or_else(|| FsError::Corruption(format!("dangling inode {cur}")))?;
        if kind_from_mode(cur_rec.mode)? != FileKind::Dir {
            return Err(FsError::NotDirectory(comp));
        }

        let child = view
            .child(cur, &comp)?
            .ok_or_else(|| FsError::not_found(canonical))?;
        let (child_rec, child_layer) = view
            .inode(child)?
            .ok_or_else(|| FsError::Corruption(format!("entry {comp} points at missing inode")))?;
        let child_kind = kind_from_mode(child_rec.mode)?;

        if child_kind == FileKind::Symlink && (!remaining.is_empty() || follow_final) {
            expansions += 1;
            if expansions > MAX_SYMLINK_DEPTH {
                return Err(FsError::TooManyLinks(canonical.to_string()));
            }
            let target = String::from_utf8(view.symlink_target(child, child_layer)?)
                .map_err(|_| FsError::Corruption(format!("non-UTF-8 symlink target at {comp}")))?;
            if target.is_empty() {
                return Err(FsError::not_found(canonical));
            }
            if target.starts_with('/') {
                stack.truncate(1);
            }
            for part in target.split('/').rev() {
                if !part.is_empty() && part != "." {
                    remaining.push_front(part.to_string());
                }
            }
        } else {
            stack.push(child);
        }
    }

    let final_ino = *stack.last().expect("walk stack is never empty");
    let (rec, _) = view
        .inode(final_ino)?
        .ok_or_else(|| FsError::Corruption(format!("dangling inode {final_ino}")))?;
    Ok((final_ino, kind_from_mode(rec.mode)?))
}

/// A cached resolution binding. `generation` is the invalidation counter
/// observed when the entry was stamped in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CachedLookup {
    pub ino: u64,
    pub kind: FileKind,
    #[allow(dead_code)]
    pub generation: u64,
}

/// Bounded, invalidation-correct lookup cache.
///
/// Entries hold keys only; an entry never keeps an inode record alive.
/// Every invalidation bumps the generation counter; an insert is dropped
/// when any invalidation happened between the start of the resolve and the
/// insert, which keeps a slow reader from re-publishing a binding a
/// concurrent writer just retired.
pub(crate) struct PathCache {
    entries: Mutex<LruCache<String, CachedLookup, FxBuildHasher>>,
    hits: AtomicU64,
    misses: AtomicU64,
    generation: AtomicU64,
}

impl PathCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        PathCache {
            entries: Mutex::new(LruCache::with_hasher(cap, FxBuildHasher::default())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn lookup(&self, path: &str) -> Option<CachedLookup> {
        let mut entries = self.entries.lock();
        match entries.get(path) {
            Some(hit) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(*hit)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a binding resolved while the cache was at `seen_generation`.
    /// Dropped silently if any invalidation has run since.
    pub fn insert_if_current(&self, path: &str, ino: u64, kind: FileKind, seen_generation: u64) {
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::Acquire) != seen_generation {
            return;
        }
        entries.put(
            path.to_string(),
            CachedLookup {
                ino,
                kind,
                generation: seen_generation,
            },
        );
    }

    pub fn invalidate(&self, path: &str) {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.pop(path);
    }

    /// Remove `path` and every key under `path + "/"`. Used for rmdir and
    /// directory rename, where the whole subtree's bindings die at once.
    pub fn invalidate_tree(&self, path: &str) {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.as_str() == path || key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            entries.pop(&key);
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().len() as u64;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            entries,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("//a//b/").unwrap(), "/a/b");
        assert_eq!(normalize("/a/./b").unwrap(), "/a/b");
        assert_eq!(normalize("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize("/../..").unwrap(), "/");
        assert!(matches!(
            normalize("relative/path"),
            Err(FsError::InvalidArgument(_))
        ));
        let long = format!("/{}", "x".repeat(256));
        assert!(matches!(normalize(&long), Err(FsError::NameTooLong(_))));
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_and_name("/"), None);
        assert_eq!(
            parent_and_name("/a"),
            Some(("/".to_string(), "a".to_string()))
        );
        assert_eq!(
            parent_and_name("/a/b/c"),
            Some(("/a/b".to_string(), "c".to_string()))
        );
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = PathCache::new(2);
        let generation = cache.generation();
        cache.insert_if_current("/a", 2, FileKind::File, generation);
        cache.insert_if_current("/b", 3, FileKind::File, generation);
        cache.insert_if_current("/c", 4, FileKind::File, generation);

        assert_eq!(cache.stats().entries, 2);
        assert!(cache.lookup("/a").is_none(), "oldest entry is evicted");
        assert!(cache.lookup("/c").is_some());
    }

    #[test]
    fn test_cache_hit_miss_accounting() {
        let cache = PathCache::new(8);
        let generation = cache.generation();
        cache.insert_if_current("/a", 2, FileKind::File, generation);

        cache.lookup("/a");
        cache.lookup("/a");
        cache.lookup("/missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stale_insert_is_dropped() {
        let cache = PathCache::new(8);
        let generation = cache.generation();
        cache.invalidate("/unrelated");
        cache.insert_if_current("/a", 2, FileKind::File, generation);
        assert!(cache.lookup("/a").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_invalidate_tree_removes_prefix_only() {
        let cache = PathCache::new(8);
        let generation = cache.generation();
        cache.insert_if_current("/dir", 2, FileKind::Dir, generation);
        cache.insert_if_current("/dir/a", 3, FileKind::File, generation);
        cache.insert_if_current("/dir/sub/b", 4, FileKind::File, generation);
        cache.insert_if_current("/dirother", 5, FileKind::File, generation);

        cache.invalidate_tree("/dir");

        assert!(cache.lookup("/dir").is_none());
        assert!(cache.lookup("/dir/a").is_none());
        assert!(cache.lookup("/dir/sub/b").is_none());
        assert!(
            cache.lookup("/dirother").is_some(),
            "sibling sharing the name prefix must survive"
        );
    }
}
