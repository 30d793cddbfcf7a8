//! Shared builders for the integration suites.

#![allow(dead_code)]

use agentfs::{AgentFs, MountConfig};

/// Fresh in-memory filesystem with the default cache configuration.
pub fn memory_fs() -> AgentFs {
    AgentFs::open_in_memory().expect("in-memory open")
}

/// In-memory filesystem with the lookup cache disabled.
pub fn uncached_fs() -> AgentFs {
    AgentFs::open(&MountConfig::in_memory().with_cache(false, 0)).expect("in-memory open")
}

/// In-memory filesystem with a deliberately tiny cache, for eviction and
/// accounting tests.
pub fn small_cache_fs(max_entries: u32) -> AgentFs {
    AgentFs::open(&MountConfig::in_memory().with_cache(true, max_entries)).expect("in-memory open")
}

/// The standard seeded base tree used across the suites:
///
/// ```text
/// /a.txt              "hello"          0644
/// /b.txt              "bravo"          0644
/// /c.txt              "charlie"        0600
/// /docs/              dir              0755
/// /docs/guide.md      "# guide\n"      0644
/// /docs/archive/      dir              0755
/// /docs/archive/old.md "old\n"         0644
/// /link-to-a -> /a.txt
/// ```
pub fn seeded_fs() -> AgentFs {
    let fs = memory_fs();
    seed_base_tree(&fs);
    fs
}

pub fn seed_base_tree(fs: &AgentFs) {
    fs.seed(|b| {
        b.file("/a.txt", 0o644, b"hello")?;
        b.file("/b.txt", 0o644, b"bravo")?;
        b.file("/c.txt", 0o600, b"charlie")?;
        b.dir("/docs", 0o755)?;
        b.file("/docs/guide.md", 0o644, b"# guide\n")?;
        b.dir("/docs/archive", 0o755)?;
        b.file("/docs/archive/old.md", 0o644, b"old\n")?;
        b.symlink("/link-to-a", "/a.txt")?;
        Ok(())
    })
    .expect("seed base tree");
}

/// Names of a directory listing, for order assertions.
pub fn names(fs: &AgentFs, path: &str) -> Vec<String> {
    fs.readdir(path)
        .expect("readdir")
        .into_iter()
        .map(|e| e.name)
        .collect()
}
