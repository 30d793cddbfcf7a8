//! The overlay engine and its public path-addressed API.
//!
//! [`AgentFs`] composes the immutable base layer with the mutable delta
//! layer stored in the same database. Reads fall through to the base when
//! a path is untouched; the first mutation of a base object materializes
//! it into the delta at the same inode id (copy-up), so `st_ino` stays
//! stable for the lifetime of the binding.
//!
//! Every operation takes an absolute path and is stateless per call: no
//! file descriptors exist in the core, matching a host-extension world
//! where every call is re-resolved. Mutations run inside one write
//! transaction; the lookup cache is invalidated only after a successful
//! commit, so an aborted transaction leaves both the store and the cache
//! untouched.

mod copy_up;
mod dirs;
pub mod resolver;
pub mod types;
mod view;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::MountConfig;
use crate::error::{FsError, Result};
use crate::store::record::{InodeRecord, Provenance};
use crate::store::{self, Store, ROOT_INO};
use resolver::PathCache;
use types::{kind_from_mode, CacheStats, DirEntry, FileKind, FileStat, StatFs};
use view::{LayerView, ReadView, WriteView};

/// Cooperative cancellation flag, honored between transactions.
///
/// A started commit always runs to completion; the next operation on the
/// same filesystem observes the flag and fails with `Canceled`.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The directory binding a mutation resolved through.
struct EntryRef {
    parent: u64,
    name: String,
    child: Option<(u64, FileKind)>,
}

/// A copy-on-write overlay filesystem backed by a single database.
pub struct AgentFs {
    store: Store,
    cache: Option<PathCache>,
    cancel: CancelToken,
}

impl AgentFs {
    /// Open (or create) the filesystem described by `config`.
    pub fn open(config: &MountConfig) -> Result<Self> {
        let store = Store::open(config)?;
        let cache = config
            .cache
            .enabled
            .then(|| PathCache::new(config.cache.max_entries as usize));
        tracing::debug!(
            path = %config.path,
            cache_enabled = config.cache.enabled,
            "overlay opened"
        );
        Ok(AgentFs {
            store,
            cache,
            cancel: CancelToken::default(),
        })
    }

    /// Throwaway in-memory filesystem with default configuration.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&MountConfig::in_memory())
    }

    /// Populate the immutable base layer. See [`Store::seed`].
    pub fn seed<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut crate::store::seed::SeedBuilder) -> Result<()>,
    {
        self.store.seed(f)?;
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        Ok(())
    }

    /// Token shared with callers that need to abort long call sequences.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    // ---- read-side operations -------------------------------------------

    /// Attributes of the object at `path`, following a final symlink.
    pub fn stat(&self, path: &str) -> Result<FileStat> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_read()?;
        let view = ReadView::new(&txn)?;
        let (ino, _) = self.resolve_follow(&view, &canonical)?;
        self.stat_of(&view, ino)
    }

    /// Attributes of the binding at `path` itself; a final symlink is not
    /// followed.
    pub fn lstat(&self, path: &str) -> Result<FileStat> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_read()?;
        let view = ReadView::new(&txn)?;
        let (ino, _) = self.resolve_binding(&view, &canonical)?;
        self.stat_of(&view, ino)
    }

    /// Layer provenance of the binding at `path` (a final symlink is not
    /// followed): pristine base, delta-native, or copied-up at its
    /// retained base id. Hosts use this to tell modified objects apart
    /// without diffing content.
    pub fn provenance(&self, path: &str) -> Result<Provenance> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_read()?;
        let view = ReadView::new(&txn)?;
        let (ino, _) = self.resolve_binding(&view, &canonical)?;
        let (rec, _) = self.load_inode(&view, ino)?;
        Ok(rec.provenance)
    }

    /// Read up to `len` bytes at `offset`. Returns a short buffer at EOF.
    /// Never triggers copy-up.
    pub fn read(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_read()?;
        let view = ReadView::new(&txn)?;
        let (ino, kind) = self.resolve_follow(&view, &canonical)?;
        if kind == FileKind::Dir {
            return Err(FsError::IsDirectory(canonical));
        }
        let (rec, layer) = self.load_inode(&view, ino)?;
        view.read_range(ino, layer, rec.size, offset, len)
    }

    /// Target of the symlink at `path`.
    pub fn readlink(&self, path: &str) -> Result<String> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_read()?;
        let view = ReadView::new(&txn)?;
        let (ino, kind) = self.resolve_binding(&view, &canonical)?;
        if kind != FileKind::Symlink {
            return Err(FsError::InvalidArgument(format!(
                "not a symlink: {canonical}"
            )));
        }
        let (_, layer) = self.load_inode(&view, ino)?;
        String::from_utf8(view.symlink_target(ino, layer)?)
            .map_err(|_| FsError::Corruption(format!("non-UTF-8 symlink target at {canonical}")))
    }

    /// Logical directory listing in lexicographic order: base entries not
    /// whited out, unioned with delta entries, delta winning on collision.
    /// `.` and `..` are left to the caller.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_read()?;
        let view = ReadView::new(&txn)?;
        let (ino, kind) = self.resolve_follow(&view, &canonical)?;
        if kind != FileKind::Dir {
            return Err(FsError::NotDirectory(canonical));
        }
        let mut entries = Vec::new();
        for (name, child) in view.list_dir(ino)? {
            let (rec, _) = self.load_inode(&view, child)?;
            entries.push(DirEntry {
                name,
                kind: kind_from_mode(rec.mode)?,
                ino: child,
            });
        }
        Ok(entries)
    }

    /// Extended attribute value, or `None` when the attribute is unset.
    /// Never triggers copy-up.
    pub fn getxattr(&self, path: &str, name: &str) -> Result<Option<Vec<u8>>> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_read()?;
        let view = ReadView::new(&txn)?;
        let (ino, _) = self.resolve_follow(&view, &canonical)?;
        let (_, layer) = self.load_inode(&view, ino)?;
        view.xattr(ino, layer, name)
    }

    /// Names of all extended attributes, sorted.
    pub fn listxattr(&self, path: &str) -> Result<Vec<String>> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_read()?;
        let view = ReadView::new(&txn)?;
        let (ino, _) = self.resolve_follow(&view, &canonical)?;
        let (_, layer) = self.load_inode(&view, ino)?;
        view.xattr_names(ino, layer)
    }

    /// Whole-filesystem accounting.
    pub fn statfs(&self) -> Result<StatFs> {
        self.check_canceled()?;
        let txn = self.store.begin_read()?;
        let view = ReadView::new(&txn)?;
        let (bytes_used, inodes) = view.usage()?;
        Ok(StatFs { bytes_used, inodes })
    }

    /// Durability barrier for `path`: verifies the path resolves, then
    /// flushes everything committed so far to stable storage.
    pub fn fsync(&self, path: &str) -> Result<()> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        {
            let txn = self.store.begin_read()?;
            let view = ReadView::new(&txn)?;
            self.resolve_follow(&view, &canonical)?;
        }
        self.store.flush()
    }

    /// Lookup-cache counters, or `None` when the cache is disabled.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    // ---- mutating operations --------------------------------------------

    /// Create an empty regular file.
    pub fn create(&self, path: &str, mode: u32) -> Result<FileStat> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_write()?;
        let stat = {
            let mut view = WriteView::new(&txn)?;
            let entry = self.resolve_entry(&view, &canonical)?;
            if entry.child.is_some() {
                return Err(FsError::exists(canonical));
            }
            let ino = store::alloc_ino(&txn)?;
            let now = store::now_ts();
            let rec = InodeRecord {
                mode: libc::S_IFREG as u32 | (mode & 0o7777),
                uid: 0,
                gid: 0,
                nlink: 1,
                size: 0,
                atime: now,
                mtime: now,
                ctime: now,
                provenance: Provenance::Delta,
            };
            view.put_delta_inode(ino, &rec)?;
            view.link_delta_entry(entry.parent, &entry.name, ino)?;
            copy_up::touch_dir(&mut view, entry.parent, now)?;
            FileStat::from_record(ino, &rec)?
        };
        txn.commit()?;
        self.invalidate(&canonical);
        Ok(stat)
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<FileStat> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_write()?;
        let stat = {
            let mut view = WriteView::new(&txn)?;
            let entry = self.resolve_entry(&view, &canonical)?;
            if entry.child.is_some() {
                return Err(FsError::exists(canonical));
            }
            let ino = store::alloc_ino(&txn)?;
            let now = store::now_ts();
            let rec = InodeRecord {
                mode: libc::S_IFDIR as u32 | (mode & 0o7777),
                uid: 0,
                gid: 0,
                nlink: 1,
                size: 0,
                atime: now,
                mtime: now,
                ctime: now,
                provenance: Provenance::Delta,
            };
            view.put_delta_inode(ino, &rec)?;
            view.link_delta_entry(entry.parent, &entry.name, ino)?;
            copy_up::touch_dir(&mut view, entry.parent, now)?;
            FileStat::from_record(ino, &rec)?
        };
        txn.commit()?;
        self.invalidate(&canonical);
        Ok(stat)
    }

    /// Create a symlink at `linkpath` pointing at `target`. The target is
    /// stored verbatim and resolved lazily during walks.
    pub fn symlink(&self, target: &str, linkpath: &str) -> Result<FileStat> {
        self.check_canceled()?;
        if target.is_empty() {
            return Err(FsError::InvalidArgument(
                "symlink target must not be empty".to_string(),
            ));
        }
        let canonical = resolver::normalize(linkpath)?;
        let txn = self.store.begin_write()?;
        let stat = {
            let mut view = WriteView::new(&txn)?;
            let entry = self.resolve_entry(&view, &canonical)?;
            if entry.child.is_some() {
                return Err(FsError::exists(canonical));
            }
            let ino = store::alloc_ino(&txn)?;
            let now = store::now_ts();
            let rec = InodeRecord {
                mode: libc::S_IFLNK as u32 | 0o777,
                uid: 0,
                gid: 0,
                nlink: 1,
                size: target.len() as u64,
                atime: now,
                mtime: now,
                ctime: now,
                provenance: Provenance::Delta,
            };
            view.put_delta_inode(ino, &rec)?;
            view.put_delta_symlink(ino, target.as_bytes())?;
            view.link_delta_entry(entry.parent, &entry.name, ino)?;
            copy_up::touch_dir(&mut view, entry.parent, now)?;
            FileStat::from_record(ino, &rec)?
        };
        txn.commit()?;
        self.invalidate(&canonical);
        Ok(stat)
    }

    /// Write `data` at `offset`, copy-up on first mutation of a base file.
    /// Returns the number of bytes written.
    pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= i64::MAX as u64)
            .ok_or_else(|| FsError::InvalidArgument(format!("write beyond range at {offset}")))?;

        let txn = self.store.begin_write()?;
        {
            let mut view = WriteView::new(&txn)?;
            let (ino, kind, link) = self.resolve_object(&view, &canonical, true)?;
            if kind != FileKind::File {
                return Err(FsError::IsDirectory(canonical));
            }
            let mut rec = copy_up::ensure_delta(&mut view, ino, link_ref(&link))?;
            view.write_range(ino, offset, data)?;
            let now = store::now_ts();
            rec.size = rec.size.max(end);
            rec.atime = now;
            rec.mtime = now;
            rec.ctime = now;
            view.put_delta_inode(ino, &rec)?;
        }
        txn.commit()?;
        Ok(data.len())
    }

    /// Create-or-replace convenience: the file exists afterwards with
    /// exactly `data` as content.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_write()?;
        let created = {
            let mut view = WriteView::new(&txn)?;
            let entry = self.resolve_entry(&view, &canonical)?;
            let now = store::now_ts();
            let (ino, created) = match entry.child {
                Some((ino, FileKind::File)) => {
                    let mut rec = copy_up::ensure_delta(
                        &mut view,
                        ino,
                        Some((entry.parent, entry.name.as_str())),
                    )?;
                    view.truncate_content(ino, 0)?;
                    rec.size = 0;
                    view.put_delta_inode(ino, &rec)?;
                    (ino, false)
                }
                Some((_, FileKind::Dir)) => return Err(FsError::IsDirectory(canonical)),
                Some((_, FileKind::Symlink)) => {
                    let (ino, kind) = self.resolve_follow(&view, &canonical)?;
                    if kind != FileKind::File {
                        return Err(FsError::IsDirectory(canonical));
                    }
                    let mut rec = copy_up::ensure_delta(&mut view, ino, None)?;
                    view.truncate_content(ino, 0)?;
                    rec.size = 0;
                    view.put_delta_inode(ino, &rec)?;
                    (ino, false)
                }
                None => {
                    let ino = store::alloc_ino(&txn)?;
                    let rec = InodeRecord {
                        mode: libc::S_IFREG as u32 | 0o644,
                        uid: 0,
                        gid: 0,
                        nlink: 1,
                        size: 0,
                        atime: now,
                        mtime: now,
                        ctime: now,
                        provenance: Provenance::Delta,
                    };
                    view.put_delta_inode(ino, &rec)?;
                    view.link_delta_entry(entry.parent, &entry.name, ino)?;
                    copy_up::touch_dir(&mut view, entry.parent, now)?;
                    (ino, true)
                }
            };

            view.write_range(ino, 0, data)?;
            let mut rec = view
                .delta_inode(ino)?
                .ok_or_else(|| FsError::Corruption(format!("inode {ino} vanished mid-write")))?;
            rec.size = data.len() as u64;
            rec.atime = now;
            rec.mtime = now;
            rec.ctime = now;
            view.put_delta_inode(ino, &rec)?;
            created
        };
        txn.commit()?;
        if created {
            self.invalidate(&canonical);
        }
        Ok(())
    }

    /// Set the file size, dropping or zero-extending content.
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        if size > i64::MAX as u64 {
            return Err(FsError::InvalidArgument(format!("size {size} too large")));
        }
        let txn = self.store.begin_write()?;
        {
            let mut view = WriteView::new(&txn)?;
            let (ino, kind, link) = self.resolve_object(&view, &canonical, true)?;
            if kind != FileKind::File {
                return Err(FsError::IsDirectory(canonical));
            }
            let mut rec = copy_up::ensure_delta(&mut view, ino, link_ref(&link))?;
            if size < rec.size {
                view.truncate_content(ino, size)?;
            }
            let now = store::now_ts();
            rec.size = size;
            rec.mtime = now;
            rec.ctime = now;
            view.put_delta_inode(ino, &rec)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Reserve `[offset, offset + len)`: the file size grows to cover the
    /// range, new bytes reading as zeros.
    pub fn fallocate(&self, path: &str, offset: u64, len: u64) -> Result<()> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let end = offset
            .checked_add(len)
            .filter(|end| len > 0 && *end <= i64::MAX as u64)
            .ok_or_else(|| {
                FsError::InvalidArgument(format!("fallocate range {offset}+{len} invalid"))
            })?;
        let txn = self.store.begin_write()?;
        {
            let mut view = WriteView::new(&txn)?;
            let (ino, kind, link) = self.resolve_object(&view, &canonical, true)?;
            if kind != FileKind::File {
                return Err(FsError::IsDirectory(canonical));
            }
            let mut rec = copy_up::ensure_delta(&mut view, ino, link_ref(&link))?;
            if end > rec.size {
                let now = store::now_ts();
                rec.size = end;
                rec.mtime = now;
                rec.ctime = now;
                view.put_delta_inode(ino, &rec)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        self.update_record(&canonical, |rec, now| {
            rec.mode = (rec.mode & libc::S_IFMT as u32) | (mode & 0o7777);
            rec.ctime = now;
        })
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        self.update_record(&canonical, |rec, now| {
            rec.uid = uid;
            rec.gid = gid;
            rec.ctime = now;
        })
    }

    pub fn utimes(&self, path: &str, atime: i64, mtime: i64) -> Result<()> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        self.update_record(&canonical, |rec, now| {
            rec.atime = atime;
            rec.mtime = mtime;
            rec.ctime = now;
        })
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> Result<()> {
        self.check_canceled()?;
        if name.is_empty() {
            return Err(FsError::InvalidArgument(
                "xattr name must not be empty".to_string(),
            ));
        }
        if name.len() > resolver::MAX_NAME_LEN {
            return Err(FsError::NameTooLong(name.to_string()));
        }
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_write()?;
        {
            let mut view = WriteView::new(&txn)?;
            let (ino, _, link) = self.resolve_object(&view, &canonical, true)?;
            let mut rec = copy_up::ensure_delta(&mut view, ino, link_ref(&link))?;
            view.set_delta_xattr(ino, name, value)?;
            rec.ctime = store::now_ts();
            view.put_delta_inode(ino, &rec)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn removexattr(&self, path: &str, name: &str) -> Result<()> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_write()?;
        {
            let mut view = WriteView::new(&txn)?;
            let (ino, _, link) = self.resolve_object(&view, &canonical, true)?;
            let mut rec = copy_up::ensure_delta(&mut view, ino, link_ref(&link))?;
            if !view.remove_delta_xattr(ino, name)? {
                return Err(FsError::not_found(format!("xattr {name} on {canonical}")));
            }
            rec.ctime = store::now_ts();
            view.put_delta_inode(ino, &rec)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove a file or symlink binding; the inode and its content go away
    /// when the last delta link is dropped, while base-resident objects
    /// are hidden behind a whiteout.
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_write()?;
        {
            let mut view = WriteView::new(&txn)?;
            self.unlink_in(&mut view, &canonical)?;
        }
        txn.commit()?;
        self.invalidate(&canonical);
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_write()?;
        {
            let mut view = WriteView::new(&txn)?;
            self.rmdir_in(&mut view, &canonical)?;
        }
        txn.commit()?;
        self.invalidate_tree(&canonical);
        Ok(())
    }

    /// Kind-dispatching removal: `rmdir` for directories, `unlink` for
    /// everything else.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.check_canceled()?;
        let canonical = resolver::normalize(path)?;
        let txn = self.store.begin_write()?;
        let removed_dir = {
            let mut view = WriteView::new(&txn)?;
            let entry = self.resolve_entry(&view, &canonical)?;
            match entry.child {
                Some((_, FileKind::Dir)) => {
                    self.rmdir_in(&mut view, &canonical)?;
                    true
                }
                Some(_) => {
                    self.unlink_in(&mut view, &canonical)?;
                    false
                }
                None => return Err(FsError::not_found(canonical)),
            }
        };
        txn.commit()?;
        if removed_dir {
            self.invalidate_tree(&canonical);
        } else {
            self.invalidate(&canonical);
        }
        Ok(())
    }

    /// Atomically move `src` to `dst`. The source keeps its inode id; a
    /// replaced destination is unlinked in the same transaction; no
    /// intermediate state is ever observable.
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.check_canceled()?;
        let src_c = resolver::normalize(src)?;
        let dst_c = resolver::normalize(dst)?;
        if src_c == "/" || dst_c == "/" {
            return Err(FsError::InvalidArgument("cannot rename the root".to_string()));
        }
        if src_c == dst_c {
            return Ok(());
        }
        if dst_c.starts_with(&format!("{src_c}/")) {
            return Err(FsError::InvalidArgument(format!(
                "cannot move {src_c} into its own subtree"
            )));
        }

        let txn = self.store.begin_write()?;
        let src_kind = {
            let mut view = WriteView::new(&txn)?;
            let src_entry = self.resolve_entry(&view, &src_c)?;
            let (src_ino, src_kind) = src_entry
                .child
                .ok_or_else(|| FsError::not_found(src_c.as_str()))?;
            let dst_entry = self.resolve_entry(&view, &dst_c)?;

            if let Some((dst_ino, dst_kind)) = dst_entry.child {
                if dst_ino == src_ino {
                    // Hard links to the same inode; POSIX leaves both in place.
                    return Ok(());
                }
                match (src_kind, dst_kind) {
                    (FileKind::Dir, FileKind::Dir) => {
                        if view.has_live_child(dst_ino)? {
                            return Err(FsError::NotEmpty(dst_c));
                        }
                    }
                    (_, FileKind::Dir) => return Err(FsError::IsDirectory(dst_c)),
                    (FileKind::Dir, _) => return Err(FsError::NotDirectory(dst_c)),
                    _ => {}
                }
                self.drop_binding(&mut view, dst_entry.parent, &dst_entry.name, dst_ino, dst_kind)?;
            }

            let mut rec = copy_up::ensure_delta(&mut view, src_ino, None)?;
            view.link_delta_entry(dst_entry.parent, &dst_entry.name, src_ino)?;
            view.unlink_binding(src_entry.parent, &src_entry.name)?;

            let now = store::now_ts();
            rec.ctime = now;
            view.put_delta_inode(src_ino, &rec)?;
            copy_up::touch_dir(&mut view, src_entry.parent, now)?;
            if dst_entry.parent != src_entry.parent {
                copy_up::touch_dir(&mut view, dst_entry.parent, now)?;
            }
            src_kind
        };
        txn.commit()?;

        if src_kind == FileKind::Dir {
            self.invalidate_tree(&src_c);
            self.invalidate_tree(&dst_c);
        } else {
            self.invalidate(&src_c);
            self.invalidate(&dst_c);
        }
        Ok(())
    }

    /// Hard link `src` at `dst`. Links exist only within the delta: a
    /// base-resident source is copied up first, keeping its id, and the
    /// new entry points at that same id.
    pub fn link(&self, src: &str, dst: &str) -> Result<()> {
        self.check_canceled()?;
        let src_c = resolver::normalize(src)?;
        let dst_c = resolver::normalize(dst)?;
        let txn = self.store.begin_write()?;
        {
            let mut view = WriteView::new(&txn)?;
            let src_entry = self.resolve_entry(&view, &src_c)?;
            let (src_ino, src_kind) = src_entry
                .child
                .ok_or_else(|| FsError::not_found(src_c.as_str()))?;
            if src_kind == FileKind::Dir {
                return Err(FsError::Permission(format!(
                    "cannot hard link directory {src_c}"
                )));
            }
            let dst_entry = self.resolve_entry(&view, &dst_c)?;
            if dst_entry.child.is_some() {
                return Err(FsError::exists(dst_c.clone()));
            }

            let mut rec = copy_up::ensure_delta(
                &mut view,
                src_ino,
                Some((src_entry.parent, src_entry.name.as_str())),
            )?;
            rec.nlink += 1;
            let now = store::now_ts();
            rec.ctime = now;
            view.put_delta_inode(src_ino, &rec)?;
            view.link_delta_entry(dst_entry.parent, &dst_entry.name, src_ino)?;
            copy_up::touch_dir(&mut view, dst_entry.parent, now)?;
        }
        txn.commit()?;
        self.invalidate(&dst_c);
        Ok(())
    }

    // ---- internals ------------------------------------------------------

    fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(FsError::Canceled);
        }
        Ok(())
    }

    fn load_inode(&self, view: &impl LayerView, ino: u64) -> Result<(InodeRecord, view::Layer)> {
        view.inode(ino)?
            .ok_or_else(|| FsError::Corruption(format!("dangling inode {ino}")))
    }

    fn stat_of(&self, view: &impl LayerView, ino: u64) -> Result<FileStat> {
        let (rec, _) = self.load_inode(view, ino)?;
        let mut stat = FileStat::from_record(ino, &rec)?;
        if stat.kind == FileKind::Dir {
            // Directory link counts are derived, not stored: the parent
            // binding plus one when any live child exists.
            stat.nlink = 1 + view.has_live_child(ino)? as u32;
        }
        Ok(stat)
    }

    /// Resolve the binding at `canonical` without following a final
    /// symlink, consulting and populating the cache.
    fn resolve_binding(&self, view: &impl LayerView, canonical: &str) -> Result<(u64, FileKind)> {
        if canonical == "/" {
            return Ok((ROOT_INO, FileKind::Dir));
        }
        match &self.cache {
            Some(cache) => {
                let generation = cache.generation();
                if let Some(hit) = cache.lookup(canonical) {
                    return Ok((hit.ino, hit.kind));
                }
                let (ino, kind) = resolver::walk(view, canonical, false)?;
                cache.insert_if_current(canonical, ino, kind, generation);
                Ok((ino, kind))
            }
            None => resolver::walk(view, canonical, false),
        }
    }

    /// Resolve `canonical` following a final symlink chain.
    fn resolve_follow(&self, view: &impl LayerView, canonical: &str) -> Result<(u64, FileKind)> {
        let mut current = canonical.to_string();
        for _ in 0..=resolver::MAX_SYMLINK_DEPTH {
            let (ino, kind) = self.resolve_binding(view, &current)?;
            if kind != FileKind::Symlink {
                return Ok((ino, kind));
            }
            let (_, layer) = self.load_inode(view, ino)?;
            let target = String::from_utf8(view.symlink_target(ino, layer)?)
                .map_err(|_| FsError::Corruption(format!("non-UTF-8 symlink target at {current}")))?;
            current = if target.starts_with('/') {
                resolver::normalize(&target)?
            } else {
                let (parent, _) = resolver::parent_and_name(&current)
                    .expect("symlink bindings always have a parent");
                resolver::normalize(&format!("{parent}/{target}"))?
            };
        }
        Err(FsError::TooManyLinks(canonical.to_string()))
    }

    /// Resolve the directory binding a mutation goes through. Intermediate
    /// symlinks are followed; the final component is looked up raw.
    fn resolve_entry(&self, view: &impl LayerView, canonical: &str) -> Result<EntryRef> {
        let (dir_part, name) = resolver::parent_and_name(canonical).ok_or_else(|| {
            FsError::InvalidArgument("operation not applicable to the root".to_string())
        })?;
        let (parent, parent_kind) = self.resolve_follow(view, &dir_part)?;
        if parent_kind != FileKind::Dir {
            return Err(FsError::NotDirectory(dir_part));
        }
        let child = match view.child(parent, &name)? {
            Some(ino) => {
                let (rec, _) = self.load_inode(view, ino)?;
                Some((ino, kind_from_mode(rec.mode)?))
            }
            None => None,
        };
        Ok(EntryRef {
            parent,
            name,
            child,
        })
    }

    /// Resolve a mutation target: the binding itself, or the end of the
    /// symlink chain when `follow` is set. The returned link is the
    /// directory binding when it refers to the returned inode directly.
    fn resolve_object(
        &self,
        view: &impl LayerView,
        canonical: &str,
        follow: bool,
    ) -> Result<(u64, FileKind, Option<(u64, String)>)> {
        if canonical == "/" {
            return Ok((ROOT_INO, FileKind::Dir, None));
        }
        let entry = self.resolve_entry(view, canonical)?;
        let (ino, kind) = entry.child.ok_or_else(|| FsError::not_found(canonical))?;
        if follow && kind == FileKind::Symlink {
            let (ino, kind) = self.resolve_follow(view, canonical)?;
            return Ok((ino, kind, None));
        }
        Ok((ino, kind, Some((entry.parent, entry.name))))
    }

    /// Shared body of the metadata-only mutations (chmod, chown, utimes).
    fn update_record<F>(&self, canonical: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut InodeRecord, i64),
    {
        let txn = self.store.begin_write()?;
        {
            let mut view = WriteView::new(&txn)?;
            let (ino, _, link) = self.resolve_object(&view, canonical, true)?;
            let mut rec = copy_up::ensure_delta(&mut view, ino, link_ref(&link))?;
            apply(&mut rec, store::now_ts());
            view.put_delta_inode(ino, &rec)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn unlink_in(&self, view: &mut WriteView, canonical: &str) -> Result<()> {
        let entry = self.resolve_entry(view, canonical)?;
        let (ino, kind) = entry.child.ok_or_else(|| FsError::not_found(canonical))?;
        if kind == FileKind::Dir {
            return Err(FsError::IsDirectory(canonical.to_string()));
        }
        self.drop_binding(view, entry.parent, &entry.name, ino, kind)?;
        copy_up::touch_dir(view, entry.parent, store::now_ts())
    }

    fn rmdir_in(&self, view: &mut WriteView, canonical: &str) -> Result<()> {
        let entry = self.resolve_entry(view, canonical)?;
        let (ino, kind) = entry.child.ok_or_else(|| FsError::not_found(canonical))?;
        if kind != FileKind::Dir {
            return Err(FsError::NotDirectory(canonical.to_string()));
        }
        if view.has_live_child(ino)? {
            return Err(FsError::NotEmpty(canonical.to_string()));
        }
        view.unlink_binding(entry.parent, &entry.name)?;
        if view.delta_inode(ino)?.is_some() {
            view.remove_delta_object(ino)?;
        }
        // Whiteouts keyed under the removed directory are unreachable now.
        view.purge_whiteouts_of(ino)?;
        copy_up::touch_dir(view, entry.parent, store::now_ts())
    }

    /// Remove the binding `(parent, name) -> ino` for a non-directory and
    /// release the inode when its last delta link drops.
    fn drop_binding(
        &self,
        view: &mut WriteView,
        parent: u64,
        name: &str,
        ino: u64,
        kind: FileKind,
    ) -> Result<()> {
        if kind == FileKind::Dir {
            if view.delta_inode(ino)?.is_some() {
                view.remove_delta_object(ino)?;
            }
            view.purge_whiteouts_of(ino)?;
            view.unlink_binding(parent, name)?;
            return Ok(());
        }

        view.unlink_binding(parent, name)?;
        if let Some(mut rec) = view.delta_inode(ino)? {
            rec.nlink = rec.nlink.saturating_sub(1);
            if rec.nlink == 0 {
                view.remove_delta_object(ino)?;
            } else {
                rec.ctime = store::now_ts();
                view.put_delta_inode(ino, &rec)?;
            }
        }
        // Base-resident objects are immutable: the whiteout written by
        // unlink_binding is the whole removal.
        Ok(())
    }

    fn invalidate(&self, canonical: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(canonical);
        }
    }

    fn invalidate_tree(&self, canonical: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate_tree(canonical);
        }
    }
}

fn link_ref(link: &Option<(u64, String)>) -> Option<(u64, &str)> {
    link.as_ref().map(|(parent, name)| (*parent, name.as_str()))
}
