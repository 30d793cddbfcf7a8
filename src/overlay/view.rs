//! Transaction-scoped views composing the base and delta layers.
//!
//! A [`ReadView`] wraps the tables of one read snapshot; a [`WriteView`]
//! wraps the tables of the single write transaction a mutating operation
//! runs in. Both expose the same layer-composition rules through
//! [`LayerView`]; `WriteView` adds the mutation primitives the overlay
//! engine builds on.

use redb::{ReadOnlyTable, ReadableTable, Table};

use crate::error::{FsError, Result};
use crate::overlay::dirs;
use crate::store::record::InodeRecord;
use crate::store::{self, CHUNK_SIZE};

/// Which layer a record or payload was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layer {
    Base,
    Delta,
}

/// Read-side composition shared by both view types.
pub(crate) trait LayerView {
    /// Load the inode record for `ino`: the delta record shadows the base
    /// record at the same id.
    fn inode(&self, ino: u64) -> Result<Option<(InodeRecord, Layer)>>;

    /// Logical child lookup (delta wins, whiteouts hide base).
    fn child(&self, parent: u64, name: &str) -> Result<Option<u64>>;

    /// Logical directory listing in lexicographic order.
    fn list_dir(&self, parent: u64) -> Result<Vec<(String, u64)>>;

    fn has_live_child(&self, parent: u64) -> Result<bool>;

    fn symlink_target(&self, ino: u64, layer: Layer) -> Result<Vec<u8>>;

    /// Read `[offset, offset+len)` clipped to `size`. Chunks missing from
    /// the owning layer read as zeros.
    fn read_range(&self, ino: u64, layer: Layer, size: u64, offset: u64, len: u64)
        -> Result<Vec<u8>>;

    fn xattr(&self, ino: u64, layer: Layer, name: &str) -> Result<Option<Vec<u8>>>;

    fn xattr_names(&self, ino: u64, layer: Layer) -> Result<Vec<String>>;
}

fn load_inode(
    delta: &impl ReadableTable<u64, &'static [u8]>,
    base: &impl ReadableTable<u64, &'static [u8]>,
    ino: u64,
) -> Result<Option<(InodeRecord, Layer)>> {
    if let Some(bytes) = delta.get(ino)? {
        return Ok(Some((InodeRecord::decode(bytes.value())?, Layer::Delta)));
    }
    if let Some(bytes) = base.get(ino)? {
        return Ok(Some((InodeRecord::decode(bytes.value())?, Layer::Base)));
    }
    Ok(None)
}

fn symlink_from(table: &impl ReadableTable<u64, &'static [u8]>, ino: u64) -> Result<Vec<u8>> {
    table
        .get(ino)?
        .map(|v| v.value().to_vec())
        .ok_or_else(|| FsError::Corruption(format!("missing symlink target for inode {ino}")))
}

fn read_chunks(
    table: &impl ReadableTable<(u64, u64), &'static [u8]>,
    ino: u64,
    size: u64,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>> {
    if offset >= size || len == 0 {
        return Ok(Vec::new());
    }
    let end = size.min(offset.saturating_add(len));
    let mut out = vec![0u8; (end - offset) as usize];

    let first = offset / CHUNK_SIZE;
    let last = (end - 1) / CHUNK_SIZE;
    for index in first..=last {
        let Some(chunk) = table.get((ino, index))? else {
            continue;
        };
        let data = chunk.value();
        let chunk_start = index * CHUNK_SIZE;
        let copy_from = offset.max(chunk_start);
        let copy_to = end.min(chunk_start + data.len() as u64);
        if copy_from >= copy_to {
            continue;
        }
        let src = &data[(copy_from - chunk_start) as usize..(copy_to - chunk_start) as usize];
        out[(copy_from - offset) as usize..(copy_to - offset) as usize].copy_from_slice(src);
    }
    Ok(out)
}

fn xattr_get(
    table: &impl ReadableTable<(u64, &'static str), &'static [u8]>,
    ino: u64,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    Ok(table.get((ino, name))?.map(|v| v.value().to_vec()))
}

fn xattr_list(
    table: &impl ReadableTable<(u64, &'static str), &'static [u8]>,
    ino: u64,
) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in table.range((ino, "")..)? {
        let (key, _) = entry?;
        let (entry_ino, name) = key.value();
        if entry_ino != ino {
            break;
        }
        names.push(name.to_string());
    }
    Ok(names)
}

macro_rules! impl_layer_view {
    ($ty:ty) => {
        impl LayerView for $ty {
            fn inode(&self, ino: u64) -> Result<Option<(InodeRecord, Layer)>> {
                load_inode(&self.delta_inodes, &self.base_inodes, ino)
            }

            fn child(&self, parent: u64, name: &str) -> Result<Option<u64>> {
                dirs::lookup_child(
                    &self.delta_dirs,
                    &self.base_dirs,
                    &self.whiteouts,
                    parent,
                    name,
                )
            }

            fn list_dir(&self, parent: u64) -> Result<Vec<(String, u64)>> {
                dirs::list_union(&self.delta_dirs, &self.base_dirs, &self.whiteouts, parent)
            }

            fn has_live_child(&self, parent: u64) -> Result<bool> {
                dirs::has_live_child(&self.delta_dirs, &self.base_dirs, &self.whiteouts, parent)
            }

            fn symlink_target(&self, ino: u64, layer: Layer) -> Result<Vec<u8>> {
                match layer {
                    Layer::Delta => symlink_from(&self.delta_symlinks, ino),
                    Layer::Base => symlink_from(&self.base_symlinks, ino),
                }
            }

            fn read_range(
                &self,
                ino: u64,
                layer: Layer,
                size: u64,
                offset: u64,
                len: u64,
            ) -> Result<Vec<u8>> {
                match layer {
                    Layer::Delta => read_chunks(&self.delta_chunks, ino, size, offset, len),
                    Layer::Base => read_chunks(&self.base_chunks, ino, size, offset, len),
                }
            }

            fn xattr(&self, ino: u64, layer: Layer, name: &str) -> Result<Option<Vec<u8>>> {
                match layer {
                    Layer::Delta => xattr_get(&self.delta_xattrs, ino, name),
                    Layer::Base => xattr_get(&self.base_xattrs, ino, name),
                }
            }

            fn xattr_names(&self, ino: u64, layer: Layer) -> Result<Vec<String>> {
                match layer {
                    Layer::Delta => xattr_list(&self.delta_xattrs, ino),
                    Layer::Base => xattr_list(&self.base_xattrs, ino),
                }
            }
        }
    };
}

/// Snapshot view for read-only operations.
pub(crate) struct ReadView {
    base_inodes: ReadOnlyTable<u64, &'static [u8]>,
    delta_inodes: ReadOnlyTable<u64, &'static [u8]>,
    base_dirs: ReadOnlyTable<(u64, &'static str), u64>,
    delta_dirs: ReadOnlyTable<(u64, &'static str), u64>,
    whiteouts: ReadOnlyTable<(u64, &'static str), ()>,
    base_chunks: ReadOnlyTable<(u64, u64), &'static [u8]>,
    delta_chunks: ReadOnlyTable<(u64, u64), &'static [u8]>,
    base_xattrs: ReadOnlyTable<(u64, &'static str), &'static [u8]>,
    delta_xattrs: ReadOnlyTable<(u64, &'static str), &'static [u8]>,
    base_symlinks: ReadOnlyTable<u64, &'static [u8]>,
    delta_symlinks: ReadOnlyTable<u64, &'static [u8]>,
}

impl_layer_view!(ReadView);

impl ReadView {
    pub fn new(txn: &redb::ReadTransaction) -> Result<Self> {
        Ok(ReadView {
            base_inodes: txn.open_table(store::BASE_INODES)?,
            delta_inodes: txn.open_table(store::DELTA_INODES)?,
            base_dirs: txn.open_table(store::BASE_DIRS)?,
            delta_dirs: txn.open_table(store::DELTA_DIRS)?,
            whiteouts: txn.open_table(store::WHITEOUTS)?,
            base_chunks: txn.open_table(store::BASE_CHUNKS)?,
            delta_chunks: txn.open_table(store::DELTA_CHUNKS)?,
            base_xattrs: txn.open_table(store::BASE_XATTRS)?,
            delta_xattrs: txn.open_table(store::DELTA_XATTRS)?,
            base_symlinks: txn.open_table(store::BASE_SYMLINKS)?,
            delta_symlinks: txn.open_table(store::DELTA_SYMLINKS)?,
        })
    }

    /// Whole-filesystem accounting: one logical inode per id (delta
    /// shadows base), logical size per inode.
    pub fn usage(&self) -> Result<(u64, u64)> {
        let mut bytes = 0u64;
        let mut inodes = 0u64;
        for entry in self.delta_inodes.iter()? {
            let (_, bytes_guard) = entry?;
            let rec = InodeRecord::decode(bytes_guard.value())?;
            bytes += rec.size;
            inodes += 1;
        }
        for entry in self.base_inodes.iter()? {
            let (key, bytes_guard) = entry?;
            if self.delta_inodes.get(key.value())?.is_some() {
                continue;
            }
            let rec = InodeRecord::decode(bytes_guard.value())?;
            bytes += rec.size;
            inodes += 1;
        }
        Ok((bytes, inodes))
    }
}

/// Mutable view for one write transaction.
pub(crate) struct WriteView<'txn> {
    base_inodes: Table<'txn, u64, &'static [u8]>,
    delta_inodes: Table<'txn, u64, &'static [u8]>,
    base_dirs: Table<'txn, (u64, &'static str), u64>,
    delta_dirs: Table<'txn, (u64, &'static str), u64>,
    whiteouts: Table<'txn, (u64, &'static str), ()>,
    base_chunks: Table<'txn, (u64, u64), &'static [u8]>,
    delta_chunks: Table<'txn, (u64, u64), &'static [u8]>,
    base_xattrs: Table<'txn, (u64, &'static str), &'static [u8]>,
    delta_xattrs: Table<'txn, (u64, &'static str), &'static [u8]>,
    base_symlinks: Table<'txn, u64, &'static [u8]>,
    delta_symlinks: Table<'txn, u64, &'static [u8]>,
}

impl_layer_view!(WriteView<'_>);

impl<'txn> WriteView<'txn> {
    pub fn new(txn: &'txn redb::WriteTransaction) -> Result<Self> {
        Ok(WriteView {
            base_inodes: txn.open_table(store::BASE_INODES)?,
            delta_inodes: txn.open_table(store::DELTA_INODES)?,
            base_dirs: txn.open_table(store::BASE_DIRS)?,
            delta_dirs: txn.open_table(store::DELTA_DIRS)?,
            whiteouts: txn.open_table(store::WHITEOUTS)?,
            base_chunks: txn.open_table(store::BASE_CHUNKS)?,
            delta_chunks: txn.open_table(store::DELTA_CHUNKS)?,
            base_xattrs: txn.open_table(store::BASE_XATTRS)?,
            delta_xattrs: txn.open_table(store::DELTA_XATTRS)?,
            base_symlinks: txn.open_table(store::BASE_SYMLINKS)?,
            delta_symlinks: txn.open_table(store::DELTA_SYMLINKS)?,
        })
    }

    pub fn delta_inode(&self, ino: u64) -> Result<Option<InodeRecord>> {
        match self.delta_inodes.get(ino)? {
            Some(bytes) => Ok(Some(InodeRecord::decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    pub fn base_inode(&self, ino: u64) -> Result<Option<InodeRecord>> {
        match self.base_inodes.get(ino)? {
            Some(bytes) => Ok(Some(InodeRecord::decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    pub fn put_delta_inode(&mut self, ino: u64, rec: &InodeRecord) -> Result<()> {
        self.delta_inodes.insert(ino, rec.encode().as_slice())?;
        Ok(())
    }

    pub fn remove_delta_inode(&mut self, ino: u64) -> Result<()> {
        self.delta_inodes.remove(ino)?;
        Ok(())
    }

    pub fn delta_entry(&self, parent: u64, name: &str) -> Result<Option<u64>> {
        Ok(self.delta_dirs.get((parent, name))?.map(|v| v.value()))
    }

    pub fn base_entry(&self, parent: u64, name: &str) -> Result<Option<u64>> {
        Ok(self.base_dirs.get((parent, name))?.map(|v| v.value()))
    }

    /// Bind `name` to `child` in the delta. Clears any whiteout at the
    /// same key, upholding the at-most-one-of invariant.
    pub fn link_delta_entry(&mut self, parent: u64, name: &str, child: u64) -> Result<()> {
        self.whiteouts.remove((parent, name))?;
        self.delta_dirs.insert((parent, name), child)?;
        Ok(())
    }

    /// Remove the logical binding `(parent, name)`: drop the delta entry
    /// when present and white out the base entry when one would otherwise
    /// become visible again.
    pub fn unlink_binding(&mut self, parent: u64, name: &str) -> Result<()> {
        self.delta_dirs.remove((parent, name))?;
        if self.base_dirs.get((parent, name))?.is_some() {
            self.whiteouts.insert((parent, name), ())?;
        }
        Ok(())
    }

    /// Drop every whiteout recorded under a directory inode. Called when
    /// the directory itself goes away; the whiteouts cannot be reached
    /// through any path afterwards.
    pub fn purge_whiteouts_of(&mut self, dir_ino: u64) -> Result<()> {
        let mut names = Vec::new();
        for entry in self.whiteouts.range((dir_ino, "")..)? {
            let (key, _) = entry?;
            let (entry_ino, name) = key.value();
            if entry_ino != dir_ino {
                break;
            }
            names.push(name.to_string());
        }
        for name in names {
            self.whiteouts.remove((dir_ino, name.as_str()))?;
        }
        Ok(())
    }

    /// Write `data` at `offset` into the delta content of `ino`,
    /// read-modify-writing the affected chunks.
    pub fn write_range(&mut self, ino: u64, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64;
        let first = offset / CHUNK_SIZE;
        let last = (end - 1) / CHUNK_SIZE;
        for index in first..=last {
            let chunk_start = index * CHUNK_SIZE;
            let copy_from = offset.max(chunk_start);
            let copy_to = end.min(chunk_start + CHUNK_SIZE);

            let mut chunk = match self.delta_chunks.get((ino, index))? {
                Some(existing) => existing.value().to_vec(),
                None => Vec::new(),
            };
            let needed = (copy_to - chunk_start) as usize;
            if chunk.len() < needed {
                chunk.resize(needed, 0);
            }
            let src_from = (copy_from - offset) as usize;
            let src_to = (copy_to - offset) as usize;
            chunk[(copy_from - chunk_start) as usize..needed]
                .copy_from_slice(&data[src_from..src_to]);
            self.delta_chunks.insert((ino, index), chunk.as_slice())?;
        }
        Ok(())
    }

    /// Shrink the delta content of `ino` to `new_size`: drop chunks past
    /// the end and trim the final partial chunk so regrown files read as
    /// zeros.
    pub fn truncate_content(&mut self, ino: u64, new_size: u64) -> Result<()> {
        let keep_chunks = new_size.div_ceil(CHUNK_SIZE);
        let mut doomed = Vec::new();
        for entry in self.delta_chunks.range((ino, keep_chunks)..)? {
            let (key, _) = entry?;
            let (entry_ino, index) = key.value();
            if entry_ino != ino {
                break;
            }
            doomed.push(index);
        }
        for index in doomed {
            self.delta_chunks.remove((ino, index))?;
        }

        if new_size % CHUNK_SIZE != 0 && keep_chunks > 0 {
            let tail_index = keep_chunks - 1;
            let tail_keep = (new_size - tail_index * CHUNK_SIZE) as usize;
            let tail = self
                .delta_chunks
                .get((ino, tail_index))?
                .map(|v| v.value().to_vec());
            if let Some(mut tail) = tail {
                if tail.len() > tail_keep {
                    tail.truncate(tail_keep);
                    self.delta_chunks.insert((ino, tail_index), tail.as_slice())?;
                }
            }
        }
        Ok(())
    }

    /// Delete the delta record and every delta payload of `ino`. Used when
    /// the stored link count reaches zero.
    pub fn remove_delta_object(&mut self, ino: u64) -> Result<()> {
        self.remove_delta_inode(ino)?;
        self.truncate_content(ino, 0)?;
        self.delta_symlinks.remove(ino)?;

        let mut names = Vec::new();
        for entry in self.delta_xattrs.range((ino, "")..)? {
            let (key, _) = entry?;
            let (entry_ino, name) = key.value();
            if entry_ino != ino {
                break;
            }
            names.push(name.to_string());
        }
        for name in names {
            self.delta_xattrs.remove((ino, name.as_str()))?;
        }
        Ok(())
    }

    /// Copy the base payload of `ino` (chunks, symlink target, xattrs)
    /// into the delta tables. The record itself is written by the caller.
    pub fn copy_base_payload(&mut self, ino: u64) -> Result<()> {
        let mut chunks = Vec::new();
        for entry in self.base_chunks.range((ino, 0)..)? {
            let (key, value) = entry?;
            let (entry_ino, index) = key.value();
            if entry_ino != ino {
                break;
            }
            chunks.push((index, value.value().to_vec()));
        }
        for (index, data) in chunks {
            self.delta_chunks.insert((ino, index), data.as_slice())?;
        }

        if let Some(target) = self.base_symlinks.get(ino)? {
            let target = target.value().to_vec();
            self.delta_symlinks.insert(ino, target.as_slice())?;
        }

        let mut xattrs = Vec::new();
        for entry in self.base_xattrs.range((ino, "")..)? {
            let (key, value) = entry?;
            let (entry_ino, name) = key.value();
            if entry_ino != ino {
                break;
            }
            xattrs.push((name.to_string(), value.value().to_vec()));
        }
        for (name, value) in xattrs {
            self.delta_xattrs
                .insert((ino, name.as_str()), value.as_slice())?;
        }
        Ok(())
    }

    pub fn put_delta_symlink(&mut self, ino: u64, target: &[u8]) -> Result<()> {
        self.delta_symlinks.insert(ino, target)?;
        Ok(())
    }

    pub fn set_delta_xattr(&mut self, ino: u64, name: &str, value: &[u8]) -> Result<()> {
        self.delta_xattrs.insert((ino, name), value)?;
        Ok(())
    }

    pub fn remove_delta_xattr(&mut self, ino: u64, name: &str) -> Result<bool> {
        Ok(self.delta_xattrs.remove((ino, name))?.is_some())
    }
}
