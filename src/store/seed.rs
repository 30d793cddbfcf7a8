//! Base-layer seeding.
//!
//! The base layer is immutable once the overlay is in use, so all of its
//! content is written up front through [`SeedBuilder`], inside a single
//! write transaction. Ids are drawn from the same `META/next_ino` counter
//! the delta uses, which is what reserves every base id below every future
//! delta allocation.

use redb::{ReadableTable, Table};

use crate::error::{FsError, Result};
use crate::store::record::{InodeRecord, Provenance};
use crate::store::{self, Store, CHUNK_SIZE, ROOT_INO};

/// Writes seeded objects into the base tables.
///
/// Obtained through [`Store::seed`]; paths are absolute, parents must be
/// seeded before their children.
pub struct SeedBuilder<'a, 'txn> {
    inodes: &'a mut Table<'txn, u64, &'static [u8]>,
    dirs: &'a mut Table<'txn, (u64, &'static str), u64>,
    chunks: &'a mut Table<'txn, (u64, u64), &'static [u8]>,
    symlinks: &'a mut Table<'txn, u64, &'static [u8]>,
    xattrs: &'a mut Table<'txn, (u64, &'static str), &'static [u8]>,
    next_ino: u64,
}

impl SeedBuilder<'_, '_> {
    /// Seed a directory, returning its inode id.
    pub fn dir(&mut self, path: &str, mode: u32) -> Result<u64> {
        let (parent, name) = self.resolve_parent(path)?;
        self.insert_object(
            parent,
            &name,
            InodeRecord {
                mode: libc::S_IFDIR as u32 | (mode & 0o7777),
                ..self.fresh_record()
            },
        )
    }

    /// Seed a regular file with the given content, returning its inode id.
    pub fn file(&mut self, path: &str, mode: u32, content: &[u8]) -> Result<u64> {
        let (parent, name) = self.resolve_parent(path)?;
        let ino = self.insert_object(
            parent,
            &name,
            InodeRecord {
                mode: libc::S_IFREG as u32 | (mode & 0o7777),
                size: content.len() as u64,
                ..self.fresh_record()
            },
        )?;
        for (index, chunk) in content.chunks(CHUNK_SIZE as usize).enumerate() {
            self.chunks.insert((ino, index as u64), chunk)?;
        }
        Ok(ino)
    }

    /// Seed a symlink pointing at `target`, returning its inode id.
    pub fn symlink(&mut self, path: &str, target: &str) -> Result<u64> {
        let (parent, name) = self.resolve_parent(path)?;
        let ino = self.insert_object(
            parent,
            &name,
            InodeRecord {
                mode: libc::S_IFLNK as u32 | 0o777,
                size: target.len() as u64,
                ..self.fresh_record()
            },
        )?;
        self.symlinks.insert(ino, target.as_bytes())?;
        Ok(ino)
    }

    /// Attach an extended attribute to an already-seeded object.
    pub fn xattr(&mut self, path: &str, name: &str, value: &[u8]) -> Result<()> {
        let (parent, base_name) = self.resolve_parent(path)?;
        let ino = self
            .child(parent, &base_name)?
            .ok_or_else(|| FsError::not_found(path))?;
        self.xattrs.insert((ino, name), value)?;
        Ok(())
    }

    fn fresh_record(&self) -> InodeRecord {
        let now = store::now_ts();
        InodeRecord {
            mode: 0,
            uid: 0,
            gid: 0,
            nlink: 1,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            provenance: Provenance::Base,
        }
    }

    fn insert_object(&mut self, parent: u64, name: &str, record: InodeRecord) -> Result<u64> {
        if self.child(parent, name)?.is_some() {
            return Err(FsError::exists(name));
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(ino, record.encode().as_slice())?;
        self.dirs.insert((parent, name), ino)?;
        Ok(ino)
    }

    fn child(&self, parent: u64, name: &str) -> Result<Option<u64>> {
        Ok(self.dirs.get((parent, name))?.map(|v| v.value()))
    }

    /// Split an absolute path into its parent directory's inode and the
    /// final component, walking the base directory table.
    fn resolve_parent(&self, path: &str) -> Result<(u64, String)> {
        let components = split_path(path)?;
        let (name, parents) = components
            .split_last()
            .ok_or_else(|| FsError::InvalidArgument("cannot seed the root".to_string()))?;

        let mut cur = ROOT_INO;
        for comp in parents {
            let child = self
                .child(cur, comp)?
                .ok_or_else(|| FsError::not_found(path))?;
            let bytes = self
                .inodes
                .get(child)?
                .ok_or_else(|| FsError::Corruption(format!("dangling base entry for {comp}")))?;
            let rec = InodeRecord::decode(bytes.value())?;
            if rec.mode & libc::S_IFMT as u32 != libc::S_IFDIR as u32 {
                return Err(FsError::NotDirectory(comp.clone()));
            }
            cur = child;
        }
        Ok((cur, name.clone()))
    }
}

fn split_path(path: &str) -> Result<Vec<String>> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument(format!(
            "seed path must be absolute: {path}"
        )));
    }
    let mut components = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" => {}
            "." | ".." => {
                return Err(FsError::InvalidArgument(format!(
                    "dot components not allowed in seed paths: {path}"
                )))
            }
            _ => {
                if comp.len() > 255 {
                    return Err(FsError::NameTooLong(comp.to_string()));
                }
                components.push(comp.to_string());
            }
        }
    }
    Ok(components)
}

impl Store {
    /// Populate the base layer inside one transaction.
    ///
    /// Fails with `InvalidArgument` once the delta has diverged: a late
    /// base id would slip under already-allocated delta ids and void the
    /// reservation that keeps copy-up sound.
    pub fn seed<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut SeedBuilder) -> Result<()>,
    {
        let txn = self.begin_write()?;
        let next_ino = {
            let delta_inodes = txn.open_table(store::DELTA_INODES)?;
            let delta_dirs = txn.open_table(store::DELTA_DIRS)?;
            let whiteouts = txn.open_table(store::WHITEOUTS)?;
            use redb::ReadableTableMetadata;
            let diverged = delta_inodes.len()? > 1 || !delta_dirs.is_empty()? || !whiteouts.is_empty()?;
            if diverged {
                return Err(FsError::InvalidArgument(
                    "cannot seed the base layer after the delta has diverged".to_string(),
                ));
            }

            let mut inodes = txn.open_table(store::BASE_INODES)?;
            let mut dirs = txn.open_table(store::BASE_DIRS)?;
            let mut chunks = txn.open_table(store::BASE_CHUNKS)?;
            let mut symlinks = txn.open_table(store::BASE_SYMLINKS)?;
            let mut xattrs = txn.open_table(store::BASE_XATTRS)?;

            let start_ino = {
                let meta = txn.open_table(store::META)?;
                let value = meta
                    .get("next_ino")?
                    .map(|v| v.value())
                    .ok_or_else(|| FsError::Corruption("META/next_ino missing".to_string()))?;
                value
            };

            let mut builder = SeedBuilder {
                inodes: &mut inodes,
                dirs: &mut dirs,
                chunks: &mut chunks,
                symlinks: &mut symlinks,
                xattrs: &mut xattrs,
                next_ino: start_ino,
            };
            f(&mut builder)?;
            let next_ino = builder.next_ino;

            let mut meta = txn.open_table(store::META)?;
            meta.insert("next_ino", next_ino)?;
            next_ino
        };
        txn.commit()?;
        tracing::debug!(next_ino, "seeded base layer");
        Ok(())
    }
}
