//! Transactional storage backend.
//!
//! All persistent state, both layers of the overlay, lives in a single
//! redb database file (or an in-memory backend when the config path is
//! [`crate::config::MEMORY_PATH`]). redb gives us the exact transaction
//! contract the overlay needs: one serialized writer, MVCC readers that
//! run concurrently with it, and atomic durable commits.

pub mod record;
pub mod seed;

use redb::backends::InMemoryBackend;
use redb::{Database, Durability, ReadableTable, TableDefinition};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::MountConfig;
use crate::error::{FsError, Result};
use record::{InodeRecord, Provenance};

/// Reserved inode id of the filesystem root.
pub const ROOT_INO: u64 = 1;

/// On-disk format version, stored under `META/version`.
pub const FORMAT_VERSION: u64 = 1;

/// Content chunk size. Chunks are keyed `(ino, chunk_index)`; a missing
/// chunk inside a file's size reads as zeros.
pub const CHUNK_SIZE: u64 = 64 * 1024;

pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const BASE_INODES: TableDefinition<u64, &[u8]> = TableDefinition::new("inode_base");
pub const DELTA_INODES: TableDefinition<u64, &[u8]> = TableDefinition::new("inode_delta");

pub const BASE_DIRS: TableDefinition<(u64, &str), u64> = TableDefinition::new("dir_base");
pub const DELTA_DIRS: TableDefinition<(u64, &str), u64> = TableDefinition::new("dir_delta");

/// Names whose base-layer bindings have been logically removed in the delta.
pub const WHITEOUTS: TableDefinition<(u64, &str), ()> = TableDefinition::new("whiteout");

pub const BASE_CHUNKS: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("chunk_base");
pub const DELTA_CHUNKS: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("chunk_delta");

pub const BASE_XATTRS: TableDefinition<(u64, &str), &[u8]> = TableDefinition::new("xattr_base");
pub const DELTA_XATTRS: TableDefinition<(u64, &str), &[u8]> = TableDefinition::new("xattr_delta");

pub const BASE_SYMLINKS: TableDefinition<u64, &[u8]> = TableDefinition::new("sym_base");
pub const DELTA_SYMLINKS: TableDefinition<u64, &[u8]> = TableDefinition::new("sym_delta");

const META_VERSION: &str = "version";
const META_NEXT_INO: &str = "next_ino";
const META_ROOT_INO: &str = "root_ino";

/// Current time as whole seconds since the epoch.
pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Handle to the backing database.
///
/// Writers are serialized by redb; `begin_read` snapshots may run
/// concurrently with a writer and with each other.
pub struct Store {
    db: Database,
}

impl Store {
    /// Open (or create) the database described by `config`, initialize the
    /// metadata and delta root on first use, and validate the inode-id
    /// reservation invariant.
    pub fn open(config: &MountConfig) -> Result<Self> {
        let db = if config.is_in_memory() {
            Database::builder().create_with_backend(InMemoryBackend::new())?
        } else {
            Database::create(&config.path)?
        };

        let store = Store { db };
        store.initialize()?;
        store.check_id_reservation()?;
        Ok(store)
    }

    pub fn begin_read(&self) -> Result<redb::ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    pub fn begin_write(&self) -> Result<redb::WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    /// Durable barrier: an empty immediately-durable commit, so everything
    /// committed before this call has reached stable storage.
    pub fn flush(&self) -> Result<()> {
        let mut txn = self.db.begin_write()?;
        txn.set_durability(Durability::Immediate);
        txn.commit()?;
        Ok(())
    }

    /// Create every table and, on a fresh database, write the metadata keys
    /// and the delta root directory. The root always lives in the delta.
    fn initialize(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            let mut delta_inodes = txn.open_table(DELTA_INODES)?;
            txn.open_table(BASE_INODES)?;
            txn.open_table(BASE_DIRS)?;
            txn.open_table(DELTA_DIRS)?;
            txn.open_table(WHITEOUTS)?;
            txn.open_table(BASE_CHUNKS)?;
            txn.open_table(DELTA_CHUNKS)?;
            txn.open_table(BASE_XATTRS)?;
            txn.open_table(DELTA_XATTRS)?;
            txn.open_table(BASE_SYMLINKS)?;
            txn.open_table(DELTA_SYMLINKS)?;

            if meta.get(META_VERSION)?.is_none() {
                tracing::debug!("initializing fresh database");
                meta.insert(META_VERSION, FORMAT_VERSION)?;
                meta.insert(META_ROOT_INO, ROOT_INO)?;
                meta.insert(META_NEXT_INO, ROOT_INO + 1)?;

                let now = now_ts();
                let root = InodeRecord {
                    mode: libc::S_IFDIR as u32 | 0o755,
                    uid: 0,
                    gid: 0,
                    nlink: 1,
                    size: 0,
                    atime: now,
                    mtime: now,
                    ctime: now,
                    provenance: Provenance::Delta,
                };
                delta_inodes.insert(ROOT_INO, root.encode().as_slice())?;
            } else {
                let version = meta
                    .get(META_VERSION)?
                    .map(|v| v.value())
                    .unwrap_or_default();
                if version != FORMAT_VERSION {
                    return Err(FsError::Corruption(format!(
                        "unsupported format version {version}"
                    )));
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Refuse to mount a database whose id allocator could collide with a
    /// base inode id. Copy-up keys the delta record at the base id, which
    /// is only sound while every base id stays below `META/next_ino`.
    fn check_id_reservation(&self) -> Result<()> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META)?;
        let next_ino = meta
            .get(META_NEXT_INO)?
            .map(|v| v.value())
            .ok_or_else(|| FsError::Corruption("META/next_ino missing".to_string()))?;

        let base_inodes = txn.open_table(BASE_INODES)?;
        if let Some((max_ino, _)) = base_inodes.last()? {
            let max_ino = max_ino.value();
            if next_ino <= max_ino {
                return Err(FsError::Corruption(format!(
                    "next_ino {next_ino} does not clear the base layer (max base ino {max_ino})"
                )));
            }
        }
        Ok(())
    }
}

/// Read the id counter and advance it. Must be called inside the write
/// transaction that will also persist the record using the id.
pub fn alloc_ino(txn: &redb::WriteTransaction) -> Result<u64> {
    let mut meta = txn.open_table(META)?;
    let next = meta
        .get(META_NEXT_INO)?
        .map(|v| v.value())
        .ok_or_else(|| FsError::Corruption("META/next_ino missing".to_string()))?;
    meta.insert(META_NEXT_INO, next + 1)?;
    Ok(next)
}
