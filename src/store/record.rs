//! Packed on-disk inode records.
//!
//! Every inode in either layer is stored as a fixed-width little-endian
//! record. The layout is part of the external storage format and must not
//! change without bumping `META/version`:
//!
//! ```text
//! mode:u32 uid:u32 gid:u32 nlink:u32 size:u64
//! atime:i64 mtime:i64 ctime:i64 provenance:u8 origin_ino:u64
//! ```

use crate::error::{FsError, Result};

/// Encoded size of an [`InodeRecord`].
pub const RECORD_LEN: usize = 57;

const PROVENANCE_BASE: u8 = 0;
const PROVENANCE_DELTA: u8 = 1;
const PROVENANCE_COPIED_UP: u8 = 2;

/// Which layer an inode record is native to, and for copied-up records,
/// the base id it retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Seeded into the immutable base layer.
    Base,
    /// Created in the delta layer after mount.
    Delta,
    /// Materialized into the delta by copy-up, keyed at its base id.
    CopiedUp { origin_ino: u64 },
}

/// Decoded inode record shared by both layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub provenance: Provenance,
}

impl InodeRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..4].copy_from_slice(&self.mode.to_le_bytes());
        buf[4..8].copy_from_slice(&self.uid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.gid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.nlink.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.atime.to_le_bytes());
        buf[32..40].copy_from_slice(&self.mtime.to_le_bytes());
        buf[40..48].copy_from_slice(&self.ctime.to_le_bytes());
        let (tag, origin) = match self.provenance {
            Provenance::Base => (PROVENANCE_BASE, 0),
            Provenance::Delta => (PROVENANCE_DELTA, 0),
            Provenance::CopiedUp { origin_ino } => (PROVENANCE_COPIED_UP, origin_ino),
        };
        buf[48] = tag;
        buf[49..57].copy_from_slice(&origin.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_LEN {
            return Err(FsError::Corruption(format!(
                "inode record has {} bytes, expected {}",
                bytes.len(),
                RECORD_LEN
            )));
        }
        let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        let i64_at = |off: usize| i64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());

        let origin_ino = u64_at(49);
        let provenance = match bytes[48] {
            PROVENANCE_BASE => Provenance::Base,
            PROVENANCE_DELTA => Provenance::Delta,
            PROVENANCE_COPIED_UP => Provenance::CopiedUp { origin_ino },
            tag => {
                return Err(FsError::Corruption(format!(
                    "unknown provenance tag {tag}"
                )))
            }
        };

        Ok(InodeRecord {
            mode: u32_at(0),
            uid: u32_at(4),
            gid: u32_at(8),
            nlink: u32_at(12),
            size: u64_at(16),
            atime: i64_at(24),
            mtime: i64_at(32),
            ctime: i64_at(40),
            provenance,
        })
    }
}
