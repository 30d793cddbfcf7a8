use serde::Serialize;

use crate::error::{FsError, Result};
use crate::store::record::InodeRecord;

/// Kind of a filesystem object, derived from the record's mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

pub(crate) fn kind_from_mode(mode: u32) -> Result<FileKind> {
    match mode & libc::S_IFMT as u32 {
        x if x == libc::S_IFREG as u32 => Ok(FileKind::File),
        x if x == libc::S_IFDIR as u32 => Ok(FileKind::Dir),
        x if x == libc::S_IFLNK as u32 => Ok(FileKind::Symlink),
        other => Err(FsError::Corruption(format!(
            "unsupported file type bits {other:#o}"
        ))),
    }
}

/// Attributes returned by `stat`/`lstat`.
///
/// `ino` is the stable id: it survives copy-up and changes only when the
/// path is unlinked or renamed away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub ino: u64,
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    pub(crate) fn from_record(ino: u64, rec: &InodeRecord) -> Result<Self> {
        Ok(FileStat {
            ino,
            kind: kind_from_mode(rec.mode)?,
            mode: rec.mode,
            uid: rec.uid,
            gid: rec.gid,
            nlink: rec.nlink,
            size: rec.size,
            atime: rec.atime,
            mtime: rec.mtime,
            ctime: rec.ctime,
        })
    }
}

/// One entry of a directory listing. `.` and `..` are synthesized by the
/// enumeration caller, never stored or returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
    pub ino: u64,
}

/// Whole-filesystem accounting returned by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatFs {
    pub bytes_used: u64,
    pub inodes: u64,
}

/// Lookup-cache counters. `hit_rate` is derived; when the cache is
/// disabled the API reports no stats at all rather than zeros.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(
            kind_from_mode(libc::S_IFREG as u32 | 0o644).unwrap(),
            FileKind::File
        );
        assert_eq!(
            kind_from_mode(libc::S_IFDIR as u32 | 0o755).unwrap(),
            FileKind::Dir
        );
        assert_eq!(
            kind_from_mode(libc::S_IFLNK as u32 | 0o777).unwrap(),
            FileKind::Symlink
        );
        assert!(kind_from_mode(libc::S_IFSOCK as u32).is_err());
    }
}
