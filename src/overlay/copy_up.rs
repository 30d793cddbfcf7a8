//! Copy-up: materializing base-layer objects into the delta.
//!
//! The central contract is inode stability: the delta record is written at
//! the *same id* as the base record, marked `CopiedUp { origin_ino }`, so
//! `stat` keeps returning the id external inode caches already hold. Base
//! ids are reserved below the allocator at seed time, which is what makes
//! keying the copy at the base id collision-free.
//!
//! Everything here runs inside the caller's write transaction; a failure
//! aborts that transaction and leaves both layers untouched.

use crate::error::{FsError, Result};
use crate::overlay::view::WriteView;
use crate::store::record::{InodeRecord, Provenance};

/// Ensure `ino` has a delta record, copying it up from the base if needed,
/// and return the current delta record.
///
/// `parent_link` is the directory binding through which the caller reached
/// the inode. When the parent itself has a delta record and the binding
/// only exists in the base, a matching delta entry is inserted so the
/// delta directory store is self-contained for that parent; otherwise the
/// base entry keeps resolving to the unchanged id.
pub(crate) fn ensure_delta(
    view: &mut WriteView,
    ino: u64,
    parent_link: Option<(u64, &str)>,
) -> Result<InodeRecord> {
    if let Some(rec) = view.delta_inode(ino)? {
        return Ok(rec);
    }

    let base = view
        .base_inode(ino)?
        .ok_or_else(|| FsError::Corruption(format!("inode {ino} missing from both layers")))?;

    let mut rec = base;
    rec.provenance = Provenance::CopiedUp { origin_ino: ino };

    // Files copy their chunks, symlinks their target, and every kind its
    // xattrs. Directories carry no content: their entries stay where they
    // are and the union view keeps composing them.
    view.copy_base_payload(ino)?;
    view.put_delta_inode(ino, &rec)?;

    if let Some((parent, name)) = parent_link {
        if view.delta_inode(parent)?.is_some()
            && view.base_entry(parent, name)?.is_some()
            && view.delta_entry(parent, name)?.is_none()
        {
            view.link_delta_entry(parent, name, ino)?;
        }
    }

    tracing::debug!(ino, "copied up");
    Ok(rec)
}

/// Copy up a directory's record (content-free) and stamp its modification
/// times. Used when an entry is added to or removed from the directory.
pub(crate) fn touch_dir(view: &mut WriteView, dir_ino: u64, now: i64) -> Result<()> {
    let mut rec = ensure_delta(view, dir_ino, None)?;
    rec.mtime = now;
    rec.ctime = now;
    view.put_delta_inode(dir_ino, &rec)
}
