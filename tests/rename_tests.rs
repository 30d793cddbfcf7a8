//! Rename semantics across layers: id preservation, whiteouts over base
//! bindings, destination replacement, and directory subtree moves.

mod common;

use agentfs::{FsError, Provenance};
use common::{names, seeded_fs};

#[test]
fn test_rename_preserves_ino_and_hides_source() {
    let fs = seeded_fs();
    let before = fs.stat("/a.txt").unwrap();

    fs.rename("/a.txt", "/renamed.txt").unwrap();

    assert!(matches!(fs.stat("/a.txt"), Err(FsError::NotFound(_))));
    let after = fs.stat("/renamed.txt").unwrap();
    assert_eq!(after.ino, before.ino);
    assert_eq!(fs.read("/renamed.txt", 0, 16).unwrap(), b"hello");
}

#[test]
fn test_rename_base_file_leaves_whiteout() {
    let fs = seeded_fs();
    fs.rename("/b.txt", "/docs/b.txt").unwrap();

    // The base binding under the root is hidden, not merely shadowed.
    assert!(!names(&fs, "/").contains(&"b.txt".to_string()));
    assert!(names(&fs, "/docs").contains(&"b.txt".to_string()));
}

#[test]
fn test_rename_over_existing_file_replaces_it() {
    let fs = seeded_fs();
    let src = fs.stat("/a.txt").unwrap();

    fs.rename("/a.txt", "/b.txt").unwrap();

    let dst = fs.stat("/b.txt").unwrap();
    assert_eq!(dst.ino, src.ino);
    assert_eq!(fs.read("/b.txt", 0, 16).unwrap(), b"hello");
    assert!(matches!(fs.stat("/a.txt"), Err(FsError::NotFound(_))));
}

#[test]
fn test_rename_over_nonempty_dir_fails() {
    let fs = seeded_fs();
    fs.mkdir("/empty", 0o755).unwrap();
    assert!(matches!(
        fs.rename("/empty", "/docs"),
        Err(FsError::NotEmpty(_))
    ));
    // Nothing moved.
    assert!(fs.stat("/empty").is_ok());
    assert!(fs.stat("/docs/guide.md").is_ok());
}

#[test]
fn test_rename_dir_over_empty_dir_succeeds() {
    let fs = seeded_fs();
    fs.mkdir("/spare", 0o755).unwrap();
    let docs = fs.stat("/docs").unwrap();

    fs.rename("/docs", "/spare").unwrap();

    assert_eq!(fs.stat("/spare").unwrap().ino, docs.ino);
    assert!(fs.stat("/spare/guide.md").is_ok());
    assert!(matches!(fs.stat("/docs"), Err(FsError::NotFound(_))));
}

#[test]
fn test_rename_file_over_dir_fails() {
    let fs = seeded_fs();
    assert!(matches!(
        fs.rename("/a.txt", "/docs"),
        Err(FsError::IsDirectory(_))
    ));
}

#[test]
fn test_rename_dir_over_file_fails() {
    let fs = seeded_fs();
    assert!(matches!(
        fs.rename("/docs", "/a.txt"),
        Err(FsError::NotDirectory(_))
    ));
}

#[test]
fn test_rename_missing_source_fails() {
    let fs = seeded_fs();
    assert!(matches!(
        fs.rename("/nope", "/dst"),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn test_rename_into_own_subtree_fails() {
    let fs = seeded_fs();
    assert!(matches!(
        fs.rename("/docs", "/docs/archive/docs"),
        Err(FsError::InvalidArgument(_))
    ));
}

#[test]
fn test_rename_directory_moves_subtree() {
    let fs = seeded_fs();
    let dir_ino = fs.stat("/docs").unwrap().ino;
    let nested_ino = fs.stat("/docs/archive/old.md").unwrap().ino;

    fs.rename("/docs", "/papers").unwrap();

    assert_eq!(fs.stat("/papers").unwrap().ino, dir_ino);
    assert_eq!(
        fs.provenance("/papers").unwrap(),
        Provenance::CopiedUp {
            origin_ino: dir_ino
        }
    );
    // Children resolve through the unchanged directory id; their records
    // are untouched.
    assert_eq!(fs.stat("/papers/archive/old.md").unwrap().ino, nested_ino);
    assert_eq!(fs.provenance("/papers/archive/old.md").unwrap(), Provenance::Base);
    assert!(matches!(
        fs.stat("/docs/archive/old.md"),
        Err(FsError::NotFound(_))
    ));
    assert_eq!(fs.read("/papers/guide.md", 0, 32).unwrap(), b"# guide\n");
}

#[test]
fn test_rename_within_delta_moves_entry_only() {
    let fs = seeded_fs();
    fs.write_file("/tmp1.txt", b"scratch").unwrap();
    let ino = fs.stat("/tmp1.txt").unwrap().ino;

    fs.rename("/tmp1.txt", "/tmp2.txt").unwrap();

    let moved = fs.stat("/tmp2.txt").unwrap();
    assert_eq!(moved.ino, ino);
    assert_eq!(fs.provenance("/tmp2.txt").unwrap(), Provenance::Delta);
    assert!(matches!(fs.stat("/tmp1.txt"), Err(FsError::NotFound(_))));
}

#[test]
fn test_rename_to_same_path_is_noop() {
    let fs = seeded_fs();
    let before = fs.stat("/a.txt").unwrap();
    fs.rename("/a.txt", "/a.txt").unwrap();
    let after = fs.stat("/a.txt").unwrap();
    assert_eq!(after, before);
    assert_eq!(fs.provenance("/a.txt").unwrap(), Provenance::Base);
}

#[test]
fn test_recreate_after_rename_gets_fresh_ino() {
    let fs = seeded_fs();
    let old = fs.stat("/a.txt").unwrap();
    fs.rename("/a.txt", "/moved.txt").unwrap();

    fs.write_file("/a.txt", b"replacement").unwrap();

    let fresh = fs.stat("/a.txt").unwrap();
    assert_ne!(fresh.ino, old.ino, "recreated name must mint a new id");
    assert_eq!(fs.provenance("/a.txt").unwrap(), Provenance::Delta);
    assert_eq!(fs.read("/a.txt", 0, 32).unwrap(), b"replacement");
    // The renamed-away object is unaffected.
    assert_eq!(fs.stat("/moved.txt").unwrap().ino, old.ino);
}

#[test]
fn test_rename_chain_keeps_single_identity() {
    let fs = seeded_fs();
    let ino = fs.stat("/c.txt").unwrap().ino;

    fs.rename("/c.txt", "/docs/c.txt").unwrap();
    fs.rename("/docs/c.txt", "/docs/archive/c.txt").unwrap();
    fs.rename("/docs/archive/c.txt", "/c.txt").unwrap();

    let back = fs.stat("/c.txt").unwrap();
    assert_eq!(back.ino, ino);
    assert_eq!(fs.read("/c.txt", 0, 16).unwrap(), b"charlie");
}
