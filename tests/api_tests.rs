//! Surface-level API behavior: error taxonomy, persistence across
//! reopen, durability, cancellation, and concurrent callers.

mod common;

use agentfs::{AgentFs, FsError, MountConfig, Provenance};
use common::{memory_fs, seed_base_tree, seeded_fs};

#[test]
fn test_error_taxonomy_maps_to_stable_errnos() {
    let fs = seeded_fs();

    let enoent = fs.stat("/missing").unwrap_err();
    assert_eq!(enoent.errno(), libc::ENOENT);

    let eexist = fs.mkdir("/docs", 0o755).unwrap_err();
    assert_eq!(eexist.errno(), libc::EEXIST);

    let enotdir = fs.readdir("/a.txt").unwrap_err();
    assert_eq!(enotdir.errno(), libc::ENOTDIR);

    let eisdir = fs.read("/docs", 0, 1).unwrap_err();
    assert_eq!(eisdir.errno(), libc::EISDIR);

    let enotempty = fs.rmdir("/docs").unwrap_err();
    assert_eq!(enotempty.errno(), libc::ENOTEMPTY);

    let einval = fs.stat("relative").unwrap_err();
    assert_eq!(einval.errno(), libc::EINVAL);

    let toolong = fs.stat(&format!("/{}", "n".repeat(300))).unwrap_err();
    assert_eq!(toolong.errno(), libc::ENAMETOOLONG);

    let eperm = fs.link("/docs", "/d2").unwrap_err();
    assert_eq!(eperm.errno(), libc::EPERM);
}

#[test]
fn test_walk_through_file_component_is_enotdir() {
    let fs = seeded_fs();
    assert!(matches!(
        fs.stat("/a.txt/inside"),
        Err(FsError::NotDirectory(_))
    ));
}

#[test]
fn test_unlink_of_directory_is_eisdir() {
    let fs = seeded_fs();
    assert!(matches!(fs.unlink("/docs"), Err(FsError::IsDirectory(_))));
}

#[test]
fn test_root_cannot_be_removed_or_renamed() {
    let fs = seeded_fs();
    assert!(fs.remove("/").is_err());
    assert!(fs.rename("/", "/elsewhere").is_err());
    assert!(fs.rename("/docs", "/").is_err());
}

#[test]
fn test_persistence_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("overlay.db");
    let config = MountConfig::at_path(path.to_string_lossy());

    let seeded_ino;
    let delta_ino;
    {
        let fs = AgentFs::open(&config).unwrap();
        seed_base_tree(&fs);
        seeded_ino = fs.stat("/a.txt").unwrap().ino;
        fs.write("/a.txt", 5, b" world").unwrap();
        fs.write_file("/fresh.txt", b"delta-native").unwrap();
        delta_ino = fs.stat("/fresh.txt").unwrap().ino;
        fs.fsync("/a.txt").unwrap();
    }

    let fs = AgentFs::open(&config).unwrap();
    assert_eq!(fs.stat("/a.txt").unwrap().ino, seeded_ino);
    assert_eq!(
        fs.provenance("/a.txt").unwrap(),
        Provenance::CopiedUp {
            origin_ino: seeded_ino
        }
    );
    assert_eq!(fs.read("/a.txt", 0, 32).unwrap(), b"hello world");
    assert_eq!(fs.stat("/fresh.txt").unwrap().ino, delta_ino);
    assert_eq!(fs.read("/fresh.txt", 0, 32).unwrap(), b"delta-native");

    // The allocator resumes above everything already assigned.
    fs.write_file("/post-reopen.txt", b"x").unwrap();
    let new_ino = fs.stat("/post-reopen.txt").unwrap().ino;
    assert!(new_ino > delta_ino);
}

#[test]
fn test_statfs_accounts_bytes_and_inodes() {
    let fs = memory_fs();
    fs.seed(|b| {
        b.file("/blob", 0o644, &[7u8; 1000])?;
        Ok(())
    })
    .unwrap();
    fs.write_file("/small", b"abc").unwrap();

    let stats = fs.statfs().unwrap();
    // Root dir + seeded blob + delta file.
    assert_eq!(stats.inodes, 3);
    assert_eq!(stats.bytes_used, 1003);
}

#[test]
fn test_fsync_of_missing_path_fails() {
    let fs = memory_fs();
    assert!(matches!(fs.fsync("/nope"), Err(FsError::NotFound(_))));
    fs.write_file("/real", b"x").unwrap();
    fs.fsync("/real").unwrap();
}

#[test]
fn test_cancel_token_stops_subsequent_calls() {
    let fs = seeded_fs();
    let token = fs.cancel_token();
    fs.stat("/a.txt").unwrap();

    token.cancel();
    assert!(matches!(fs.stat("/a.txt"), Err(FsError::Canceled)));
    assert!(matches!(
        fs.write("/a.txt", 0, b"x"),
        Err(FsError::Canceled)
    ));

    token.reset();
    assert!(fs.stat("/a.txt").is_ok());
}

#[test]
fn test_paths_normalize_before_resolution() {
    let fs = seeded_fs();
    let plain = fs.stat("/docs/guide.md").unwrap();
    assert_eq!(fs.stat("//docs//guide.md").unwrap().ino, plain.ino);
    assert_eq!(fs.stat("/docs/./guide.md").unwrap().ino, plain.ino);
    assert_eq!(
        fs.stat("/docs/archive/../guide.md").unwrap().ino,
        plain.ino
    );
}

#[test]
fn test_concurrent_readers_and_writer() {
    let fs = seeded_fs();
    std::thread::scope(|scope| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let stat = fs.stat("/a.txt").expect("binding stays resolvable");
                        assert!(stat.size >= 5);
                        let content = fs.read("/a.txt", 0, 5).unwrap();
                        assert_eq!(&content, b"hello", "prefix is never mutated");
                    }
                })
            })
            .collect();

        let writer = scope.spawn(|| {
            for i in 0..50u64 {
                fs.write("/a.txt", 5, format!(" v{i}").as_bytes()).unwrap();
            }
        });

        for r in readers {
            r.join().unwrap();
        }
        writer.join().unwrap();
    });

    let ino_before = fs.stat("/a.txt").unwrap().ino;
    assert_eq!(
        fs.provenance("/a.txt").unwrap(),
        Provenance::CopiedUp {
            origin_ino: ino_before
        }
    );
}

#[test]
fn test_concurrent_writers_serialize() {
    let fs = memory_fs();
    fs.write_file("/counter", b"").unwrap();
    std::thread::scope(|scope| {
        for t in 0..4u64 {
            let fs = &fs;
            scope.spawn(move || {
                for i in 0..10u64 {
                    let offset = (t * 10 + i) * 2;
                    fs.write("/counter", offset, b"ab").unwrap();
                }
            });
        }
    });
    let stat = fs.stat("/counter").unwrap();
    assert_eq!(stat.size, 80);
    let content = fs.read("/counter", 0, 80).unwrap();
    assert!(content.chunks(2).all(|pair| pair == b"ab"));
}

#[test]
fn test_config_round_trip_through_json() {
    let json = r#"{"path": ":memory:", "cache": {"enabled": true, "max_entries": 128}}"#;
    let config: MountConfig = serde_json::from_str(json).unwrap();
    let fs = AgentFs::open(&config).unwrap();
    fs.write_file("/ok", b"1").unwrap();
    assert!(fs.cache_stats().is_some());
}
