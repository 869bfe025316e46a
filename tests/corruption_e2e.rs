//! Corruption rejection, process locking, and lifecycle edge cases.

use tempfile::tempdir;

use vantage_db::{Database, DbConfig, DbError, DocType, MetadataRecord, Metric};

fn build_db(path: &std::path::Path, n: usize) {
    let db = Database::create(
        path,
        DbConfig::new(8)
            .metric(Metric::L2)
            .hnsw_ef_construction(60)
            .seed(5),
    )
    .unwrap();
    for i in 0..n {
        db.insert(
            &[i as f32, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
            MetadataRecord::new(DocType::Note, format!("n/{i}")),
        )
        .unwrap();
    }
    db.close().unwrap();
}

fn file_snapshot(dir: &std::path::Path) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            (
                e.file_name().to_string_lossy().into_owned(),
                e.metadata().unwrap().len(),
            )
        })
        .collect();
    entries.sort();
    entries
}

#[test]
fn zeroed_arena_magic_is_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    build_db(&path, 10);

    // Zero the first 8 bytes of vectors.bin.
    let vectors = path.join("vectors.bin");
    let mut bytes = std::fs::read(&vectors).unwrap();
    bytes[0..8].fill(0);
    std::fs::write(&vectors, &bytes).unwrap();

    let before = file_snapshot(&path);
    let result = Database::open(&path);
    assert!(matches!(result, Err(DbError::Corruption(_))), "{result:?}");

    // No handle was produced and the filesystem is untouched.
    assert_eq!(file_snapshot(&path), before);
}

#[test]
fn unknown_arena_version_is_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    build_db(&path, 5);

    let vectors = path.join("vectors.bin");
    let mut bytes = std::fs::read(&vectors).unwrap();
    bytes[8..12].copy_from_slice(&42u32.to_le_bytes());
    std::fs::write(&vectors, &bytes).unwrap();

    assert!(matches!(
        Database::open(&path),
        Err(DbError::Corruption(_))
    ));
}

#[test]
fn truncated_arena_is_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    build_db(&path, 10);

    let vectors = path.join("vectors.bin");
    let len = std::fs::metadata(&vectors).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&vectors).unwrap();
    file.set_len(len - 16).unwrap();
    drop(file);

    assert!(matches!(
        Database::open(&path),
        Err(DbError::Corruption(_))
    ));
}

#[test]
fn mangled_graph_file_is_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    build_db(&path, 10);

    std::fs::write(path.join("index.hnsw"), b"VDBHNSWX_garbage").unwrap();

    assert!(matches!(
        Database::open(&path),
        Err(DbError::Corruption(_))
    ));
}

#[test]
fn second_writer_is_locked_out() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    let db = Database::create(
        &path,
        DbConfig::new(4).metric(Metric::L2).seed(1),
    )
    .unwrap();

    assert!(matches!(
        Database::open(&path),
        Err(DbError::Concurrency(_))
    ));

    // Releasing the handle releases the lock.
    db.close().unwrap();
    let reopened = Database::open(&path).unwrap();
    reopened.close().unwrap();
}

#[test]
fn create_refuses_an_existing_database() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    build_db(&path, 3);

    assert!(matches!(
        Database::create(&path, DbConfig::new(8).metric(Metric::L2)),
        Err(DbError::InvalidArgument(_))
    ));
}

#[test]
fn close_is_idempotent_and_fences_later_operations() {
    let dir = tempdir().unwrap();
    let db = Database::create(
        dir.path().join("db"),
        DbConfig::new(4).metric(Metric::L2).seed(1),
    )
    .unwrap();
    db.insert(&[1.0, 2.0, 3.0, 4.0], MetadataRecord::new(DocType::Note, "n"))
        .unwrap();

    db.close().unwrap();
    db.close().unwrap();

    assert!(matches!(
        db.insert(&[1.0, 2.0, 3.0, 4.0], MetadataRecord::new(DocType::Note, "n")),
        Err(DbError::InvalidArgument(_))
    ));
    assert!(matches!(
        db.search(&[1.0, 2.0, 3.0, 4.0], 1, None, None),
        Err(DbError::InvalidArgument(_))
    ));
    assert!(matches!(db.stats(), Err(DbError::InvalidArgument(_))));
}

#[test]
fn open_missing_directory_is_io() {
    let dir = tempdir().unwrap();
    assert!(matches!(
        Database::open(dir.path().join("nope")),
        Err(DbError::Io(_))
    ));
}

#[test]
fn invalid_config_is_rejected_at_create() {
    let dir = tempdir().unwrap();
    assert!(matches!(
        Database::create(dir.path().join("db"), DbConfig::new(0)),
        Err(DbError::InvalidArgument(_))
    ));
}
