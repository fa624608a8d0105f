//! End-to-end scenarios over the public API.

use rand::RngCore;
use sealdb_core::{Config, Database, Error, MasterKey};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom};

fn random_bytes(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut payload);
    payload
}

fn memory_db_with_chunk(chunk_size: usize) -> Database {
    Database::open_in_memory(Config::new("/unused", MasterKey::generate()).chunk_size(chunk_size))
        .unwrap()
}

#[test]
fn basic_put_get_delete() {
    let db = memory_db_with_chunk(100_000);
    let col = db.collection("col").unwrap();

    col.put("u1", &json!({"name": "alice"})).unwrap();
    let doc: serde_json::Value = col.get("u1").unwrap();
    assert_eq!(doc, json!({"name": "alice"}));

    col.delete("u1").unwrap();
    assert!(matches!(col.get_raw("u1"), Err(Error::NotFound)));
}

#[test]
fn document_round_trip_at_many_sizes() {
    let db = memory_db_with_chunk(100_000);
    let col = db.collection("col").unwrap();

    for len in [0usize, 1, 100, 10_000, 500_000] {
        let payload = random_bytes(len);
        col.put_raw("doc", &payload).unwrap();
        assert_eq!(col.get_raw("doc").unwrap(), payload, "length {len}");
    }
}

#[test]
fn large_file_with_custom_chunk_size() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new(dir.path(), MasterKey::generate()).chunk_size(100_000);
    let db = Database::open(config).unwrap();
    let files = db.file_store();

    // A payload spanning a hundred chunks, compared by digest.
    let payload = random_bytes(10_000_000);
    let written = files.put_file("f", "big.bin", &mut payload.as_slice()).unwrap();
    assert_eq!(written, payload.len() as u64);

    let mut out = Vec::with_capacity(payload.len());
    files.read_file("f", &mut out).unwrap();
    assert_eq!(Sha256::digest(&out), Sha256::digest(&payload));

    db.close().unwrap();
}

#[test]
fn overwrite_keeps_only_the_new_content() {
    let db = memory_db_with_chunk(100_000);
    let files = db.file_store();

    let big = random_bytes(1_500_000);
    files.put_file("f", "", &mut big.as_slice()).unwrap();

    let small = random_bytes(500_000);
    files.put_file("f", "", &mut small.as_slice()).unwrap();

    let mut out = Vec::new();
    files.read_file("f", &mut out).unwrap();
    assert_eq!(out, small);
}

#[test]
fn random_access_reads() {
    let db = memory_db_with_chunk(100_000);
    let files = db.file_store();

    let payload = random_bytes(1_500_000);
    files.put_file("f", "", &mut payload.as_slice()).unwrap();

    let mut reader = files.get_file_reader("f").unwrap();

    let mut buf = vec![0u8; 500];
    let read = reader.read_at(&mut buf, 848_424).unwrap();
    assert_eq!(&buf[..read], &payload[848_424..848_424 + read]);
    assert_eq!(read, 500);

    reader.seek(SeekFrom::Start(50)).unwrap();
    let mut buf = vec![0u8; 100];
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(buf, &payload[50..150]);
}

#[test]
fn related_files_die_with_their_document() {
    let db = memory_db_with_chunk(100_000);
    let col = db.collection("col").unwrap();
    let files = db.file_store();

    col.put("doc1", &json!({})).unwrap();
    let media = random_bytes(250_000);
    files
        .put_file_related("fileA", "", &mut media.as_slice(), "col", "doc1")
        .unwrap();

    col.delete("doc1").unwrap();

    let mut out = Vec::new();
    let streamed = files.read_file("fileA", &mut out).unwrap();
    assert_eq!(streamed, 0);
    assert!(out.is_empty());
}

#[test]
fn concurrent_writers_are_rejected() {
    let db = memory_db_with_chunk(100_000);
    let files = db.file_store();

    let payload = random_bytes(1_000);
    files.put_file("f", "", &mut payload.as_slice()).unwrap();

    let first = files.get_file_writer("f", "").unwrap();
    let second = files.get_file_writer("f", "");
    assert!(matches!(second, Err(Error::FileInWrite)));
    drop(first);
}

#[test]
fn history_keeps_versions_until_cleaned() {
    let db = memory_db_with_chunk(100_000);
    let col = db.collection("col").unwrap();

    col.put("doc", &json!({"v": 1})).unwrap();
    col.put("doc", &json!({"v": 2})).unwrap();

    let versions: Vec<serde_json::Value> = col.history("doc", 10).unwrap();
    assert_eq!(versions, vec![json!({"v": 2}), json!({"v": 1})]);

    col.put_with_clean_history("doc", &json!({"v": 3})).unwrap();
    let versions: Vec<serde_json::Value> = col.history("doc", 10).unwrap();
    assert_eq!(versions, vec![json!({"v": 3})]);
}

#[test]
fn rotation_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let first_key = MasterKey::generate();
    let second_key = MasterKey::generate();
    let payload = random_bytes(250_000);

    {
        let db = Database::open(
            Config::new(dir.path(), first_key.clone()).chunk_size(100_000),
        )
        .unwrap();
        db.collection("col").unwrap().put_raw("doc", b"body").unwrap();
        db.file_store()
            .put_file("f", "", &mut payload.as_slice())
            .unwrap();
        db.update_key(second_key.clone()).unwrap();
        db.close().unwrap();
    }

    assert!(matches!(
        Database::open(Config::new(dir.path(), first_key)),
        Err(Error::AuthFailure)
    ));

    let db = Database::open(Config::new(dir.path(), second_key).chunk_size(100_000)).unwrap();
    assert_eq!(db.collection("col").unwrap().get_raw("doc").unwrap(), b"body");
    let mut out = Vec::new();
    db.file_store().read_file("f", &mut out).unwrap();
    assert_eq!(out, payload);
}

#[test]
fn backup_round_trips_between_stores() {
    let key = MasterKey::generate();
    let source = Database::open_in_memory(Config::new("/unused", key.clone()).chunk_size(100_000))
        .unwrap();

    source
        .collection("col")
        .unwrap()
        .put("doc", &json!({"kept": true}))
        .unwrap();
    let payload = random_bytes(250_000);
    source
        .file_store()
        .put_file("f", "", &mut payload.as_slice())
        .unwrap();

    let mut stream = Vec::new();
    source.backup(&mut stream).unwrap();

    let target =
        Database::open_in_memory(Config::new("/unused", key).chunk_size(100_000)).unwrap();
    target.load(&mut stream.as_slice()).unwrap();

    let doc: serde_json::Value = target.collection("col").unwrap().get("doc").unwrap();
    assert_eq!(doc, json!({"kept": true}));
    let mut out = Vec::new();
    target.file_store().read_file("f", &mut out).unwrap();
    assert_eq!(out, payload);
}
