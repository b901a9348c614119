//! Shared builders for integration tests.

#![allow(dead_code)]

use intake::db::record_repo::{self, NewRecord};
use intake::db::upload_repo::{self, NewUpload, KIND_RECORDS};
use intake::{CoordinatorConfig, Database};

/// In-memory database with all migrations applied.
pub fn test_db() -> Database {
    Database::open_in_memory().expect("Failed to create test database")
}

/// Default config with backoffs and pauses shrunk for tests.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        claim_backoff_ms: 1,
        batch_pause_ms: 0,
        ..CoordinatorConfig::default()
    }
}

/// Queues an upload of the record-file kind.
pub fn enqueue(db: &Database, id: &str, created_at: &str) {
    upload_repo::insert(
        db,
        &NewUpload {
            id: id.to_string(),
            filename: format!("{}.dat", id),
            file_kind: KIND_RECORDS.to_string(),
        },
        created_at,
    )
    .expect("Failed to queue upload");
}

/// Builds one record row.
pub fn record(upload: &str, filename: &str, date: &str, hash: Option<&str>) -> NewRecord {
    NewRecord {
        upload_id: upload.to_string(),
        source_filename: filename.to_string(),
        record_date: date.to_string(),
        content_hash: hash.map(|s| s.to_string()),
        payload: format!("payload:{}", hash.unwrap_or("none")),
    }
}

/// Inserts records in one batch.
pub fn seed_records(db: &Database, records: &[NewRecord]) {
    record_repo::insert_batch(db, records, "2026-04-01T00:00:00+00:00")
        .expect("Failed to seed records");
}

/// Status of one upload, straight from the store.
pub fn upload_status(db: &Database, id: &str) -> String {
    upload_repo::find_by_id(db, id)
        .expect("query failed")
        .expect("upload missing")
        .status
}
