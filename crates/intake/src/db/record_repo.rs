//! Record repository: queries for the ingested-records table.
//!
//! The reconciliation engines have no write path here other than
//! deletion and hash backfill; `insert_batch` exists as the domain
//! processor's ingestion seam. Keeper election is materialized into a
//! session temp table so that partition-by-partition deletion can never
//! remove a row that is the canonical copy for some other partition.

use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use super::{Database, DatabaseError};

/// Name of the session temp table holding elected keeper ids.
const KEEPERS_TABLE: &str = "dup_keepers";

/// A raw record row from the database.
#[derive(Debug, Clone)]
pub struct RecordRow {
    pub id: i64,
    pub upload_id: String,
    pub source_filename: String,
    pub record_date: String,
    pub content_hash: Option<String>,
    pub payload: String,
    pub created_at: String,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            upload_id: row.get("upload_id")?,
            source_filename: row.get("source_filename")?,
            record_date: row.get("record_date")?,
            content_hash: row.get("content_hash")?,
            payload: row.get("payload")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// A new record produced by the domain processor.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub upload_id: String,
    pub source_filename: String,
    pub record_date: String,
    pub content_hash: Option<String>,
    pub payload: String,
}

/// Computes the content hash of a record's defining payload
/// (SHA-256 over the trimmed raw line, hex encoded).
pub fn record_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.trim().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Inserts a batch of records in one transaction.
pub fn insert_batch(
    db: &Database,
    records: &[NewRecord],
    created_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (upload_id, source_filename, record_date, content_hash, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                db.tables().records
            ))?;
            for record in records {
                stmt.execute(params![
                    record.upload_id,
                    record.source_filename,
                    record.record_date,
                    record.content_hash,
                    record.payload,
                    created_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    })
}

/// Finds a record by id.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<RecordRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                &format!("SELECT * FROM {} WHERE id = ?1", db.tables().records),
                params![id],
                RecordRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

// ─── Keeper election ────────────────────────────────────────────────────────

/// Elects keepers in one global pass: for every distinct non-empty
/// content hash, the minimum record id. Materialized into a temp table
/// scoped to this connection. Returns the number of keepers.
pub fn elect_keepers(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS temp.{KEEPERS_TABLE};
             CREATE TEMP TABLE {KEEPERS_TABLE} AS
                 SELECT MIN(id) AS id FROM {records}
                 WHERE content_hash IS NOT NULL AND content_hash != ''
                 GROUP BY content_hash;
             CREATE UNIQUE INDEX idx_{KEEPERS_TABLE}_id ON {KEEPERS_TABLE} (id);",
            records = db.tables().records,
        ))?;

        let count: u64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", KEEPERS_TABLE), [], |r| {
                r.get(0)
            })?;
        Ok(count)
    })
}

/// Drops the keeper temp table.
pub fn clear_keepers(db: &Database) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS temp.{}", KEEPERS_TABLE))?;
        Ok(())
    })
}

/// Distinct partition dates among hashed rows, most recent first.
pub fn hashed_partitions(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT record_date FROM {}
             WHERE content_hash IS NOT NULL AND content_hash != ''
             ORDER BY record_date DESC",
            db.tables().records
        ))?;
        let dates = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(dates)
    })
}

/// Deletes up to `batch_size` non-keeper rows in one partition.
/// Returns the number of rows deleted; fewer than `batch_size` signals
/// exhaustion for that partition. Requires [`elect_keepers`] first.
pub fn delete_duplicates_batch(
    db: &Database,
    record_date: &str,
    batch_size: u64,
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {records} WHERE id IN (
                     SELECT id FROM {records}
                     WHERE record_date = ?1
                       AND content_hash IS NOT NULL AND content_hash != ''
                       AND id NOT IN (SELECT id FROM {KEEPERS_TABLE})
                     LIMIT ?2)",
                records = db.tables().records,
            ),
            params![record_date, batch_size],
        )?;
        Ok(deleted as u64)
    })
}

// ─── Hash backfill ──────────────────────────────────────────────────────────

/// Counts rows still missing a content hash.
pub fn count_missing_hash(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE content_hash IS NULL OR content_hash = ''",
                db.tables().records
            ),
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Fetches one batch of unhashed rows: `(id, payload)`.
pub fn unhashed_batch(db: &Database, limit: u64) -> Result<Vec<(i64, String)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, payload FROM {}
             WHERE content_hash IS NULL OR content_hash = ''
             ORDER BY id LIMIT ?1",
            db.tables().records
        ))?;
        let rows = stmt
            .query_map(params![limit], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Writes computed hashes for a batch of rows in one transaction.
pub fn set_hashes(db: &Database, hashes: &[(i64, String)]) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE {} SET content_hash = ?2 WHERE id = ?1",
                db.tables().records
            ))?;
            for (id, hash) in hashes {
                stmt.execute(params![id, hash])?;
            }
        }
        tx.commit()?;
        Ok(())
    })
}

// ─── Statistics ─────────────────────────────────────────────────────────────

/// Exact row count. Prohibitively expensive on very large tables;
/// callers gate this behind [`approx_total`].
pub fn total_count_exact(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", db.tables().records),
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Approximate row count from the storage engine's statistics
/// (`sqlite_stat1` when ANALYZE has run), falling back to `MAX(id)`
/// for this append-mostly table.
pub fn approx_total(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let stat: Result<Option<String>, rusqlite::Error> = conn
            .query_row(
                "SELECT stat FROM sqlite_stat1 WHERE tbl = ?1 LIMIT 1",
                params![db.tables().records],
                |r| r.get(0),
            )
            .optional();

        if let Ok(Some(stat)) = stat {
            // First whitespace-separated field of `stat` is the row estimate.
            if let Some(rows) = stat.split_whitespace().next().and_then(|s| s.parse().ok()) {
                return Ok(rows);
            }
        }

        let max_id: u64 = conn.query_row(
            &format!("SELECT COALESCE(MAX(id), 0) FROM {}", db.tables().records),
            [],
            |r| r.get(0),
        )?;
        Ok(max_id)
    })
}

/// Exact hashed/unhashed split.
pub fn hashed_counts_exact(db: &Database) -> Result<(u64, u64), DatabaseError> {
    db.with_conn(|conn| {
        let pair = conn.query_row(
            &format!(
                "SELECT
                     COALESCE(SUM(CASE WHEN content_hash IS NOT NULL AND content_hash != '' THEN 1 ELSE 0 END), 0),
                     COALESCE(SUM(CASE WHEN content_hash IS NULL OR content_hash = '' THEN 1 ELSE 0 END), 0)
                 FROM {}",
                db.tables().records
            ),
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(pair)
    })
}

/// Bounded random sample: `(sampled, hashed_in_sample)`. Callers scale
/// the ratio up to the approximate total.
pub fn sample_hashed_ratio(db: &Database, sample_size: u64) -> Result<(u64, u64), DatabaseError> {
    db.with_conn(|conn| {
        let pair = conn.query_row(
            &format!(
                "SELECT COUNT(*), COALESCE(SUM(hashed), 0) FROM (
                     SELECT CASE WHEN content_hash IS NOT NULL AND content_hash != ''
                                 THEN 1 ELSE 0 END AS hashed
                     FROM {} ORDER BY RANDOM() LIMIT ?1)",
                db.tables().records
            ),
            params![sample_size],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(pair)
    })
}

/// Duplicate-group statistics from a capped query: `(groups, excess_rows)`
/// over at most `group_cap` duplicate groups.
pub fn duplicate_group_stats(db: &Database, group_cap: u64) -> Result<(u64, u64), DatabaseError> {
    db.with_conn(|conn| {
        let pair = conn.query_row(
            &format!(
                "SELECT COUNT(*), COALESCE(SUM(n - 1), 0) FROM (
                     SELECT COUNT(*) AS n FROM {}
                     WHERE content_hash IS NOT NULL AND content_hash != ''
                     GROUP BY content_hash HAVING COUNT(*) > 1
                     LIMIT ?1)",
                db.tables().records
            ),
            params![group_cap],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(pair)
    })
}

// ─── Filename-level duplicates ──────────────────────────────────────────────

/// Filenames ingested by more than one upload.
pub fn duplicate_filenames(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT source_filename FROM {}
             GROUP BY source_filename HAVING COUNT(DISTINCT upload_id) > 1
             ORDER BY source_filename",
            db.tables().records
        ))?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    })
}

/// The keeper upload for a filename: the ingestion owning the oldest
/// record id.
pub fn keeper_upload(db: &Database, filename: &str) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let upload = conn
            .query_row(
                &format!(
                    "SELECT upload_id FROM {} WHERE source_filename = ?1
                     ORDER BY id LIMIT 1",
                    db.tables().records
                ),
                params![filename],
                |r| r.get(0),
            )
            .optional()?;
        Ok(upload)
    })
}

/// Deletes up to `batch_size` records of a filename that belong to any
/// upload other than the keeper.
pub fn delete_filename_batch(
    db: &Database,
    filename: &str,
    keeper_upload_id: &str,
    batch_size: u64,
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {records} WHERE id IN (
                     SELECT id FROM {records}
                     WHERE source_filename = ?1 AND upload_id != ?2
                     LIMIT ?3)",
                records = db.tables().records,
            ),
            params![filename, keeper_upload_id, batch_size],
        )?;
        Ok(deleted as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn record(upload: &str, filename: &str, date: &str, hash: Option<&str>) -> NewRecord {
        NewRecord {
            upload_id: upload.to_string(),
            source_filename: filename.to_string(),
            record_date: date.to_string(),
            content_hash: hash.map(|s| s.to_string()),
            payload: format!("payload for {}", hash.unwrap_or("unhashed")),
        }
    }

    fn seed(db: &Database, records: &[NewRecord]) {
        insert_batch(db, records, "2026-01-01T00:00:00+00:00").unwrap();
    }

    #[test]
    fn test_record_hash_is_stable_and_trimmed() {
        let a = record_hash("ROW-0001  ALICE   2026-03-01");
        let b = record_hash("ROW-0001  ALICE   2026-03-01  ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, record_hash("ROW-0002  ALICE   2026-03-01"));
    }

    #[test]
    fn test_insert_batch_and_find() {
        let db = test_db();
        seed(
            &db,
            &[
                record("u1", "a.dat", "2026-03-01", Some("h1")),
                record("u1", "a.dat", "2026-03-01", Some("h2")),
            ],
        );

        assert_eq!(total_count_exact(&db).unwrap(), 2);
        let first = find_by_id(&db, 1).unwrap().unwrap();
        assert_eq!(first.upload_id, "u1");
        assert_eq!(first.content_hash.as_deref(), Some("h1"));
    }

    #[test]
    fn test_elect_keepers_minimum_id() {
        let db = test_db();
        seed(
            &db,
            &[
                record("u1", "a.dat", "2026-03-01", Some("h1")), // id 1, keeper
                record("u1", "a.dat", "2026-03-02", Some("h1")),
                record("u1", "a.dat", "2026-03-01", Some("h2")), // id 3, keeper
                record("u1", "a.dat", "2026-03-01", None),       // unhashed, ignored
            ],
        );

        assert_eq!(elect_keepers(&db).unwrap(), 2);
        db.with_conn(|conn| {
            let ids: Vec<i64> = conn
                .prepare("SELECT id FROM dup_keepers ORDER BY id")?
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            assert_eq!(ids, vec![1, 3]);
            Ok(())
        })
        .unwrap();
        clear_keepers(&db).unwrap();
    }

    #[test]
    fn test_delete_duplicates_batch_spares_keepers() {
        let db = test_db();
        // Keeper for h1 lives in the 03-01 partition; the 03-02 copy must go
        // even when 03-02 is processed first.
        seed(
            &db,
            &[
                record("u1", "a.dat", "2026-03-01", Some("h1")),
                record("u1", "a.dat", "2026-03-02", Some("h1")),
                record("u1", "a.dat", "2026-03-02", Some("h2")),
            ],
        );
        elect_keepers(&db).unwrap();

        let deleted = delete_duplicates_batch(&db, "2026-03-02", 100).unwrap();
        assert_eq!(deleted, 1);
        // h2's only copy (a keeper) survives in 03-02.
        assert_eq!(total_count_exact(&db).unwrap(), 2);

        let deleted = delete_duplicates_batch(&db, "2026-03-01", 100).unwrap();
        assert_eq!(deleted, 0);
        clear_keepers(&db).unwrap();
    }

    #[test]
    fn test_hashed_partitions_newest_first() {
        let db = test_db();
        seed(
            &db,
            &[
                record("u1", "a.dat", "2026-03-01", Some("h1")),
                record("u1", "a.dat", "2026-03-03", Some("h2")),
                record("u1", "a.dat", "2026-03-02", Some("h3")),
                record("u1", "a.dat", "2026-02-01", None), // unhashed date excluded
            ],
        );

        let dates = hashed_partitions(&db).unwrap();
        assert_eq!(dates, vec!["2026-03-03", "2026-03-02", "2026-03-01"]);
    }

    #[test]
    fn test_backfill_queries() {
        let db = test_db();
        seed(
            &db,
            &[
                record("u1", "a.dat", "2026-03-01", None),
                record("u1", "a.dat", "2026-03-01", Some("")),
                record("u1", "a.dat", "2026-03-01", Some("h1")),
            ],
        );

        assert_eq!(count_missing_hash(&db).unwrap(), 2);
        let batch = unhashed_batch(&db, 10).unwrap();
        assert_eq!(batch.len(), 2);

        let hashes: Vec<(i64, String)> = batch
            .iter()
            .map(|(id, payload)| (*id, record_hash(payload)))
            .collect();
        set_hashes(&db, &hashes).unwrap();

        assert_eq!(count_missing_hash(&db).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_group_stats() {
        let db = test_db();
        // h1 ×3, h2 ×2, h3 ×1 → 2 groups, 3 excess rows.
        seed(
            &db,
            &[
                record("u1", "a.dat", "2026-03-01", Some("h1")),
                record("u1", "a.dat", "2026-03-01", Some("h1")),
                record("u1", "a.dat", "2026-03-01", Some("h1")),
                record("u1", "a.dat", "2026-03-01", Some("h2")),
                record("u1", "a.dat", "2026-03-01", Some("h2")),
                record("u1", "a.dat", "2026-03-01", Some("h3")),
            ],
        );

        let (groups, excess) = duplicate_group_stats(&db, 100_000).unwrap();
        assert_eq!(groups, 2);
        assert_eq!(excess, 3);
    }

    #[test]
    fn test_sample_and_approx() {
        let db = test_db();
        seed(
            &db,
            &[
                record("u1", "a.dat", "2026-03-01", Some("h1")),
                record("u1", "a.dat", "2026-03-01", None),
            ],
        );

        // No ANALYZE has run, so the MAX(id) fallback answers.
        assert_eq!(approx_total(&db).unwrap(), 2);

        let (sampled, hashed) = sample_hashed_ratio(&db, 10).unwrap();
        assert_eq!(sampled, 2);
        assert_eq!(hashed, 1);

        let (hashed, unhashed) = hashed_counts_exact(&db).unwrap();
        assert_eq!((hashed, unhashed), (1, 1));
    }

    #[test]
    fn test_filename_duplicates() {
        let db = test_db();
        // a.dat ingested twice (u1 then u2), b.dat once.
        seed(
            &db,
            &[
                record("u1", "a.dat", "2026-03-01", Some("h1")),
                record("u1", "a.dat", "2026-03-01", Some("h2")),
                record("u2", "a.dat", "2026-03-01", Some("h1")),
                record("u2", "a.dat", "2026-03-01", Some("h2")),
                record("u3", "b.dat", "2026-03-01", Some("h3")),
            ],
        );

        assert_eq!(duplicate_filenames(&db).unwrap(), vec!["a.dat"]);
        assert_eq!(keeper_upload(&db, "a.dat").unwrap().as_deref(), Some("u1"));

        let deleted = delete_filename_batch(&db, "a.dat", "u1", 100).unwrap();
        assert_eq!(deleted, 2);
        // Every record of the keeper upload survives.
        assert_eq!(total_count_exact(&db).unwrap(), 3);
        assert!(duplicate_filenames(&db).unwrap().is_empty());
    }
}
