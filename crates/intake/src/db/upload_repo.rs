//! Upload repository: rows and coordination primitives for the uploads table.
//!
//! Every claim, reclaim and sweep is a single conditional UPDATE; the row
//! predicate is what makes claims race-free across workers. Status values
//! are stored as plain strings, one non-terminal value (`processing`)
//! represents "in flight".

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

/// The upload kind that sorts ahead of everything else in the queue:
/// fixed-width record files, the ingestion file type proper.
pub const KIND_RECORDS: &str = "records";

/// A raw upload row from the database.
#[derive(Debug, Clone)]
pub struct UploadRow {
    pub id: String,
    pub filename: String,
    pub file_kind: String,
    pub status: String,
    pub owner: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: String,
    pub claimed_at: Option<String>,
    pub completed_at: Option<String>,
}

impl UploadRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            filename: row.get("filename")?,
            file_kind: row.get("file_kind")?,
            status: row.get("status")?,
            owner: row.get("owner")?,
            error_detail: row.get("error_detail")?,
            created_at: row.get("created_at")?,
            claimed_at: row.get("claimed_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// A new upload entering the queue (the upload pipeline's seam).
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub id: String,
    pub filename: String,
    pub file_kind: String,
}

/// Inserts a new upload row with `status = queued`.
pub fn insert(db: &Database, upload: &NewUpload, created_at: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            &format!(
                "INSERT INTO {} (id, filename, file_kind, status, created_at)
                 VALUES (?1, ?2, ?3, '{}', ?4)",
                db.tables().uploads,
                STATUS_QUEUED
            ),
            params![upload.id, upload.filename, upload.file_kind, created_at],
        )?;
        Ok(())
    })
}

/// Finds an upload by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<UploadRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE id = ?1",
            db.tables().uploads
        ))?;
        let mut rows = stmt.query_map(params![id], UploadRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Counts uploads with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE status = ?1",
                db.tables().uploads
            ),
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Selects the oldest eligible queued upload. Record files sort before
/// any other kind, then enqueue order decides; `id` breaks exact ties.
pub fn next_eligible(db: &Database) -> Result<Option<UploadRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE status = ?1
             ORDER BY CASE WHEN file_kind = ?2 THEN 0 ELSE 1 END, created_at, id
             LIMIT 1",
            db.tables().uploads
        ))?;
        let mut rows = stmt.query_map(params![STATUS_QUEUED, KIND_RECORDS], UploadRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Attempts the atomic claim: one conditional UPDATE that only applies
/// when the row is not already `processing`. Returns true iff this
/// caller won the row. Two concurrent calls can never both succeed;
/// the row predicate is evaluated inside SQLite's write lock.
pub fn try_claim(
    db: &Database,
    id: &str,
    owner: &str,
    claimed_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET status = ?2, owner = ?3, claimed_at = ?4
                 WHERE id = ?1 AND status != ?2",
                db.tables().uploads
            ),
            params![id, STATUS_PROCESSING, owner, claimed_at],
        )?;
        Ok(changed == 1)
    })
}

/// Resets `processing` rows held by any other owner (or no owner) back to
/// `queued`, clearing claim fields. Returns the ids that were reset.
/// Safe to call on every boot.
pub fn reset_foreign_processing(
    db: &Database,
    owner: &str,
) -> Result<Vec<(String, Option<String>)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, owner FROM {} WHERE status = ?1 AND (owner IS NULL OR owner != ?2)",
            db.tables().uploads
        ))?;
        let orphans: Vec<(String, Option<String>)> = stmt
            .query_map(params![STATUS_PROCESSING, owner], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        conn.execute(
            &format!(
                "UPDATE {} SET status = ?1, owner = NULL, claimed_at = NULL
                 WHERE status = ?2 AND (owner IS NULL OR owner != ?3)",
                db.tables().uploads
            ),
            params![STATUS_QUEUED, STATUS_PROCESSING, owner],
        )?;

        Ok(orphans)
    })
}

/// Marks an upload completed.
pub fn mark_completed(db: &Database, id: &str, completed_at: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            &format!(
                "UPDATE {} SET status = ?2, completed_at = ?3, error_detail = NULL
                 WHERE id = ?1",
                db.tables().uploads
            ),
            params![id, STATUS_COMPLETED, completed_at],
        )?;
        Ok(())
    })
}

/// Marks an upload failed with an error message.
pub fn mark_failed(
    db: &Database,
    id: &str,
    message: &str,
    completed_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            &format!(
                "UPDATE {} SET status = ?2, error_detail = ?3, completed_at = ?4
                 WHERE id = ?1",
                db.tables().uploads
            ),
            params![id, STATUS_FAILED, message, completed_at],
        )?;
        Ok(())
    })
}

/// Force-fails every `processing` row claimed at or before `cutoff`,
/// regardless of owner. Returns the affected ids (for logging).
pub fn sweep_stale(
    db: &Database,
    cutoff: &str,
    message: &str,
    swept_at: &str,
) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM {} WHERE status = ?1 AND claimed_at IS NOT NULL AND claimed_at <= ?2",
            db.tables().uploads
        ))?;
        let stale: Vec<String> = stmt
            .query_map(params![STATUS_PROCESSING, cutoff], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        conn.execute(
            &format!(
                "UPDATE {} SET status = ?1, error_detail = ?2, completed_at = ?3
                 WHERE status = ?4 AND claimed_at IS NOT NULL AND claimed_at <= ?5",
                db.tables().uploads
            ),
            params![STATUS_FAILED, message, swept_at, STATUS_PROCESSING, cutoff],
        )?;

        Ok(stale)
    })
}

/// Per-owner counts of in-flight rows (operator visibility).
pub fn processing_counts_by_owner(
    db: &Database,
) -> Result<Vec<(Option<String>, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT owner, COUNT(*) FROM {} WHERE status = ?1
             GROUP BY owner ORDER BY COUNT(*) DESC",
            db.tables().uploads
        ))?;
        let counts = stmt
            .query_map(params![STATUS_PROCESSING], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    })
}

/// The oldest in-flight claim, if any: `(id, claimed_at)`.
pub fn oldest_processing(db: &Database) -> Result<Option<(String, String)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, claimed_at FROM {}
             WHERE status = ?1 AND claimed_at IS NOT NULL
             ORDER BY claimed_at LIMIT 1",
            db.tables().uploads
        ))?;
        let mut rows = stmt.query_map(params![STATUS_PROCESSING], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        match rows.next() {
            Some(Ok(pair)) => Ok(Some(pair)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}
