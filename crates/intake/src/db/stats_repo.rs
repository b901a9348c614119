//! Reporting-period statistics repository.
//!
//! One row per reporting period (`YYYY-MM`), recomputed wholesale from
//! the records table. Rebuilds run under the in-process job registry so
//! two callers never recompute the same period concurrently.

use rusqlite::params;
use serde::Serialize;

use super::{format_timestamp, Database, DatabaseError};

/// A single period-statistics row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodStatRow {
    pub period: String,
    pub record_count: i64,
    pub upload_count: i64,
    pub distinct_dates: i64,
    pub rebuilt_at: String,
}

/// Recomputes the aggregate row for one reporting period from the
/// records table and UPSERTs it. Returns the fresh row.
pub fn rebuild_period(db: &Database, period: &str) -> Result<PeriodStatRow, DatabaseError> {
    let rebuilt_at = format_timestamp(chrono::Utc::now());

    db.with_conn(|conn| {
        let (record_count, upload_count, distinct_dates): (i64, i64, i64) = conn.query_row(
            &format!(
                "SELECT COUNT(*), COUNT(DISTINCT upload_id), COUNT(DISTINCT record_date)
                 FROM {} WHERE substr(record_date, 1, 7) = ?1",
                db.tables().records
            ),
            params![period],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        conn.execute(
            &format!(
                "INSERT INTO {} (period, record_count, upload_count, distinct_dates, rebuilt_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(period) DO UPDATE SET
                   record_count = ?2,
                   upload_count = ?3,
                   distinct_dates = ?4,
                   rebuilt_at = ?5",
                db.tables().period_stats
            ),
            params![period, record_count, upload_count, distinct_dates, rebuilt_at],
        )?;

        Ok(PeriodStatRow {
            period: period.to_string(),
            record_count,
            upload_count,
            distinct_dates,
            rebuilt_at: rebuilt_at.clone(),
        })
    })
}

/// Looks up the cached row for one period.
pub fn find_period(db: &Database, period: &str) -> Result<Option<PeriodStatRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT period, record_count, upload_count, distinct_dates, rebuilt_at
             FROM {} WHERE period = ?1",
            db.tables().period_stats
        ))?;
        let mut rows = stmt.query_map(params![period], |row| {
            Ok(PeriodStatRow {
                period: row.get(0)?,
                record_count: row.get(1)?,
                upload_count: row.get(2)?,
                distinct_dates: row.get(3)?,
                rebuilt_at: row.get(4)?,
            })
        })?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// All cached periods, newest first.
pub fn all_periods(db: &Database) -> Result<Vec<PeriodStatRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT period, record_count, upload_count, distinct_dates, rebuilt_at
             FROM {} ORDER BY period DESC",
            db.tables().period_stats
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PeriodStatRow {
                    period: row.get(0)?,
                    record_count: row.get(1)?,
                    upload_count: row.get(2)?,
                    distinct_dates: row.get(3)?,
                    rebuilt_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::record_repo::{self, NewRecord};

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn seed_march(db: &Database) {
        let records: Vec<NewRecord> = [
            ("u1", "2026-03-01"),
            ("u1", "2026-03-01"),
            ("u1", "2026-03-02"),
            ("u2", "2026-03-15"),
            ("u3", "2026-04-01"),
        ]
        .iter()
        .map(|(upload, date)| NewRecord {
            upload_id: upload.to_string(),
            source_filename: "a.dat".to_string(),
            record_date: date.to_string(),
            content_hash: None,
            payload: "row".to_string(),
        })
        .collect();
        record_repo::insert_batch(db, &records, "2026-04-02T00:00:00+00:00").unwrap();
    }

    #[test]
    fn test_rebuild_period() {
        let db = test_db();
        seed_march(&db);

        let row = rebuild_period(&db, "2026-03").unwrap();
        assert_eq!(row.record_count, 4);
        assert_eq!(row.upload_count, 2);
        assert_eq!(row.distinct_dates, 3);

        let cached = find_period(&db, "2026-03").unwrap().unwrap();
        assert_eq!(cached.record_count, 4);
    }

    #[test]
    fn test_rebuild_is_wholesale() {
        let db = test_db();
        seed_march(&db);
        rebuild_period(&db, "2026-03").unwrap();

        // Delete some source rows and rebuild: the cache reflects the new truth.
        db.with_conn(|conn| {
            conn.execute("DELETE FROM records WHERE upload_id = 'u2'", [])?;
            Ok(())
        })
        .unwrap();

        let row = rebuild_period(&db, "2026-03").unwrap();
        assert_eq!(row.record_count, 3);
        assert_eq!(row.upload_count, 1);
    }

    #[test]
    fn test_empty_period() {
        let db = test_db();
        let row = rebuild_period(&db, "2025-12").unwrap();
        assert_eq!(row.record_count, 0);
        assert_eq!(row.upload_count, 0);
    }

    #[test]
    fn test_all_periods_newest_first() {
        let db = test_db();
        seed_march(&db);
        rebuild_period(&db, "2026-03").unwrap();
        rebuild_period(&db, "2026-04").unwrap();

        let rows = all_periods(&db).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].period, "2026-04");
        assert_eq!(rows[1].period, "2026-03");
    }
}
