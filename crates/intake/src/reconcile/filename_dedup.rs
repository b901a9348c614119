//! File-level duplicate cleanup.
//!
//! Some duplicate conditions are coarser than single records: a whole
//! file re-ingested under the same name. For each such filename the
//! upload owning the oldest record id is the keeper; every record the
//! other ingestions wrote for that filename is deleted, in the same
//! bounded-batch style as the hash engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::CoordinatorConfig;
use crate::db::{record_repo, Database, DatabaseError};
use crate::reconcile::progress::{EngineStatus, FilenameScanProgress};
use crate::reconcile::ReconcileError;

/// Scans for filenames ingested more than once and deletes the
/// records of every non-keeper ingestion.
#[derive(Clone)]
pub struct FilenameDuplicateService {
    db: Database,
    batch_size: u64,
    batch_pause: Duration,
    progress: Arc<RwLock<FilenameScanProgress>>,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
}

impl FilenameDuplicateService {
    pub fn new(db: Database, config: &CoordinatorConfig) -> Self {
        Self {
            db,
            batch_size: config.reconcile_batch_size,
            batch_pause: config.batch_pause(),
            progress: Arc::new(RwLock::new(FilenameScanProgress::default())),
            stop: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn progress(&self) -> FilenameScanProgress {
        match self.progress.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                log::warn!("Filename scan progress lock was poisoned, recovering");
                poisoned.into_inner().clone()
            }
        }
    }

    /// Starts a scan in a background thread. Refuses when one is
    /// already active. Each scan starts from scratch; the operation is
    /// idempotent, so a re-run after a pause simply finds less to do.
    pub fn start(&self) -> Result<JoinHandle<()>, ReconcileError> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(ReconcileError::AlreadyRunning);
        }

        let engine = self.clone();
        Ok(std::thread::spawn(move || engine.run()))
    }

    /// Requests a cooperative stop, honored between batches.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// The blocking scan loop.
    pub fn run(&self) {
        let span = tracing::info_span!("filename_scan");
        let _guard = span.enter();

        self.active.store(true, Ordering::Release);
        self.stop.store(false, Ordering::Release);

        self.update(|p| {
            *p = FilenameScanProgress::default();
            p.status = EngineStatus::Running;
        });

        let outcome = self.run_inner();

        self.update(|p| match outcome {
            Ok(true) => {
                p.status = EngineStatus::Completed;
                p.current_filename = None;
            }
            Ok(false) => {
                p.status = EngineStatus::Paused;
                p.current_filename = None;
            }
            Err(ref e) => {
                p.status = EngineStatus::Error;
                p.error = Some(e.to_string());
            }
        });

        self.active.store(false, Ordering::Release);
    }

    fn run_inner(&self) -> Result<bool, DatabaseError> {
        let filenames = record_repo::duplicate_filenames(&self.db)?;
        self.update(|p| p.total_filenames = filenames.len() as u64);
        log::info!(
            "Filename scan: {} filenames ingested more than once",
            filenames.len()
        );

        for filename in filenames {
            if self.stop.load(Ordering::Acquire) {
                return Ok(false);
            }

            let Some(keeper) = record_repo::keeper_upload(&self.db, &filename)? else {
                continue;
            };
            self.update(|p| p.current_filename = Some(filename.clone()));

            loop {
                if self.stop.load(Ordering::Acquire) {
                    return Ok(false);
                }

                let deleted = record_repo::delete_filename_batch(
                    &self.db,
                    &filename,
                    &keeper,
                    self.batch_size,
                )?;
                self.update(|p| p.records_deleted += deleted);

                if deleted < self.batch_size {
                    break;
                }
                std::thread::sleep(self.batch_pause);
            }

            self.update(|p| {
                p.filenames_processed += 1;
                p.current_filename = None;
            });
        }

        Ok(true)
    }

    fn update<F: FnOnce(&mut FilenameScanProgress)>(&self, f: F) {
        let mut guard = match self.progress.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Filename scan progress lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        f(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::record_repo::{insert_batch, total_count_exact, NewRecord};

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn fast_service(db: &Database) -> FilenameDuplicateService {
        let config = CoordinatorConfig {
            reconcile_batch_size: 2,
            batch_pause_ms: 0,
            ..CoordinatorConfig::default()
        };
        FilenameDuplicateService::new(db.clone(), &config)
    }

    fn record(upload: &str, filename: &str, payload: &str) -> NewRecord {
        NewRecord {
            upload_id: upload.to_string(),
            source_filename: filename.to_string(),
            record_date: "2026-03-01".to_string(),
            content_hash: None,
            payload: payload.to_string(),
        }
    }

    fn seed(db: &Database, records: &[NewRecord]) {
        insert_batch(db, records, "2026-04-01T00:00:00+00:00").unwrap();
    }

    #[test]
    fn test_removes_reingested_file() {
        let db = test_db();
        // a.dat ingested by u1 (3 records), then again by u2 (3 records).
        seed(
            &db,
            &[
                record("u1", "a.dat", "r1"),
                record("u1", "a.dat", "r2"),
                record("u1", "a.dat", "r3"),
                record("u2", "a.dat", "r1"),
                record("u2", "a.dat", "r2"),
                record("u2", "a.dat", "r3"),
                record("u3", "b.dat", "r4"),
            ],
        );

        let service = fast_service(&db);
        service.run();

        let progress = service.progress();
        assert_eq!(progress.status, EngineStatus::Completed);
        assert_eq!(progress.filenames_processed, 1);
        assert_eq!(progress.records_deleted, 3);

        // The keeper upload keeps every one of its records.
        assert_eq!(total_count_exact(&db).unwrap(), 4);
        db.with_conn(|conn| {
            let uploads: Vec<String> = conn
                .prepare("SELECT DISTINCT upload_id FROM records WHERE source_filename = 'a.dat'")?
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            assert_eq!(uploads, vec!["u1"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_no_duplicates_is_a_quick_pass() {
        let db = test_db();
        seed(
            &db,
            &[record("u1", "a.dat", "r1"), record("u2", "b.dat", "r2")],
        );

        let service = fast_service(&db);
        service.run();

        let progress = service.progress();
        assert_eq!(progress.status, EngineStatus::Completed);
        assert_eq!(progress.total_filenames, 0);
        assert_eq!(progress.records_deleted, 0);
        assert_eq!(total_count_exact(&db).unwrap(), 2);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let db = test_db();
        seed(
            &db,
            &[
                record("u1", "a.dat", "r1"),
                record("u2", "a.dat", "r1"),
            ],
        );

        let service = fast_service(&db);
        service.run();
        assert_eq!(service.progress().records_deleted, 1);

        service.run();
        assert_eq!(service.progress().records_deleted, 0);
        assert_eq!(total_count_exact(&db).unwrap(), 1);
    }

    #[test]
    fn test_three_ingestions_one_survivor() {
        let db = test_db();
        seed(
            &db,
            &[
                record("u1", "a.dat", "r1"),
                record("u2", "a.dat", "r1"),
                record("u3", "a.dat", "r1"),
            ],
        );

        let service = fast_service(&db);
        service.run();

        assert_eq!(service.progress().records_deleted, 2);
        assert_eq!(
            record_repo::keeper_upload(&db, "a.dat").unwrap().as_deref(),
            Some("u1")
        );
    }
}
