//! Hash-based duplicate reconciliation.
//!
//! Keeper election happens once, globally, before any deletion: the
//! minimum id per content hash, independent of which partition is
//! processed first. Deletion then walks the date partitions newest
//! first (recent data is queried most, so reconciling it first pays
//! off soonest) in bounded batches. Re-running the whole pass is
//! idempotent: keepers are never deleted, so the second run deletes
//! nothing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::config::CoordinatorConfig;
use crate::db::{record_repo, Database, DatabaseError};
use crate::reconcile::progress::{CleanupProgress, EngineStatus};
use crate::reconcile::ReconcileError;

/// Above this many rows, `stats` switches from exact counts to the
/// storage engine's estimate plus a bounded random sample.
const EXACT_COUNT_THRESHOLD: u64 = 1_000_000;
/// Sample size for the hashed/unhashed ratio on large tables.
const STATS_SAMPLE_SIZE: u64 = 10_000;
/// Cap on the duplicate-group aggregation.
const DUPLICATE_GROUP_CAP: u64 = 100_000;

/// Table-level statistics, cheap even on very large tables.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerStats {
    pub total_records: u64,
    pub hashed_records: u64,
    pub unhashed_records: u64,
    /// Duplicate groups found, capped at the first 100,000.
    pub duplicate_groups: u64,
    /// Excess rows across those groups (what a run would delete).
    pub duplicate_records: u64,
    /// False when totals are estimated rather than counted.
    pub exact: bool,
}

/// Batched, resumable deletion of content-duplicate records.
#[derive(Clone)]
pub struct DuplicateReconciler {
    db: Database,
    batch_size: u64,
    batch_pause: Duration,
    backfill_batch_size: u64,
    progress: Arc<RwLock<CleanupProgress>>,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
}

impl DuplicateReconciler {
    pub fn new(db: Database, config: &CoordinatorConfig) -> Self {
        Self {
            db,
            batch_size: config.reconcile_batch_size,
            batch_pause: config.batch_pause(),
            backfill_batch_size: config.hash_backfill_batch_size,
            progress: Arc::new(RwLock::new(CleanupProgress::default())),
            stop: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> CleanupProgress {
        match self.progress.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                log::warn!("Cleanup progress lock was poisoned, recovering");
                poisoned.into_inner().clone()
            }
        }
    }

    /// Starts a reconciliation run in a background thread. Refuses when
    /// a run is already active. After a pause, starting again resumes
    /// from the next unprocessed partition.
    pub fn start(&self) -> Result<JoinHandle<()>, ReconcileError> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(ReconcileError::AlreadyRunning);
        }

        let engine = self.clone();
        Ok(std::thread::spawn(move || engine.run()))
    }

    /// Requests a cooperative stop. Checked between batches, never
    /// mid-batch: the in-flight deletion always completes.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// The run loop. Public for callers that want the blocking form;
    /// [`start`](Self::start) wraps it in a thread.
    pub fn run(&self) {
        let span = tracing::info_span!("reconcile_run");
        let _guard = span.enter();

        self.active.store(true, Ordering::Release);
        self.stop.store(false, Ordering::Release);

        self.update(|p| {
            // A fresh run after completion or failure starts over; a
            // paused run keeps its progress and resumes.
            if p.status != EngineStatus::Paused {
                *p = CleanupProgress::default();
            }
            p.status = EngineStatus::Running;
            p.error = None;
        });

        let outcome = self.run_inner();

        self.update(|p| match outcome {
            Ok(true) => {
                p.status = EngineStatus::Completed;
                p.current_date = None;
            }
            Ok(false) => {
                p.status = EngineStatus::Paused;
                p.current_date = None;
            }
            Err(ref e) => {
                p.status = EngineStatus::Error;
                p.error = Some(e.to_string());
            }
        });

        match &outcome {
            Ok(true) => log::info!(
                "Reconciliation completed: {} records deleted",
                self.progress().records_deleted
            ),
            Ok(false) => log::info!("Reconciliation paused on request"),
            Err(e) => log::error!("Reconciliation aborted: {}", e),
        }

        self.active.store(false, Ordering::Release);
    }

    /// Returns Ok(true) when every partition was reconciled, Ok(false)
    /// on a requested stop. Deleted batches stay deleted either way.
    fn run_inner(&self) -> Result<bool, DatabaseError> {
        let keepers = record_repo::elect_keepers(&self.db)?;
        log::info!("Keeper election: {} canonical rows", keepers);

        let partitions = record_repo::hashed_partitions(&self.db)?;
        let already_done: HashSet<String> =
            self.progress().processed_dates.iter().cloned().collect();

        self.update(|p| p.total_dates = partitions.len() as u64);

        for date in partitions {
            if already_done.contains(&date) {
                continue;
            }
            if self.stop.load(Ordering::Acquire) {
                record_repo::clear_keepers(&self.db)?;
                return Ok(false);
            }

            self.update(|p| p.current_date = Some(date.clone()));

            loop {
                if self.stop.load(Ordering::Acquire) {
                    record_repo::clear_keepers(&self.db)?;
                    return Ok(false);
                }

                let deleted =
                    record_repo::delete_duplicates_batch(&self.db, &date, self.batch_size)?;
                self.update(|p| p.records_deleted += deleted);

                // A short batch signals exhaustion for this partition.
                if deleted < self.batch_size {
                    break;
                }
                std::thread::sleep(self.batch_pause);
            }

            self.update(|p| {
                p.processed_dates.push(date.clone());
                p.current_date = None;
            });
            log::debug!("Partition {} reconciled", date);
        }

        record_repo::clear_keepers(&self.db)?;
        Ok(true)
    }

    /// Cheap table statistics. Exact below a size threshold; estimated
    /// above it, because counting millions of rows on demand is not.
    pub fn stats(&self) -> Result<ReconcilerStats, DatabaseError> {
        let approx = record_repo::approx_total(&self.db)?;

        let (total, hashed, unhashed, exact) = if approx <= EXACT_COUNT_THRESHOLD {
            let total = record_repo::total_count_exact(&self.db)?;
            let (hashed, unhashed) = record_repo::hashed_counts_exact(&self.db)?;
            (total, hashed, unhashed, true)
        } else {
            let (sampled, hashed_in_sample) =
                record_repo::sample_hashed_ratio(&self.db, STATS_SAMPLE_SIZE)?;
            let hashed = if sampled == 0 {
                0
            } else {
                approx * hashed_in_sample / sampled
            };
            (approx, hashed, approx.saturating_sub(hashed), false)
        };

        let (duplicate_groups, duplicate_records) =
            record_repo::duplicate_group_stats(&self.db, DUPLICATE_GROUP_CAP)?;

        Ok(ReconcilerStats {
            total_records: total,
            hashed_records: hashed,
            unhashed_records: unhashed,
            duplicate_groups,
            duplicate_records,
            exact,
        })
    }

    /// Backfills missing content hashes in bounded batches (rows
    /// ingested before hashing was enabled). Honors the stop flag
    /// between batches. Returns the number of rows hashed.
    pub fn recalculate_hashes(&self) -> Result<u64, DatabaseError> {
        let missing = record_repo::count_missing_hash(&self.db)?;
        if missing == 0 {
            return Ok(0);
        }
        log::info!("Hash backfill: {} rows to hash", missing);

        let mut total: u64 = 0;
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let batch = record_repo::unhashed_batch(&self.db, self.backfill_batch_size)?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len() as u64;

            let hashes: Vec<(i64, String)> = batch
                .into_iter()
                .map(|(id, payload)| (id, record_repo::record_hash(&payload)))
                .collect();
            record_repo::set_hashes(&self.db, &hashes)?;
            total += batch_len;

            if batch_len < self.backfill_batch_size {
                break;
            }
            std::thread::sleep(self.batch_pause);
        }

        log::info!("Hash backfill wrote {} hashes", total);
        Ok(total)
    }

    fn update<F: FnOnce(&mut CleanupProgress)>(&self, f: F) {
        let mut guard = match self.progress.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Cleanup progress lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        f(&mut guard);
    }
}
