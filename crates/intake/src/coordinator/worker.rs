//! The per-process claim cycle.
//!
//! Each worker runs a periodic timer that drives one blocking claim
//! cycle: gate on the fleet, claim the next upload, hand it to the
//! domain processor, record the outcome. Parallelism comes from
//! independent worker processes, never from threads inside one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::CoordinatorConfig;
use crate::coordinator::claim::{ClaimCoordinator, WorkerId};
use crate::db::upload_repo::{self, UploadRow};
use crate::db::Database;
use crate::error::ProcessorError;

/// The domain processor's seam. Given a claimed upload it parses and
/// writes records, returning how many it wrote. The coordinator never
/// inspects the content.
pub trait UploadProcessor: Send + Sync {
    fn process(&self, upload: &UploadRow) -> Result<u64, ProcessorError>;
}

/// The upload currently being processed, as shown to operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUpload {
    pub id: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<String>,
}

/// Read-only snapshot polled by the operator-facing surface.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    pub is_running: bool,
    pub is_paused: bool,
    pub queued_count: u64,
    pub processed_count: u64,
    pub errors_by_id: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<CurrentUpload>,
}

/// Shared holder for the status snapshot.
pub struct StatusHandle {
    inner: RwLock<ProcessingStatus>,
}

impl StatusHandle {
    fn new() -> Self {
        Self {
            inner: RwLock::new(ProcessingStatus::default()),
        }
    }

    /// Returns a copy of the current status.
    pub fn snapshot(&self) -> ProcessingStatus {
        let guard = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Status lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.clone()
    }

    fn update<F: FnOnce(&mut ProcessingStatus)>(&self, f: F) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Status lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        f(&mut guard);
    }
}

/// One worker process's claim loop.
#[derive(Clone)]
pub struct ProcessingWorker {
    db: Database,
    coordinator: ClaimCoordinator,
    worker_id: WorkerId,
    processor: Arc<dyn UploadProcessor>,
    status: Arc<StatusHandle>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl ProcessingWorker {
    pub fn new(
        db: Database,
        config: CoordinatorConfig,
        worker_id: WorkerId,
        processor: Arc<dyn UploadProcessor>,
    ) -> Self {
        let interval = config.worker_poll_interval();
        Self {
            coordinator: ClaimCoordinator::new(db.clone(), config),
            db,
            worker_id,
            processor,
            status: Arc::new(StatusHandle::new()),
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn status(&self) -> Arc<StatusHandle> {
        Arc::clone(&self.status)
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Pauses claiming. The item in flight (if any) still completes;
    /// there is no cancelling an owned claim.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        self.status.update(|s| s.is_paused = true);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.status.update(|s| s.is_paused = false);
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Starts the periodic claim loop in a background thread. Reclaims
    /// this identity's orphans once before the first tick. A manual
    /// trigger wakes the loop early.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let worker = self.clone();

        std::thread::spawn(move || {
            match worker.coordinator.reclaim_owned_orphans(&worker.worker_id) {
                Ok(reclaimed) if !reclaimed.is_empty() => {
                    log::info!(
                        "Worker {} reclaimed {} orphaned uploads on boot",
                        worker.worker_id,
                        reclaimed.len()
                    );
                }
                Ok(_) => {}
                Err(e) => log::error!("Boot-time orphan reclaim failed: {}", e),
            }

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(worker.interval);
                interval_timer.tick().await; // skip immediate first tick

                loop {
                    if worker.shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::info!("Manual claim cycle triggered");
                        },
                    }

                    if worker.shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    worker.run_cycle();
                }
            });
        })
    }

    /// One blocking claim cycle: drain eligible uploads one at a time
    /// until the fleet is busy elsewhere or the queue is empty.
    pub fn run_cycle(&self) {
        if self.paused.load(Ordering::Acquire) {
            self.refresh_queue_depth();
            return;
        }

        self.status.update(|s| s.is_running = true);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            // Admission gate only; the conditional claim below is what
            // actually prevents double-processing.
            if self.coordinator.is_fleet_busy() {
                log::debug!("Fleet busy, worker {} standing down", self.worker_id);
                break;
            }

            let Some(upload) = self.coordinator.claim_next(&self.worker_id) else {
                break;
            };

            self.process_one(&upload);
        }

        self.refresh_queue_depth();
        self.status.update(|s| {
            s.is_running = false;
            s.current_item = None;
        });
    }

    fn process_one(&self, upload: &UploadRow) {
        let span = tracing::info_span!("process_upload", upload = %upload.id);
        let _guard = span.enter();

        self.status.update(|s| {
            s.current_item = Some(CurrentUpload {
                id: upload.id.clone(),
                filename: upload.filename.clone(),
                claimed_at: upload.claimed_at.clone(),
            });
        });

        match self.processor.process(upload) {
            Ok(record_count) => {
                if let Err(e) = self.coordinator.mark_completed(&upload.id) {
                    log::error!("Failed to mark upload {} completed: {}", upload.id, e);
                }
                log::info!(
                    "Processed upload {} ({}): {} records",
                    upload.id,
                    upload.filename,
                    record_count
                );
                self.status.update(|s| {
                    s.processed_count += 1;
                    s.current_item = None;
                });
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(db_err) = self.coordinator.mark_failed(&upload.id, &message) {
                    log::error!("Failed to mark upload {} failed: {}", upload.id, db_err);
                }
                log::warn!("Upload {} failed: {}", upload.id, message);
                self.status.update(|s| {
                    s.errors_by_id.insert(upload.id.clone(), message);
                    s.current_item = None;
                });
            }
        }
    }

    fn refresh_queue_depth(&self) {
        if let Ok(count) = upload_repo::count_by_status(&self.db, upload_repo::STATUS_QUEUED) {
            self.status.update(|s| s.queued_count = count);
        }
    }
}
