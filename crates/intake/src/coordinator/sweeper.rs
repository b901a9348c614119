//! Timeout-based reclaim of stale claims.
//!
//! The startup reclaim only sees crashes of the local deployment slot.
//! A peer that dies without ever restarting leaves its claim in flight
//! forever; this sweep catches those by age alone, regardless of owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::upload_repo;
use crate::db::{format_timestamp, parse_timestamp, Database, DatabaseError};

/// Synthetic error detail written onto swept uploads. An item stuck this
/// long needs operator attention, not a silent retry loop against an
/// input that may never parse.
pub const STALE_TIMEOUT_MESSAGE: &str = "processing timeout: owner may have crashed";

/// In-flight statistics for operator dashboards. Not load-bearing for
/// correctness.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepStats {
    /// `(owner, count)` of processing rows, busiest owner first.
    pub per_owner: Vec<(Option<String>, u64)>,
    /// Oldest in-flight claim: `(upload id, claimed_at)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_claim: Option<(String, String)>,
    /// Age of that claim in minutes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_claim_age_minutes: Option<i64>,
}

/// Periodic, owner-agnostic sweep of stale `processing` rows.
pub struct StaleLockReclaimer {
    db: Database,
    timeout: chrono::Duration,
}

impl StaleLockReclaimer {
    pub fn new(db: Database, timeout: chrono::Duration) -> Self {
        Self { db, timeout }
    }

    /// Force-fails every upload claimed at least `timeout` ago. Returns
    /// the number of rows swept; a second run over the same rows is a
    /// no-op since `failed` is terminal.
    pub fn sweep(&self) -> Result<usize, DatabaseError> {
        let cutoff = format_timestamp(Utc::now() - self.timeout);
        let now = format_timestamp(Utc::now());

        let swept = upload_repo::sweep_stale(&self.db, &cutoff, STALE_TIMEOUT_MESSAGE, &now)?;
        for id in &swept {
            log::warn!(
                "Swept stale upload {} (claimed before {}): marked failed",
                id,
                cutoff
            );
        }

        Ok(swept.len())
    }

    /// Current in-flight statistics.
    pub fn stats(&self) -> Result<SweepStats, DatabaseError> {
        let oldest_claim = upload_repo::oldest_processing(&self.db)?;
        let oldest_claim_age_minutes = oldest_claim
            .as_ref()
            .map(|(_, claimed_at)| (Utc::now() - parse_timestamp(claimed_at)).num_minutes());

        Ok(SweepStats {
            per_owner: upload_repo::processing_counts_by_owner(&self.db)?,
            oldest_claim,
            oldest_claim_age_minutes,
        })
    }
}

/// Runs the sweep on a fixed schedule, independent of any single
/// worker's lifecycle. A manual trigger wakes it early.
pub struct SweepScheduler {
    reclaimer: Arc<StaleLockReclaimer>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl SweepScheduler {
    pub fn new(reclaimer: Arc<StaleLockReclaimer>, interval: Duration) -> Self {
        Self {
            reclaimer,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the sweep loop in a background thread.
    /// Accepts a trigger receiver for manual sweep requests.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let reclaimer = Arc::clone(&self.reclaimer);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(interval);
                interval_timer.tick().await; // skip immediate first tick

                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::info!("Manual stale-lock sweep triggered");
                        },
                    }

                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    match reclaimer.sweep() {
                        Ok(0) => {}
                        Ok(count) => log::info!("Stale-lock sweep reclaimed {} uploads", count),
                        Err(e) => log::error!("Stale-lock sweep failed: {}", e),
                    }
                }
            });
        })
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
