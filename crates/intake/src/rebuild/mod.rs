//! In-process registry of reporting-cache rebuild jobs.
//!
//! Single node, short-lived, ephemeral: this registry tracks the
//! asynchronous rebuilds of one process and nothing else. Finished jobs
//! stay visible for a retention window, then a deferred cleanup removes
//! them. The cleanup captures the job's own identity when it is
//! scheduled and re-validates it before deleting, so a stale timer can
//! never clobber a newer job that reused the same resource key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::stats_repo::{self, PeriodStatRow};
use crate::db::Database;

/// Default retention for finished jobs.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum RegistryError {
    /// A rebuild for this resource key is already running.
    #[error("A rebuild for '{0}' is already running")]
    AlreadyRunning(String),
}

/// State of one rebuild job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildStatus {
    Running,
    Complete,
    Error,
}

/// One rebuild job. Plain data: snapshots of this type are safe to
/// encode as a structured document, there is no scheduling handle
/// inside.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildJob {
    /// Unique per invocation; the identity deferred cleanup checks.
    pub job_id: String,
    /// Logical resource being rebuilt, e.g. a reporting period "2026-03".
    pub resource_key: String,
    pub status: RebuildStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Registry of rebuild jobs keyed by resource key.
///
/// Cloning is cheap (inner `Arc`s); clones share one registry.
#[derive(Clone)]
pub struct RebuildJobRegistry {
    jobs: Arc<RwLock<HashMap<String, RebuildJob>>>,
    /// Pending cleanup cancellation flags by resource key. Kept apart
    /// from the jobs map so snapshots stay plain data.
    cleanups: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    retention: Duration,
}

impl RebuildJobRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            cleanups: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    /// Registers a new running job. Refuses when one is already running
    /// for the key. Cancels any cleanup still pending from a previous
    /// job with the same key, so that timer cannot delete the fresh
    /// entry.
    pub fn start(&self, job_id: &str, resource_key: &str) -> Result<(), RegistryError> {
        self.cancel_pending_cleanup(resource_key);

        let mut jobs = self.write_jobs();
        if let Some(existing) = jobs.get(resource_key) {
            if existing.status == RebuildStatus::Running {
                return Err(RegistryError::AlreadyRunning(resource_key.to_string()));
            }
        }

        jobs.insert(
            resource_key.to_string(),
            RebuildJob {
                job_id: job_id.to_string(),
                resource_key: resource_key.to_string(),
                status: RebuildStatus::Running,
                start_time: Utc::now(),
                end_time: None,
                error: None,
            },
        );
        log::info!("Rebuild {} started for '{}'", job_id, resource_key);
        Ok(())
    }

    /// Marks the current job for the key complete and schedules its
    /// removal after the retention window.
    pub fn complete(&self, resource_key: &str) {
        self.finish(resource_key, RebuildStatus::Complete, None);
    }

    /// Marks the current job for the key failed and schedules its
    /// removal after the retention window.
    pub fn error(&self, resource_key: &str, message: &str) {
        self.finish(resource_key, RebuildStatus::Error, Some(message.to_string()));
    }

    fn finish(&self, resource_key: &str, status: RebuildStatus, error: Option<String>) {
        let job_id = {
            let mut jobs = self.write_jobs();
            let Some(job) = jobs.get_mut(resource_key) else {
                log::warn!("finish: no rebuild registered for '{}'", resource_key);
                return;
            };
            job.status = status;
            job.end_time = Some(Utc::now());
            job.error = error;
            job.job_id.clone()
        };

        self.schedule_cleanup(resource_key, &job_id);
    }

    /// True if a running job exists for the key. Callers use this to
    /// refuse duplicate rebuild requests cheaply.
    pub fn is_running(&self, resource_key: &str) -> bool {
        self.read_jobs()
            .get(resource_key)
            .map(|j| j.status == RebuildStatus::Running)
            .unwrap_or(false)
    }

    /// All jobs, newest first.
    pub fn all(&self) -> Vec<RebuildJob> {
        let mut result: Vec<RebuildJob> = self.read_jobs().values().cloned().collect();
        result.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        result
    }

    /// Snapshot keyed by resource key.
    pub fn as_map(&self) -> HashMap<String, RebuildJob> {
        self.read_jobs().clone()
    }

    /// Schedules the deferred deletion for a finished job, capturing
    /// the job's identity now. The timer thread re-checks both the
    /// cancellation flag and the stored identity before deleting.
    fn schedule_cleanup(&self, resource_key: &str, job_id: &str) {
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut cleanups = self.lock_cleanups();
            // A previous pending cleanup for this key is superseded.
            if let Some(old) = cleanups.insert(resource_key.to_string(), Arc::clone(&cancelled)) {
                old.store(true, Ordering::Release);
            }
        }

        let jobs = Arc::clone(&self.jobs);
        let cleanups = Arc::clone(&self.cleanups);
        let key = resource_key.to_string();
        let captured_id = job_id.to_string();
        let retention = self.retention;

        std::thread::spawn(move || {
            std::thread::sleep(retention);

            if cancelled.load(Ordering::Acquire) {
                return;
            }

            let mut jobs = match jobs.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Identity check: only delete the job this timer was armed
            // for. A newer job under the same key stays untouched.
            let matches = jobs
                .get(&key)
                .map(|j| j.job_id == captured_id)
                .unwrap_or(false);
            if matches {
                jobs.remove(&key);
                log::debug!("Rebuild {} for '{}' expired from registry", captured_id, key);
            }
            drop(jobs);

            let mut cleanups = match cleanups.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(flag) = cleanups.get(&key) {
                if Arc::ptr_eq(flag, &cancelled) {
                    cleanups.remove(&key);
                }
            }
        });
    }

    /// Arms a cleanup timer for an arbitrary identity so tests can
    /// exercise the identity re-validation directly.
    #[cfg(test)]
    fn schedule_cleanup_unmanaged(&self, resource_key: &str, job_id: &str) {
        self.schedule_cleanup(resource_key, job_id);
    }

    fn cancel_pending_cleanup(&self, resource_key: &str) {
        if let Some(flag) = self.lock_cleanups().remove(resource_key) {
            flag.store(true, Ordering::Release);
        }
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RebuildJob>> {
        match self.jobs.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Rebuild registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RebuildJob>> {
        match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Rebuild registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn lock_cleanups(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        match self.cleanups.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Rebuild cleanup lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for RebuildJobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Recomputes one reporting period's statistics row under a
/// registry-tracked job. The returned row is the fresh cache content.
pub fn rebuild_period(
    db: &Database,
    registry: &RebuildJobRegistry,
    period: &str,
) -> Result<PeriodStatRow, crate::error::IntakeError> {
    let job_id = uuid::Uuid::new_v4().to_string();
    registry.start(&job_id, period)?;

    match stats_repo::rebuild_period(db, period) {
        Ok(row) => {
            registry.complete(period);
            Ok(row)
        }
        Err(e) => {
            registry.error(period, &e.to_string());
            Err(crate::error::IntakeError::Database(e))
        }
    }
}
