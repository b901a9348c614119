//! Duplicate-record reconciliation.
//!
//! At-least-once processing can ingest the same content twice: an
//! overlapping claim, a re-uploaded file. These engines compensate
//! after the fact, electing one canonical row per duplicate group and
//! deleting the rest in bounded batches so a table of millions of rows
//! never sits behind one giant transaction.

pub mod filename_dedup;
pub mod hash_dedup;
pub mod progress;

pub use filename_dedup::FilenameDuplicateService;
pub use hash_dedup::{DuplicateReconciler, ReconcilerStats};
pub use progress::{CleanupProgress, EngineStatus, FilenameScanProgress};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// A reconciliation run is already active on this engine.
    #[error("A reconciliation run is already active")]
    AlreadyRunning,
}
