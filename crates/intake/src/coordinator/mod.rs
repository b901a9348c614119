//! Distributed work claiming and the per-process worker loop.
//!
//! The uploads table is the single source of truth: workers share no
//! channel other than the database, and every claim is one conditional
//! UPDATE. The fleet-busy gate on top is an admission optimization,
//! never the correctness mechanism.

pub mod claim;
pub mod sweeper;
pub mod worker;

pub use claim::{ClaimCoordinator, WorkerId};
pub use sweeper::{StaleLockReclaimer, SweepScheduler, SweepStats, STALE_TIMEOUT_MESSAGE};
pub use worker::{
    CurrentUpload, ProcessingStatus, ProcessingWorker, StatusHandle, UploadProcessor,
};
