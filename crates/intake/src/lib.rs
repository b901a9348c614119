pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod rebuild;
pub mod reconcile;

pub use config::{load_config, CoordinatorConfig};
pub use coordinator::{
    ClaimCoordinator, ProcessingStatus, ProcessingWorker, StaleLockReclaimer, SweepScheduler,
    SweepStats, UploadProcessor, WorkerId, STALE_TIMEOUT_MESSAGE,
};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, IntakeError, ProcessorError, Result};
pub use rebuild::{RebuildJob, RebuildJobRegistry, RebuildStatus, RegistryError};
pub use reconcile::{
    CleanupProgress, DuplicateReconciler, EngineStatus, FilenameDuplicateService,
    FilenameScanProgress, ReconcileError, ReconcilerStats,
};
