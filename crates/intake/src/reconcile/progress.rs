//! Progress snapshots for the reconciliation engines.
//!
//! Plain data, safe to hand across the polling boundary: no handles,
//! no connections.

use serde::Serialize;

/// Engine state machine. `paused` only ever follows an explicit stop
/// request; a later start resumes from the next unprocessed partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

/// Progress of a hash-based cleanup run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupProgress {
    pub status: EngineStatus,
    pub records_deleted: u64,
    /// Partitions fully reconciled so far, in processing order.
    pub processed_dates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_date: Option<String>,
    pub total_dates: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for CleanupProgress {
    fn default() -> Self {
        Self {
            status: EngineStatus::Idle,
            records_deleted: 0,
            processed_dates: Vec::new(),
            current_date: None,
            total_dates: 0,
            error: None,
        }
    }
}

/// Progress of a filename-level scan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilenameScanProgress {
    pub status: EngineStatus,
    pub filenames_processed: u64,
    pub records_deleted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_filename: Option<String>,
    pub total_filenames: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for FilenameScanProgress {
    fn default() -> Self {
        Self {
            status: EngineStatus::Idle,
            filenames_processed: 0,
            records_deleted: 0,
            current_filename: None,
            total_filenames: 0,
            error: None,
        }
    }
}
