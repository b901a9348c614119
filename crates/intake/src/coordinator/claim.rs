//! Atomic claiming of queued uploads.

use chrono::Utc;

use crate::config::CoordinatorConfig;
use crate::db::upload_repo::{self, UploadRow};
use crate::db::{format_timestamp, Database, DatabaseError};

/// Identity of one worker process. Ephemeral: a restarted process mints
/// a fresh identity, which is exactly what lets the startup reclaim
/// recognize its predecessor's orphaned claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh ephemeral identity for this incarnation.
    pub fn ephemeral() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-worker claiming logic.
///
/// Datastore errors inside the claim path are conservative: a failed
/// status check reads as "fleet busy", a failed claim reads as
/// "claim lost". The conditional UPDATE is the only state-mutating
/// step, so no error can leave a row half-claimed.
#[derive(Clone)]
pub struct ClaimCoordinator {
    db: Database,
    config: CoordinatorConfig,
}

impl ClaimCoordinator {
    pub fn new(db: Database, config: CoordinatorConfig) -> Self {
        Self { db, config }
    }

    /// Resets uploads orphaned by a previous incarnation of this worker:
    /// any `processing` row whose owner is not this identity (including
    /// no owner at all) goes back to `queued`. There is no heartbeat;
    /// identity mismatch at restart is the only crash signal this path
    /// can see. Returns the reclaimed ids. Safe to call on every boot.
    pub fn reclaim_owned_orphans(
        &self,
        worker: &WorkerId,
    ) -> Result<Vec<String>, DatabaseError> {
        let orphans = upload_repo::reset_foreign_processing(&self.db, worker.as_str())?;

        for (id, owner) in &orphans {
            log::info!(
                "Reclaimed orphaned upload {} (previous owner: {}), re-queued",
                id,
                owner.as_deref().unwrap_or("none")
            );
        }

        Ok(orphans.into_iter().map(|(id, _)| id).collect())
    }

    /// Coarse fleet-wide gate: true if any upload anywhere is in flight.
    /// The system processes at most one item across the whole fleet at a
    /// time, trading throughput for bounded downstream load. Datastore
    /// errors read as busy.
    pub fn is_fleet_busy(&self) -> bool {
        match upload_repo::count_by_status(&self.db, upload_repo::STATUS_PROCESSING) {
            Ok(count) => count > 0,
            Err(e) => {
                log::warn!("is_fleet_busy: datastore error, assuming busy: {}", e);
                true
            }
        }
    }

    /// Selects the oldest eligible queued upload and attempts to claim
    /// it. Returns `None` when nothing is eligible or the claim lost its
    /// race even after retries.
    pub fn claim_next(&self, worker: &WorkerId) -> Option<UploadRow> {
        let candidate = match upload_repo::next_eligible(&self.db) {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("claim_next: datastore error, skipping this pass: {}", e);
                return None;
            }
        };

        if !self.claim(&candidate.id, worker) {
            return None;
        }

        // Re-read so the caller sees the claim fields it just won.
        match upload_repo::find_by_id(&self.db, &candidate.id) {
            Ok(Some(row)) => Some(row),
            _ => Some(candidate),
        }
    }

    /// Claims a specific upload, retrying under contention with
    /// exponential backoff before giving up.
    pub fn claim(&self, id: &str, worker: &WorkerId) -> bool {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if self.try_claim(id, worker) {
                return true;
            }
            if attempt > self.config.claim_max_attempts {
                break;
            }
            // Retries absorb overlapping trigger invocations within one
            // process; cross-fleet contention is already rare behind the
            // fleet-busy gate.
            std::thread::sleep(self.config.claim_backoff(attempt));
        }

        log::warn!(
            "Claim exhausted for upload {} after {} retries; item stays queued and may be \
             picked up again later, raising the risk of duplicate processing",
            id,
            self.config.claim_max_attempts
        );
        false
    }

    /// One conditional claim attempt. Race-free between competing
    /// callers on its own: the row predicate and the update travel in a
    /// single round trip. Datastore errors read as a lost claim.
    pub fn try_claim(&self, id: &str, worker: &WorkerId) -> bool {
        let claimed_at = format_timestamp(Utc::now());
        match upload_repo::try_claim(&self.db, id, worker.as_str(), &claimed_at) {
            Ok(won) => won,
            Err(e) => {
                log::warn!("try_claim {}: datastore error, assuming claim lost: {}", id, e);
                false
            }
        }
    }

    /// Terminal success transition.
    pub fn mark_completed(&self, id: &str) -> Result<(), DatabaseError> {
        upload_repo::mark_completed(&self.db, id, &format_timestamp(Utc::now()))
    }

    /// Terminal failure transition. Never auto-retried by this core:
    /// whether a failed parse deserves another attempt is the domain
    /// processor's call.
    pub fn mark_failed(&self, id: &str, message: &str) -> Result<(), DatabaseError> {
        upload_repo::mark_failed(&self.db, id, message, &format_timestamp(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::upload_repo::{NewUpload, KIND_RECORDS, STATUS_PROCESSING, STATUS_QUEUED};

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            claim_backoff_ms: 1,
            ..CoordinatorConfig::default()
        }
    }

    fn coordinator() -> ClaimCoordinator {
        let db = Database::open_in_memory().expect("Failed to create test database");
        ClaimCoordinator::new(db, fast_config())
    }

    fn enqueue(c: &ClaimCoordinator, id: &str, kind: &str, created_at: &str) {
        upload_repo::insert(
            &c.db,
            &NewUpload {
                id: id.to_string(),
                filename: format!("{}.dat", id),
                file_kind: kind.to_string(),
            },
            created_at,
        )
        .unwrap();
    }

    #[test]
    fn test_reclaim_resets_foreign_owners_only() {
        let c = coordinator();
        let me = WorkerId::new("worker-self");
        let other = WorkerId::new("worker-other");

        enqueue(&c, "mine", KIND_RECORDS, "2026-01-01T00:00:00+00:00");
        enqueue(&c, "theirs", KIND_RECORDS, "2026-01-01T00:00:01+00:00");
        assert!(c.try_claim("mine", &me));
        assert!(c.try_claim("theirs", &other));

        let reclaimed = c.reclaim_owned_orphans(&me).unwrap();
        assert_eq!(reclaimed, vec!["theirs".to_string()]);

        let mine = upload_repo::find_by_id(&c.db, "mine").unwrap().unwrap();
        assert_eq!(mine.status, STATUS_PROCESSING);
        let theirs = upload_repo::find_by_id(&c.db, "theirs").unwrap().unwrap();
        assert_eq!(theirs.status, STATUS_QUEUED);
        assert!(theirs.owner.is_none());
    }

    #[test]
    fn test_reclaim_is_idempotent() {
        let c = coordinator();
        let me = WorkerId::ephemeral();
        enqueue(&c, "u1", KIND_RECORDS, "2026-01-01T00:00:00+00:00");
        assert!(c.try_claim("u1", &WorkerId::new("dead-worker")));

        assert_eq!(c.reclaim_owned_orphans(&me).unwrap().len(), 1);
        assert!(c.reclaim_owned_orphans(&me).unwrap().is_empty());
    }

    #[test]
    fn test_fleet_busy() {
        let c = coordinator();
        assert!(!c.is_fleet_busy());

        enqueue(&c, "u1", KIND_RECORDS, "2026-01-01T00:00:00+00:00");
        assert!(!c.is_fleet_busy());

        assert!(c.try_claim("u1", &WorkerId::new("w1")));
        assert!(c.is_fleet_busy());

        c.mark_completed("u1").unwrap();
        assert!(!c.is_fleet_busy());
    }

    #[test]
    fn test_claim_next_respects_priority() {
        let c = coordinator();
        let w = WorkerId::new("w1");
        enqueue(&c, "manifest", "manifest", "2026-01-01T00:00:00+00:00");
        enqueue(&c, "data", KIND_RECORDS, "2026-01-02T00:00:00+00:00");

        let claimed = c.claim_next(&w).unwrap();
        assert_eq!(claimed.id, "data");
        assert_eq!(claimed.status, STATUS_PROCESSING);
        assert_eq!(claimed.owner.as_deref(), Some("w1"));
        assert!(claimed.claimed_at.is_some());
    }

    #[test]
    fn test_claim_next_empty_queue() {
        let c = coordinator();
        assert!(c.claim_next(&WorkerId::new("w1")).is_none());
    }

    #[test]
    fn test_claim_gives_up_after_retries() {
        let c = coordinator();
        enqueue(&c, "taken", KIND_RECORDS, "2026-01-01T00:00:00+00:00");
        assert!(c.try_claim("taken", &WorkerId::new("winner")));

        // The loser retries and then gives up; the winner keeps the row.
        assert!(!c.claim("taken", &WorkerId::new("loser")));
        let row = upload_repo::find_by_id(&c.db, "taken").unwrap().unwrap();
        assert_eq!(row.owner.as_deref(), Some("winner"));
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let c = coordinator();
        enqueue(&c, "contested", KIND_RECORDS, "2026-01-01T00:00:00+00:00");

        let mut handles = Vec::new();
        for i in 0..4 {
            let c = c.clone();
            handles.push(std::thread::spawn(move || {
                c.try_claim("contested", &WorkerId::new(format!("w{}", i)))
            }));
        }

        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_terminal_transitions() {
        let c = coordinator();
        let w = WorkerId::new("w1");
        enqueue(&c, "ok", KIND_RECORDS, "2026-01-01T00:00:00+00:00");
        enqueue(&c, "bad", KIND_RECORDS, "2026-01-01T00:00:01+00:00");

        let claimed = c.claim_next(&w).unwrap();
        assert_eq!(claimed.id, "ok");
        c.mark_completed("ok").unwrap();

        let claimed = c.claim_next(&w).unwrap();
        assert_eq!(claimed.id, "bad");
        c.mark_failed("bad", "unreadable record layout").unwrap();

        let ok = upload_repo::find_by_id(&c.db, "ok").unwrap().unwrap();
        assert_eq!(ok.status, "completed");
        let bad = upload_repo::find_by_id(&c.db, "bad").unwrap().unwrap();
        assert_eq!(bad.status, "failed");
        assert_eq!(bad.error_detail.as_deref(), Some("unreadable record layout"));
    }
}
