//! End-to-end coverage of the rebuild job registry and the guarded
//! period-stats rebuild.

mod common;

use std::time::Duration;

use common::{record, seed_records, test_db};
use intake::db::stats_repo;
use intake::rebuild::{rebuild_period, RebuildJobRegistry, RebuildStatus};
use intake::{IntakeError, RegistryError};

/// A stale cleanup timer from a finished job must not delete the entry
/// of a newer job that reused the same resource key.
#[test]
fn stale_cleanup_timer_cannot_clobber_new_job() {
    let registry = RebuildJobRegistry::with_retention(Duration::from_millis(50));

    registry.start("first", "2026-03").unwrap();
    registry.complete("2026-03");

    // Restart for the same period before the first job's timer fires.
    registry.start("second", "2026-03").unwrap();

    std::thread::sleep(Duration::from_millis(150));

    let job = registry.as_map().get("2026-03").cloned().expect(
        "the superseding job must survive the stale cleanup timer",
    );
    assert_eq!(job.job_id, "second");
    assert_eq!(job.status, RebuildStatus::Running);
}

/// Guarded rebuild: the registry tracks the run, refuses a concurrent
/// duplicate, and the cache row lands in the store.
#[test]
fn rebuild_period_is_guarded_and_writes_cache() {
    let db = test_db();
    seed_records(
        &db,
        &[
            record("u1", "a.dat", "2026-03-01", Some("h1")),
            record("u1", "a.dat", "2026-03-02", Some("h2")),
            record("u2", "b.dat", "2026-03-02", Some("h3")),
            record("u2", "b.dat", "2026-04-01", Some("h4")),
        ],
    );

    let registry = RebuildJobRegistry::with_retention(Duration::from_millis(50));
    let row = rebuild_period(&db, &registry, "2026-03").unwrap();
    assert_eq!(row.record_count, 3);
    assert_eq!(row.upload_count, 2);
    assert_eq!(row.distinct_dates, 2);

    let cached = stats_repo::find_period(&db, "2026-03").unwrap().unwrap();
    assert_eq!(cached.record_count, 3);

    let job = registry.as_map().get("2026-03").cloned().unwrap();
    assert_eq!(job.status, RebuildStatus::Complete);
}

/// A running rebuild blocks a second one for the same period; other
/// periods are unaffected.
#[test]
fn concurrent_rebuild_for_same_period_is_refused() {
    let registry = RebuildJobRegistry::with_retention(Duration::from_millis(50));

    registry.start("job-1", "2026-03").unwrap();
    assert!(registry.is_running("2026-03"));

    let err = registry.start("job-2", "2026-03").unwrap_err();
    assert!(matches!(err, RegistryError::AlreadyRunning(_)));

    // A guarded rebuild surfaces the same refusal through the umbrella
    // error.
    let db = test_db();
    let err = rebuild_period(&db, &registry, "2026-03").unwrap_err();
    assert!(matches!(err, IntakeError::Registry(_)));

    registry.start("job-3", "2026-04").unwrap();
    assert!(registry.is_running("2026-04"));
}

/// Finished jobs expire after retention; re-running refreshes the cache
/// with a new job identity.
#[test]
fn finished_jobs_expire_and_rebuilds_repeat() {
    let db = test_db();
    let registry = RebuildJobRegistry::with_retention(Duration::from_millis(40));

    rebuild_period(&db, &registry, "2026-03").unwrap();
    let first_id = registry.as_map().get("2026-03").unwrap().job_id.clone();

    std::thread::sleep(Duration::from_millis(120));
    assert!(registry.as_map().is_empty());

    rebuild_period(&db, &registry, "2026-03").unwrap();
    let second_id = registry.as_map().get("2026-03").unwrap().job_id.clone();
    assert_ne!(first_id, second_id);
}
