//! End-to-end sync jobs against the in-memory source.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use sitestats::models::InsertMode;
use sitestats::rate_limit::{RateLimitConfig, RateLimiter};
use sitestats::repository::StorageEngine;
use sitestats::shutdown::{SharedShutdown, ShutdownCoordinator};
use sitestats::source::{
    DailyRow, DimensionChunk, HourlyRow, InMemorySource, ScriptedFailure, SourceError,
};
use sitestats::state::{StateManager, SyncCheckpoint, WorkUnit};
use sitestats::sync::{SyncOptions, SyncOrchestrator};
use tempfile::{tempdir, TempDir};

const SITES: [&str; 3] = ["alpha.example", "beta.example", "gamma.example"];

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
}

fn domains(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn chunk(device: &str, prefix: &str, n: usize) -> DimensionChunk {
    DimensionChunk {
        device: device.to_string(),
        search_type: "web".to_string(),
        rows: (0..n)
            .map(|i| DailyRow {
                page: format!("/{prefix}/{}", i % 5),
                query: format!("{prefix} {i}"),
                clicks: 1,
                impressions: 4,
                ctr: 0.25,
                position: 3.0,
            })
            .collect(),
    }
}

/// Two chunks (2 + 1 rows) for every site and day 1..=days.
fn grid_source(days: u32) -> InMemorySource {
    let mut source = InMemorySource::new();
    for site in SITES {
        for day in 1..=days {
            source = source.with_day(
                site,
                d(day),
                vec![chunk("DESKTOP", "q", 2), chunk("MOBILE", "q", 1)],
            );
        }
    }
    source
}

struct Harness {
    dir: TempDir,
    storage: Arc<StorageEngine>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let storage = Arc::new(StorageEngine::open(&dir.path().join("stats.db")).unwrap());
        Self { dir, storage }
    }

    fn state(&self) -> StateManager {
        StateManager::new(self.dir.path().join("checkpoint.json"))
    }

    fn orchestrator(
        &self,
        source: Arc<InMemorySource>,
        limits: RateLimitConfig,
        shutdown: SharedShutdown,
        options: SyncOptions,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            Arc::clone(&self.storage),
            source,
            RateLimiter::new(limits),
            self.state(),
            shutdown,
            options,
        )
    }

    fn simple(&self, source: Arc<InMemorySource>, options: SyncOptions) -> SyncOrchestrator {
        self.orchestrator(
            source,
            RateLimitConfig::default(),
            ShutdownCoordinator::shared(),
            options,
        )
    }
}

#[tokio::test]
async fn rerun_in_skip_mode_inserts_nothing() {
    let harness = Harness::new();
    let source = Arc::new(
        InMemorySource::new().with_day(
            "example.com",
            d(1),
            vec![chunk("DESKTOP", "a", 500), chunk("MOBILE", "b", 300)],
        ),
    );

    let mut sync = harness.simple(Arc::clone(&source), SyncOptions::default());
    let summary = sync.run(&domains(&["example.com"]), d(1), d(1)).await.unwrap();
    assert_eq!(summary.stats.inserted, 800);
    assert!(summary.is_complete());

    let first_job = summary.job_id;
    let summary = sync.run(&domains(&["example.com"]), d(1), d(1)).await.unwrap();
    assert_eq!(summary.stats.inserted, 0);
    assert_eq!(summary.stats.skipped, 800);
    assert_eq!(summary.days_resumed_past, 0);
    assert_ne!(summary.job_id, first_job);
    assert_eq!(source.opened().await.len(), 2);

    let site = harness.storage.site_by_domain("example.com").unwrap().unwrap();
    assert_eq!(harness.storage.count_for_day(site.id, d(1)).unwrap(), 800);
}

#[tokio::test]
async fn completed_job_is_not_resumed() {
    let harness = Harness::new();
    let source = Arc::new(grid_source(2));
    let mut sync = harness.simple(Arc::clone(&source), SyncOptions::default());

    let first = sync.run(&domains(&SITES), d(1), d(2)).await.unwrap();
    assert_eq!(first.days_completed, 6);
    let stored = harness.state().load().unwrap().unwrap();
    assert_eq!(stored.job_id, first.job_id);
    assert!(stored.completed_at.is_some());

    let second = sync.run(&domains(&SITES), d(1), d(2)).await.unwrap();
    assert_ne!(second.job_id, first.job_id);
    assert_eq!(second.days_resumed_past, 0);
    assert_eq!(second.days_completed, 6);
    assert_eq!(second.stats.inserted, 0);
    assert_eq!(second.stats.skipped, 18);
    assert_eq!(source.opened().await.len(), 12);
}

#[tokio::test]
async fn checkpoint_at_last_unit_starts_a_new_job() {
    let harness = Harness::new();
    let site = harness.storage.ensure_site("example.com").unwrap();
    let mut checkpoint = SyncCheckpoint::new(InsertMode::Skip, d(1), d(2), vec![site.id]);
    checkpoint.advance(
        WorkUnit {
            site_id: site.id,
            date: d(2),
        },
        Default::default(),
    );
    harness.state().save(&checkpoint).unwrap();

    let source = Arc::new(
        InMemorySource::new()
            .with_day("example.com", d(1), vec![chunk("DESKTOP", "q", 1)])
            .with_day("example.com", d(2), vec![chunk("DESKTOP", "q", 1)]),
    );
    let summary = harness
        .simple(Arc::clone(&source), SyncOptions::default())
        .run(&domains(&["example.com"]), d(1), d(2))
        .await
        .unwrap();
    assert_ne!(summary.job_id, checkpoint.job_id);
    assert_eq!(summary.days_completed, 2);
    assert_eq!(summary.stats.inserted, 2);
}

#[tokio::test(start_paused = true)]
async fn rows_written_before_a_retry_are_counted_as_inserted() {
    let harness = Harness::new();
    let source = Arc::new(
        InMemorySource::new()
            .with_day(
                "example.com",
                d(1),
                vec![chunk("DESKTOP", "a", 500), chunk("MOBILE", "b", 300)],
            )
            .with_failure(
                "example.com",
                d(1),
                ScriptedFailure {
                    after_chunks: 1,
                    error: SourceError::Transient("connection reset".into()),
                },
            ),
    );

    let summary = harness
        .simple(Arc::clone(&source), SyncOptions::default())
        .run(&domains(&["example.com"]), d(1), d(1))
        .await
        .unwrap();
    assert!(summary.is_complete());
    assert_eq!(summary.stats.inserted, 800);
    // the retry re-fetched the first chunk
    assert_eq!(summary.stats.skipped, 500);
    assert_eq!(source.opened().await.len(), 2);

    let site = harness.storage.site_by_domain("example.com").unwrap().unwrap();
    assert_eq!(harness.storage.count_for_day(site.id, d(1)).unwrap(), 800);
    let checkpoint = harness.state().load().unwrap().unwrap();
    assert_eq!(checkpoint.stats.inserted, 800);
}

#[tokio::test(start_paused = true)]
async fn overwrite_failure_keeps_previous_day() {
    let harness = Harness::new();
    let original = Arc::new(
        InMemorySource::new().with_day("example.com", d(1), vec![chunk("DESKTOP", "old", 4)]),
    );
    harness
        .simple(original, SyncOptions::default())
        .run(&domains(&["example.com"]), d(1), d(1))
        .await
        .unwrap();

    let overwrite = SyncOptions {
        mode: InsertMode::Overwrite,
        ..Default::default()
    };
    let broken = Arc::new(
        InMemorySource::new()
            .with_day(
                "example.com",
                d(1),
                vec![chunk("DESKTOP", "new", 2), chunk("MOBILE", "new", 2)],
            )
            .with_failure(
                "example.com",
                d(1),
                ScriptedFailure {
                    after_chunks: 1,
                    error: SourceError::Permanent("quota project disabled".into()),
                },
            ),
    );
    let summary = harness
        .simple(broken, overwrite.clone())
        .run(&domains(&["example.com"]), d(1), d(1))
        .await
        .unwrap();
    assert_eq!(summary.failed_units.len(), 1);

    let site = harness.storage.site_by_domain("example.com").unwrap().unwrap();
    let stored = harness.storage.records_for_day(site.id, d(1)).unwrap();
    assert_eq!(stored.len(), 4);
    assert!(stored.iter().all(|r| r.query.starts_with("old")));

    let revised = Arc::new(InMemorySource::new().with_day(
        "example.com",
        d(1),
        vec![chunk("DESKTOP", "new", 2), chunk("MOBILE", "new", 2)],
    ));
    let summary = harness
        .simple(revised, overwrite)
        .run(&domains(&["example.com"]), d(1), d(1))
        .await
        .unwrap();
    assert!(summary.is_complete());
    let stored = harness.storage.records_for_day(site.id, d(1)).unwrap();
    assert_eq!(stored.len(), 4);
    assert!(stored.iter().all(|r| r.query.starts_with("new")));
}

#[tokio::test]
async fn resume_skips_completed_prefix() {
    // uninterrupted reference run
    let full = Harness::new();
    let source = Arc::new(grid_source(10));
    let reference = full
        .simple(Arc::clone(&source), SyncOptions::default())
        .run(&domains(&SITES), d(1), d(10))
        .await
        .unwrap();
    assert_eq!(reference.days_completed, 30);
    assert_eq!(reference.stats.inserted, 90);

    // same job, checkpoint says everything up to (site 2, day 5) is done
    let resumed = Harness::new();
    let ids: Vec<i64> = SITES
        .iter()
        .map(|s| resumed.storage.ensure_site(s).unwrap().id)
        .collect();
    let mut checkpoint = SyncCheckpoint::new(InsertMode::Skip, d(1), d(10), ids.clone());
    checkpoint.advance(
        WorkUnit {
            site_id: ids[1],
            date: d(5),
        },
        Default::default(),
    );
    resumed.state().save(&checkpoint).unwrap();

    let source = Arc::new(grid_source(10));
    let summary = resumed
        .simple(Arc::clone(&source), SyncOptions::default())
        .run(&domains(&SITES), d(1), d(10))
        .await
        .unwrap();

    assert_eq!(summary.job_id, checkpoint.job_id);
    assert_eq!(summary.days_resumed_past, 15);
    assert_eq!(summary.days_completed, reference.days_completed - 15);
    assert_eq!(summary.stats.inserted, reference.stats.inserted - 15 * 3);

    let opened = source.opened().await;
    assert_eq!(opened.len(), 15);
    assert_eq!(opened[0], ("beta.example".to_string(), d(6)));
    assert!(opened.iter().all(|(site, _)| site != "alpha.example"));

    let stored = resumed.state().load().unwrap().unwrap();
    assert_eq!(
        stored.last_completed,
        Some(WorkUnit {
            site_id: ids[2],
            date: d(10)
        })
    );
    assert_eq!(stored.days_completed, 1 + 15);
}

#[tokio::test]
async fn changed_site_set_starts_over() {
    let harness = Harness::new();
    let ids: Vec<i64> = SITES
        .iter()
        .map(|s| harness.storage.ensure_site(s).unwrap().id)
        .collect();
    let mut checkpoint = SyncCheckpoint::new(InsertMode::Skip, d(1), d(3), ids.clone());
    checkpoint.advance(
        WorkUnit {
            site_id: ids[1],
            date: d(2),
        },
        Default::default(),
    );
    harness.state().save(&checkpoint).unwrap();

    let source = Arc::new(grid_source(3));
    let summary = harness
        .simple(Arc::clone(&source), SyncOptions::default())
        .run(&domains(&SITES[..2]), d(1), d(3))
        .await
        .unwrap();

    assert_ne!(summary.job_id, checkpoint.job_id);
    assert_eq!(summary.days_resumed_past, 0);
    assert_eq!(summary.days_completed, 6);
    assert_eq!(source.opened().await[0], ("alpha.example".to_string(), d(1)));
}

#[tokio::test(start_paused = true)]
async fn requests_respect_minute_ceiling_and_never_overlap() {
    let harness = Harness::new();
    let source = Arc::new(
        InMemorySource::new()
            .with_day("example.com", d(1), vec![chunk("DESKTOP", "q", 1)])
            .with_day("example.com", d(2), vec![chunk("DESKTOP", "q", 1)])
            .with_day("example.com", d(3), vec![chunk("DESKTOP", "q", 1)])
            .with_day("example.com", d(4), vec![chunk("DESKTOP", "q", 1)])
            .with_latency(Duration::from_millis(200)),
    );
    let limits = RateLimitConfig {
        requests_per_minute: 5,
        ..Default::default()
    };
    let mut sync = harness.orchestrator(
        Arc::clone(&source),
        limits,
        ShutdownCoordinator::shared(),
        SyncOptions::default(),
    );

    let started = tokio::time::Instant::now();
    let summary = sync.run(&domains(&["example.com"]), d(1), d(4)).await.unwrap();
    let elapsed = started.elapsed();

    // open + one chunk + end-of-stream per day
    assert_eq!(summary.api_requests, 12);
    assert_eq!(source.request_count(), 12);
    // 12 requests at 5/min need at least two full windows
    assert!(elapsed >= Duration::from_secs(120), "finished after {elapsed:?}");
    assert_eq!(source.max_in_flight(), 1);

    let snapshot = sync.limiter().usage_snapshot();
    assert!(snapshot.minute_count <= 5);
    assert_eq!(snapshot.daily_count, 12);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_at_a_date_boundary() {
    let harness = Harness::new();
    let shutdown = ShutdownCoordinator::shared();
    let limits = RateLimitConfig {
        requests_per_minute: 2,
        ..Default::default()
    };
    let source = Arc::new(
        InMemorySource::new()
            .with_day("example.com", d(1), vec![chunk("DESKTOP", "q", 1)])
            .with_day("example.com", d(2), vec![chunk("DESKTOP", "q", 1)])
            .with_day("example.com", d(3), vec![chunk("DESKTOP", "q", 1)]),
    );
    let mut sync = harness.orchestrator(
        Arc::clone(&source),
        limits.clone(),
        Arc::clone(&shutdown),
        SyncOptions::default(),
    );

    let trigger = {
        let shutdown = Arc::clone(&shutdown);
        async move {
            tokio::time::sleep(Duration::from_secs(90)).await;
            shutdown.request_shutdown();
        }
    };
    let targets = domains(&["example.com"]);
    let (summary, ()) = tokio::join!(sync.run(&targets, d(1), d(3)), trigger);
    let summary = summary.unwrap();

    assert!(summary.cancelled);
    assert!(summary.days_completed < 3);
    let checkpoint = harness.state().load().unwrap().unwrap();
    assert_eq!(checkpoint.days_completed, summary.days_completed);
    if summary.days_completed > 0 {
        assert_eq!(
            checkpoint.last_completed.map(|u| u.date),
            Some(d(summary.days_completed as u32))
        );
    }

    // a fresh run picks up after the last completed day
    let already = summary.days_completed;
    let opened_before = source.opened().await.len();
    let mut sync = harness.orchestrator(
        Arc::clone(&source),
        limits,
        ShutdownCoordinator::shared(),
        SyncOptions::default(),
    );
    let resumed = sync.run(&domains(&["example.com"]), d(1), d(3)).await.unwrap();
    assert!(resumed.is_complete());
    assert_eq!(resumed.days_resumed_past, already);
    assert_eq!(resumed.days_completed, 3 - already);
    let opened = source.opened().await;
    assert_eq!(opened[opened_before].1, d(already as u32 + 1));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_recorded_and_job_continues() {
    let harness = Harness::new();
    let mut source = InMemorySource::new()
        .with_day("example.com", d(1), vec![chunk("DESKTOP", "q", 1)])
        .with_day("example.com", d(2), vec![chunk("DESKTOP", "q", 1)]);
    for _ in 0..4 {
        source = source.with_failure(
            "example.com",
            d(1),
            ScriptedFailure {
                after_chunks: 1,
                error: SourceError::RateLimited {
                    retry_after: Some(Duration::from_secs(30)),
                },
            },
        );
    }
    let source = Arc::new(source);
    let options = SyncOptions {
        max_retries: 3,
        retry_delay: Duration::from_secs(5),
        ..Default::default()
    };
    let mut sync = harness.simple(Arc::clone(&source), options);

    let started = tokio::time::Instant::now();
    let summary = sync.run(&domains(&["example.com"]), d(1), d(2)).await.unwrap();

    assert_eq!(summary.failed_units.len(), 1);
    assert_eq!(summary.failed_units[0].attempts, 4);
    assert_eq!(summary.days_completed, 1);
    // three pauses honouring retry_after
    assert!(started.elapsed() >= Duration::from_secs(90));

    let checkpoint = harness.state().load().unwrap().unwrap();
    assert_eq!(checkpoint.failed_units.len(), 1);
    assert_eq!(checkpoint.last_completed.map(|u| u.date), Some(d(2)));
}

#[tokio::test]
async fn bulk_load_option_restores_indexes() {
    let harness = Harness::new();
    let indexes = harness.storage.secondary_indexes().unwrap();
    let options = SyncOptions {
        bulk_load: true,
        ..Default::default()
    };
    let summary = harness
        .simple(Arc::new(grid_source(2)), options)
        .run(&domains(&SITES), d(1), d(2))
        .await
        .unwrap();
    assert_eq!(summary.stats.inserted, 18);
    assert!(!harness.storage.is_bulk_loading());
    assert_eq!(harness.storage.secondary_indexes().unwrap(), indexes);
}

#[tokio::test]
async fn empty_domain_list_uses_active_sites() {
    let harness = Harness::new();
    for site in SITES {
        harness.storage.ensure_site(site).unwrap();
    }
    let gamma = harness.storage.site_by_domain("gamma.example").unwrap().unwrap();
    harness.storage.set_site_active(gamma.id, false).unwrap();

    let source = Arc::new(grid_source(1));
    let summary = harness
        .simple(Arc::clone(&source), SyncOptions::default())
        .run(&[], d(1), d(1))
        .await
        .unwrap();
    assert_eq!(summary.days_completed, 2);
    assert!(source
        .opened()
        .await
        .iter()
        .all(|(site, _)| site != "gamma.example"));
}

#[tokio::test]
async fn hourly_sync_counts_bad_hours_as_failed() {
    let harness = Harness::new();
    let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
    let row = |hour: u8, query: &str| HourlyRow {
        date: yesterday,
        hour,
        query: query.to_string(),
        page: "/".to_string(),
        position: 2.0,
        clicks: 3,
        impressions: 9,
        ctr: 1.0 / 3.0,
    };
    let source = Arc::new(InMemorySource::new().with_hourly(
        "example.com",
        vec![row(0, "a"), row(1, "a"), row(13, "b"), row(24, "c")],
    ));

    let mut sync = harness.simple(Arc::clone(&source), SyncOptions::default());
    let start = yesterday - chrono::Duration::days(60);
    let summary = sync
        .sync_hourly(&domains(&["example.com"]), start, yesterday)
        .await
        .unwrap();
    assert_eq!(summary.stats.inserted, 3);
    assert_eq!(summary.stats.failed, 1);
    assert!(summary.failed_units.is_empty());

    let again = sync
        .sync_hourly(&domains(&["example.com"]), start, yesterday)
        .await
        .unwrap();
    assert_eq!(again.stats.inserted, 0);
    assert_eq!(again.stats.skipped, 3);

    let site = harness.storage.site_by_domain("example.com").unwrap().unwrap();
    let profile = harness
        .storage
        .analytics()
        .hourly_profile(site.id, yesterday, yesterday)
        .unwrap();
    assert_eq!(profile.len(), 3);
    assert_eq!(harness.storage.stats().unwrap().hourly_rows, 3);
}
