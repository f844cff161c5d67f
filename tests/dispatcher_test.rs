//! Integration tests for the dispatch cycle against a real queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use channel_crawler::crawler::{CrawlSettings, CrawlWindow, FeedSource, FetchError, ParsedPage};
use channel_crawler::db::{
    delete_channel_state, get_channel_state, get_recent_runs, get_running_channels, Database,
};
use channel_crawler::dispatcher::Dispatcher;
use channel_crawler::queue::TaskQueue;
use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Source whose fetches block until the test hands out permits. Every page
/// is empty, so a released job stops after its first page.
struct GatedSource {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl FeedSource for GatedSource {
    fn source_id(&self) -> &'static str {
        "gated"
    }

    async fn fetch_page(&self, _channel_id: &str, _anchor: Option<i64>) -> Result<String, FetchError> {
        let _permit = self.gate.acquire().await.expect("gate closed");
        Ok(String::new())
    }

    fn parse_page(&self, _markup: &str, _window: &CrawlWindow) -> ParsedPage {
        ParsedPage::default()
    }
}

async fn setup_db() -> (Arc<Database>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (Arc::new(db), temp_dir)
}

/// A second handle on the same file, standing in for another process.
async fn open_peer(temp: &TempDir) -> Arc<Database> {
    let db = Database::new(&temp.path().join("test.sqlite"))
        .await
        .expect("Failed to open peer database");
    Arc::new(db)
}

/// Wait until every tracked job of `dispatcher` has completed.
async fn wait_for_jobs(dispatcher: &Dispatcher<Database>) {
    for _ in 0..200 {
        if dispatcher.state().finished_count() == dispatcher.state().running_count() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("jobs did not finish");
}

fn dispatcher(db: &Arc<Database>, gate: &Arc<Semaphore>) -> Dispatcher<Database> {
    let source = GatedSource {
        gate: Arc::clone(gate),
    };
    Dispatcher::new(
        Arc::clone(db),
        Arc::new(source),
        CrawlSettings {
            page_delay: Duration::ZERO,
            max_empty_pages: 3,
        },
        Duration::from_millis(20),
    )
}

fn window(channel: &str) -> CrawlWindow {
    let now = Utc::now();
    CrawlWindow::new(channel, now - ChronoDuration::days(1), now)
}

#[tokio::test]
async fn test_fills_capacity_and_leaves_rest_pending() {
    let (db, _temp) = setup_db().await;
    let gate = Arc::new(Semaphore::new(0));
    let mut dispatcher = dispatcher(&db, &gate);

    db.set_capacity(3).await.unwrap();
    for channel in ["a1", "a2", "a3", "a4", "a5"] {
        db.enqueue(&window(channel)).await.unwrap();
    }

    let summary = dispatcher.run_cycle().await.unwrap();
    assert_eq!(summary.started, 3);
    assert_eq!(summary.running, 3);
    assert_eq!(summary.capacity, 3);
    assert_eq!(db.pending_count().await.unwrap(), 2);
    // Oldest requests are claimed first.
    assert_eq!(dispatcher.state().running_channels(), vec!["a1", "a2", "a3"]);

    // Nothing more fits while the slots are busy.
    let summary = dispatcher.run_cycle().await.unwrap();
    assert_eq!(summary.started, 0);
    assert_eq!(db.pending_count().await.unwrap(), 2);

    gate.add_permits(100);
    assert_eq!(dispatcher.drain().await, 3);

    let summary = dispatcher.run_cycle().await.unwrap();
    assert_eq!(summary.started, 2);
    assert_eq!(db.pending_count().await.unwrap(), 0);
    dispatcher.drain().await;

    let runs = get_recent_runs(db.pool(), None, 10).await.unwrap();
    assert_eq!(runs.len(), 5);
    for run in &runs {
        assert_eq!(run.state, "succeeded");
        assert_eq!(run.stop_reason.as_deref(), Some("no_more_history"));
        assert_eq!(run.pages_fetched, 1);
        assert!(run.finished_at.is_some());
    }
}

#[tokio::test]
async fn test_never_runs_two_jobs_for_one_channel() {
    let (db, _temp) = setup_db().await;
    let gate = Arc::new(Semaphore::new(0));
    let mut dispatcher = dispatcher(&db, &gate);

    db.set_capacity(5).await.unwrap();
    db.enqueue(&window("alpha")).await.unwrap();
    db.enqueue(&window("alpha")).await.unwrap();
    db.enqueue(&window("beta")).await.unwrap();

    let summary = dispatcher.run_cycle().await.unwrap();
    assert_eq!(summary.started, 2);
    assert_eq!(dispatcher.state().running_channels(), vec!["alpha", "beta"]);
    assert_eq!(db.pending_count().await.unwrap(), 1);

    gate.add_permits(100);
    dispatcher.drain().await;

    // With the first alpha job gone the second one is eligible.
    let summary = dispatcher.run_cycle().await.unwrap();
    assert_eq!(summary.started, 1);
    assert!(dispatcher.state().is_channel_running("alpha"));
    dispatcher.drain().await;
}

#[tokio::test]
async fn test_capacity_is_read_every_cycle() {
    let (db, _temp) = setup_db().await;
    let gate = Arc::new(Semaphore::new(0));
    let mut dispatcher = dispatcher(&db, &gate);

    // No capacity configured yet means no work is taken.
    db.enqueue(&window("c1")).await.unwrap();
    db.enqueue(&window("c2")).await.unwrap();
    db.enqueue(&window("c3")).await.unwrap();
    let summary = dispatcher.run_cycle().await.unwrap();
    assert_eq!(summary.capacity, 0);
    assert_eq!(summary.started, 0);

    db.set_capacity(1).await.unwrap();
    assert_eq!(dispatcher.run_cycle().await.unwrap().started, 1);

    db.set_capacity(2).await.unwrap();
    assert_eq!(dispatcher.run_cycle().await.unwrap().started, 1);

    // Lowering it does not preempt running jobs.
    db.set_capacity(0).await.unwrap();
    let summary = dispatcher.run_cycle().await.unwrap();
    assert_eq!(summary.started, 0);
    assert_eq!(summary.running, 2);

    gate.add_permits(100);
    dispatcher.drain().await;
}

#[tokio::test]
async fn test_claim_installs_channel_window() {
    let (db, _temp) = setup_db().await;
    let gate = Arc::new(Semaphore::new(0));
    let mut dispatcher = dispatcher(&db, &gate);

    db.set_capacity(1).await.unwrap();
    let requested = window("gamma");
    db.enqueue(&requested).await.unwrap();

    // Enqueueing alone does not touch the live state.
    assert!(get_channel_state(db.pool(), "gamma").await.unwrap().is_none());

    dispatcher.run_cycle().await.unwrap();
    let state = get_channel_state(db.pool(), "gamma")
        .await
        .unwrap()
        .expect("channel state missing");
    assert_eq!(state.window(), requested);
    assert!(state.progress_at.is_none());

    gate.add_permits(100);
    dispatcher.drain().await;
}

#[tokio::test]
async fn test_shutdown_requeues_in_flight_jobs() {
    let (db, _temp) = setup_db().await;
    let gate = Arc::new(Semaphore::new(0));
    let mut dispatcher = dispatcher(&db, &gate);

    db.set_capacity(2).await.unwrap();
    db.enqueue(&window("d1")).await.unwrap();
    db.enqueue(&window("d2")).await.unwrap();

    assert_eq!(dispatcher.run_cycle().await.unwrap().started, 2);
    assert_eq!(db.pending_count().await.unwrap(), 0);

    dispatcher.shutdown().await;

    assert_eq!(dispatcher.state().running_count(), 0);
    assert_eq!(db.pending_count().await.unwrap(), 2);

    let runs = get_recent_runs(db.pool(), None, 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    for run in &runs {
        assert_eq!(run.state, "failed");
        assert_eq!(run.error_message.as_deref(), Some("interrupted by shutdown"));
    }
}

#[tokio::test]
async fn test_shutdown_records_job_that_already_finished() {
    let (db, _temp) = setup_db().await;
    let gate = Arc::new(Semaphore::new(100));
    let mut dispatcher = dispatcher(&db, &gate);

    db.set_capacity(1).await.unwrap();
    db.enqueue(&window("f1")).await.unwrap();

    assert_eq!(dispatcher.run_cycle().await.unwrap().started, 1);
    // Completed but not reaped when shutdown comes.
    wait_for_jobs(&dispatcher).await;
    assert_eq!(dispatcher.state().running_count(), 1);

    dispatcher.shutdown().await;

    assert_eq!(db.pending_count().await.unwrap(), 0);
    assert_eq!(db.running_count().await.unwrap(), 0);
    let runs = get_recent_runs(db.pool(), Some("f1"), 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, "succeeded");
    assert_eq!(runs[0].stop_reason.as_deref(), Some("no_more_history"));
    assert!(runs[0].error_message.is_none());
}

#[tokio::test]
async fn test_shutdown_does_not_requeue_cancelled_window() {
    let (db, _temp) = setup_db().await;
    let gate = Arc::new(Semaphore::new(0));
    let mut dispatcher = dispatcher(&db, &gate);

    db.set_capacity(1).await.unwrap();
    db.enqueue(&window("g1")).await.unwrap();
    assert_eq!(dispatcher.run_cycle().await.unwrap().started, 1);

    // Cancelled while its first fetch is still blocked.
    delete_channel_state(db.pool(), "g1").await.unwrap();
    dispatcher.shutdown().await;

    assert_eq!(db.pending_count().await.unwrap(), 0);
    assert_eq!(db.running_count().await.unwrap(), 0);
    let runs = get_recent_runs(db.pool(), Some("g1"), 10).await.unwrap();
    assert_eq!(runs[0].state, "failed");
    assert_eq!(runs[0].error_message.as_deref(), Some("interrupted by shutdown"));
}

#[tokio::test]
async fn test_dispatchers_sharing_a_store_never_run_one_channel_twice() {
    let (db, temp) = setup_db().await;
    let peer_db = open_peer(&temp).await;
    let gate = Arc::new(Semaphore::new(0));
    let mut first = dispatcher(&db, &gate);
    let mut second = dispatcher(&peer_db, &gate);

    db.set_capacity(5).await.unwrap();
    db.enqueue(&window("alpha")).await.unwrap();
    db.enqueue(&window("alpha")).await.unwrap();

    assert_eq!(first.run_cycle().await.unwrap().started, 1);
    // The second alpha request waits for the lease held by the first process.
    assert_eq!(second.run_cycle().await.unwrap().started, 0);
    assert_eq!(peer_db.pending_count().await.unwrap(), 1);

    let leases = get_running_channels(db.pool()).await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].channel_id, "alpha");

    gate.add_permits(100);
    first.drain().await;

    assert_eq!(second.run_cycle().await.unwrap().started, 1);
    second.drain().await;
    assert_eq!(db.running_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_dispatchers_sharing_a_store_share_capacity() {
    let (db, temp) = setup_db().await;
    let peer_db = open_peer(&temp).await;
    let gate = Arc::new(Semaphore::new(0));
    let mut first = dispatcher(&db, &gate);
    let mut second = dispatcher(&peer_db, &gate);

    db.set_capacity(2).await.unwrap();
    for channel in ["h1", "h2", "h3", "h4"] {
        db.enqueue(&window(channel)).await.unwrap();
    }

    assert_eq!(first.run_cycle().await.unwrap().started, 2);
    let summary = second.run_cycle().await.unwrap();
    assert_eq!(summary.started, 0);
    assert_eq!(summary.capacity, 2);
    assert_eq!(db.running_count().await.unwrap(), 2);
    assert_eq!(db.pending_count().await.unwrap(), 2);

    gate.add_permits(100);
    first.drain().await;

    // Slots freed by the first process are usable by the second.
    assert_eq!(second.run_cycle().await.unwrap().started, 2);
    second.drain().await;
    assert_eq!(db.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_abandoned_lease_is_requeued_and_claimed_by_peer() {
    let (db, temp) = setup_db().await;
    let peer_db = open_peer(&temp).await;
    let gate = Arc::new(Semaphore::new(0));
    let mut crashed = dispatcher(&db, &gate);
    let mut survivor = dispatcher(&peer_db, &gate).with_lease(Duration::ZERO);

    db.set_capacity(1).await.unwrap();
    db.enqueue(&window("i1")).await.unwrap();
    assert_eq!(crashed.run_cycle().await.unwrap().started, 1);

    // The first process stops heartbeating.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let summary = survivor.run_cycle().await.unwrap();
    assert_eq!(summary.expired, 1);
    assert_eq!(summary.started, 1);
    assert!(survivor.state().is_channel_running("i1"));

    gate.add_permits(100);
    survivor.drain().await;
    crashed.drain().await;

    let runs = get_recent_runs(db.pool(), Some("i1"), 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(db.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_run_loop_works_through_queue_until_cancelled() {
    let (db, _temp) = setup_db().await;
    let gate = Arc::new(Semaphore::new(100));
    let dispatcher = dispatcher(&db, &gate);

    db.set_capacity(2).await.unwrap();
    for channel in ["e1", "e2", "e3", "e4"] {
        db.enqueue(&window(channel)).await.unwrap();
    }

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(dispatcher.run(shutdown.clone()));

    let mut finished = 0;
    for _ in 0..200 {
        let runs = get_recent_runs(db.pool(), None, 10).await.unwrap();
        finished = runs.iter().filter(|r| r.finished_at.is_some()).count();
        if finished == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    shutdown.cancel();
    handle.await.expect("dispatcher panicked");

    assert_eq!(finished, 4);
    assert_eq!(db.pending_count().await.unwrap(), 0);
}
