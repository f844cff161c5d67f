//! Integration tests for backward pagination against a mocked channel preview.

use std::sync::Arc;
use std::time::Duration;

use channel_crawler::channel_state::CrawlStateStore;
use channel_crawler::crawler::{
    CrawlJob, CrawlSettings, CrawlWindow, JobState, StopReason, TelegramSource,
};
use channel_crawler::db::{count_posts_for_channel, delete_channel_state, get_posts_for_channel, Database};
use channel_crawler::service::get_progress;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

/// Post `n` of the test channel is published at `n` o'clock.
fn hour(n: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, n, 0, 0).unwrap()
}

fn message(post_id: u32) -> String {
    format!(
        r#"<div class="tgme_widget_message_wrap">
             <div class="tgme_widget_message js-widget_message" data-post="durov/{post_id}">
               <div class="tgme_widget_message_text js-message_text">Post number {post_id}</div>
               <a class="tgme_widget_message_date" href="https://t.me/durov/{post_id}"><time datetime="{}">{post_id}:00</time></a>
             </div>
           </div>"#,
        hour(post_id).to_rfc3339()
    )
}

/// A preview page holding posts `ids`, oldest first as the site renders them.
fn page(ids: std::ops::RangeInclusive<u32>) -> String {
    let messages: Vec<String> = ids.map(message).collect();
    format!(
        "<html><body><section class=\"tgme_channel_history\">{}</section></body></html>",
        messages.join("\n")
    )
}

fn empty_page() -> String {
    "<html><body><section class=\"tgme_channel_history\"></section></body></html>".to_string()
}

fn settings() -> CrawlSettings {
    CrawlSettings {
        page_delay: Duration::ZERO,
        max_empty_pages: 3,
    }
}

async fn mount_page(server: &MockServer, url_path: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(url_path))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

/// Build a job for `window`, installing its live state as the dispatcher would.
async fn job_for(server: &MockServer, db: &Arc<Database>, window: &CrawlWindow) -> CrawlJob {
    db.begin(window).await.expect("Failed to install channel state");
    let source = TelegramSource::new(reqwest::Client::new(), &server.uri());
    CrawlJob::new(window.clone(), Arc::new(source), db.clone(), settings())
}

#[tokio::test]
async fn test_stops_when_window_start_is_passed() {
    let server = MockServer::start().await;
    let (db, _temp) = setup_db().await;
    let db = Arc::new(db);

    mount_page(&server, "/s/durov", page(6..=10)).await;

    let window = CrawlWindow::new(
        "durov",
        hour(7),
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
    );
    let job = job_for(&server, &db, &window).await;
    let report = job.run(db.as_ref()).await.expect("Job failed");

    assert_eq!(report.stop, StopReason::WindowReached);
    assert_eq!(report.state(), JobState::Succeeded);
    assert_eq!(report.pages_fetched, 1);
    assert_eq!(report.posts_found, 3);

    let stored = get_posts_for_channel(db.pool(), "durov", 10).await.unwrap();
    let ids: Vec<i64> = stored.iter().map(|p| p.post_id).collect();
    assert_eq!(ids, vec![9, 8, 7]);
    assert_eq!(stored[0].content, "Post number 9");
    assert_eq!(stored[0].permalink, format!("{}/durov/9", server.uri()));

    // Walked all the way down to window_from.
    assert_eq!(get_progress(&db, "durov").await.unwrap(), 100);
}

#[tokio::test]
async fn test_pages_backward_until_empty_streak() {
    let server = MockServer::start().await;
    let (db, _temp) = setup_db().await;
    let db = Arc::new(db);

    mount_page(&server, "/s/durov", page(8..=10)).await;
    // Requested at the newest id minus one, so post 8 comes back again.
    mount_page(&server, "/s/durov/9", page(5..=8)).await;
    // The anchor does not move on an empty page, so the same page is retried.
    Mock::given(method("GET"))
        .and(path("/s/durov/4"))
        .respond_with(ResponseTemplate::new(200).set_body_string(empty_page()))
        .expect(3)
        .mount(&server)
        .await;

    let window = CrawlWindow::new("durov", hour(1), hour(23));
    let job = job_for(&server, &db, &window).await;
    let report = job.run(db.as_ref()).await.expect("Job failed");

    assert_eq!(report.stop, StopReason::TooManyEmptyPages);
    assert_eq!(report.state(), JobState::Succeeded);
    assert_eq!(report.pages_fetched, 5);
    assert_eq!(report.posts_found, 6);
    assert_eq!(report.inserted.len(), 6);
    assert_eq!(count_posts_for_channel(db.pool(), "durov").await.unwrap(), 6);
}

#[tokio::test]
async fn test_anchor_sequence_follows_newest_then_oldest_post() {
    let server = MockServer::start().await;
    let (db, _temp) = setup_db().await;
    let db = Arc::new(db);

    mount_page(&server, "/s/durov", page(8..=10)).await;
    mount_page(&server, "/s/durov/9", page(5..=8)).await;
    mount_page(&server, "/s/durov/4", page(2..=4)).await;

    let window = CrawlWindow::new("durov", hour(1), hour(23));
    let job = job_for(&server, &db, &window).await;
    let report = job.run(db.as_ref()).await.expect("Job failed");

    // Oldest post is 2, so the next anchor would be 1.
    assert_eq!(report.stop, StopReason::NoMoreHistory);
    assert_eq!(report.posts_found, 9);

    let requested: Vec<String> = server
        .received_requests()
        .await
        .expect("request recording disabled")
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(requested, vec!["/s/durov", "/s/durov/9", "/s/durov/4"]);
}

#[tokio::test]
async fn test_failed_pages_count_toward_streak() {
    let server = MockServer::start().await;
    let (db, _temp) = setup_db().await;
    let db = Arc::new(db);

    mount_page(&server, "/s/durov", page(8..=10)).await;
    Mock::given(method("GET"))
        .and(path("/s/durov/9"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    let window = CrawlWindow::new("durov", hour(1), hour(23));
    let job = job_for(&server, &db, &window).await;
    let report = job.run(db.as_ref()).await.expect("Job failed");

    // Partial results are kept.
    assert_eq!(report.stop, StopReason::TooManyEmptyPages);
    assert_eq!(report.state(), JobState::Succeeded);
    assert_eq!(report.pages_fetched, 4);
    assert_eq!(report.inserted.len(), 3);
}

#[tokio::test]
async fn test_first_page_failure_fails_job() {
    let server = MockServer::start().await;
    let (db, _temp) = setup_db().await;
    let db = Arc::new(db);

    Mock::given(method("GET"))
        .and(path("/s/durov"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let window = CrawlWindow::new("durov", hour(1), hour(23));
    let job = job_for(&server, &db, &window).await;
    let report = job.run(db.as_ref()).await.expect("Job failed");

    assert_eq!(report.stop, StopReason::FetchFailed);
    assert_eq!(report.state(), JobState::Failed);
    assert!(report.inserted.is_empty());
    assert_eq!(count_posts_for_channel(db.pool(), "durov").await.unwrap(), 0);
    assert_eq!(get_progress(&db, "durov").await.unwrap(), -1);
}

#[tokio::test]
async fn test_overlapping_runs_store_each_post_once() {
    let server = MockServer::start().await;
    let (db, _temp) = setup_db().await;
    let db = Arc::new(db);

    // Posts 1 and 2 are the whole channel.
    mount_page(&server, "/s/durov", page(1..=2)).await;

    let window = CrawlWindow::new("durov", hour(0), hour(23));

    let first = job_for(&server, &db, &window)
        .await
        .run(db.as_ref())
        .await
        .expect("First job failed");
    assert_eq!(first.stop, StopReason::NoMoreHistory);
    assert_eq!(first.inserted.len(), 2);

    let second = job_for(&server, &db, &window)
        .await
        .run(db.as_ref())
        .await
        .expect("Second job failed");
    assert_eq!(second.posts_found, 2);
    assert!(second.inserted.is_empty());

    assert_eq!(count_posts_for_channel(db.pool(), "durov").await.unwrap(), 2);
}

#[tokio::test]
async fn test_cleared_window_stops_job_after_current_fetch() {
    let server = MockServer::start().await;
    let (db, _temp) = setup_db().await;
    let db = Arc::new(db);

    mount_page(&server, "/s/durov", page(8..=10)).await;
    mount_page(&server, "/s/durov/9", page(5..=8)).await;

    let window = CrawlWindow::new("durov", hour(1), hour(23));
    let job = job_for(&server, &db, &window).await;
    // Cancelled before the second page is looked at.
    delete_channel_state(db.pool(), "durov").await.unwrap();

    let report = job.run(db.as_ref()).await.expect("Job failed");

    assert_eq!(report.stop, StopReason::Cancelled);
    assert_eq!(report.state(), JobState::Succeeded);
    assert_eq!(report.pages_fetched, 2);
    // Only the first page made it in.
    assert_eq!(report.posts_found, 3);
}

#[tokio::test]
async fn test_changed_window_applies_from_next_page() {
    let server = MockServer::start().await;
    let (db, _temp) = setup_db().await;
    let db = Arc::new(db);

    mount_page(&server, "/s/durov", page(8..=10)).await;
    mount_page(&server, "/s/durov/9", page(5..=8)).await;

    let window = CrawlWindow::new("durov", hour(1), hour(23));
    let job = job_for(&server, &db, &window).await;
    // Narrowed so that the second page crosses the new window start.
    channel_crawler::db::update_channel_window(
        db.pool(),
        &CrawlWindow::new("durov", hour(6), hour(23)),
    )
    .await
    .unwrap();

    let report = job.run(db.as_ref()).await.expect("Job failed");

    assert_eq!(report.stop, StopReason::WindowReached);
    assert_eq!(report.pages_fetched, 2);
    let mut ids: Vec<i64> = report.inserted.iter().map(|p| p.post_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![6, 7, 8, 9, 10]);
}
