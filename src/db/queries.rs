use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{
    ChannelState, CrawlRun, PendingRequest, RunFinish, RunningChannel, StoredPost,
};
use crate::crawler::{CrawlWindow, JobState, Post};

// ========== Crawl Requests ==========

/// Add a pending crawl request.
pub async fn enqueue_request(pool: &SqlitePool, window: &CrawlWindow) -> Result<i64> {
    let result = sqlx::query(
        r"
        INSERT INTO crawl_requests (channel_id, window_from, window_to)
        VALUES (?, ?, ?)
        ",
    )
    .bind(&window.channel_id)
    .bind(window.window_from)
    .bind(window.window_to)
    .execute(pool)
    .await
    .context("Failed to enqueue crawl request")?;

    Ok(result.last_insert_rowid())
}

/// Remove and return the oldest eligible pending request, leasing its channel.
///
/// A request is eligible when its channel is neither in `exclude` nor leased
/// by any process, and fewer channels are leased than the capacity stored
/// under `capacity_key`. The claim and the lease share one transaction whose
/// first statement writes, so SQLite takes the write lock before the eligibility
/// subquery runs and concurrent claimers in other processes serialize on it.
pub async fn claim_request(
    pool: &SqlitePool,
    exclude: &[String],
    capacity_key: &str,
    now_ms: i64,
) -> Result<Option<CrawlWindow>> {
    let exclude_json = serde_json::to_string(exclude).context("Failed to encode exclusions")?;
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let claimed: Option<PendingRequest> = sqlx::query_as(
        r"
        DELETE FROM crawl_requests
        WHERE id = (
            SELECT id FROM crawl_requests
            WHERE channel_id NOT IN (SELECT value FROM json_each(?1))
              AND channel_id NOT IN (SELECT channel_id FROM running_channels)
              AND (SELECT COUNT(*) FROM running_channels)
                  < COALESCE((SELECT CAST(value AS INTEGER) FROM settings WHERE key = ?2), 0)
            ORDER BY id
            LIMIT 1
        )
        RETURNING id, channel_id, window_from, window_to, enqueued_at
        ",
    )
    .bind(exclude_json)
    .bind(capacity_key)
    .fetch_optional(&mut *tx)
    .await
    .context("Failed to claim crawl request")?;

    let Some(request) = claimed else {
        return Ok(None);
    };
    let window = request.window();

    sqlx::query(
        r"
        INSERT INTO running_channels (channel_id, window_from, window_to, heartbeat_ms)
        VALUES (?, ?, ?, ?)
        ",
    )
    .bind(&window.channel_id)
    .bind(window.window_from)
    .bind(window.window_to)
    .bind(now_ms)
    .execute(&mut *tx)
    .await
    .context("Failed to lease channel")?;

    tx.commit().await.context("Failed to commit claim")?;
    Ok(Some(window))
}

/// Delete every pending request for a channel.
pub async fn delete_requests_for_channel(pool: &SqlitePool, channel_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM crawl_requests WHERE channel_id = ?")
        .bind(channel_id)
        .execute(pool)
        .await
        .context("Failed to delete crawl requests")?;

    Ok(result.rows_affected())
}

/// Count pending requests across all channels.
pub async fn count_pending_requests(pool: &SqlitePool) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM crawl_requests")
        .fetch_one(pool)
        .await
        .context("Failed to count crawl requests")?;

    Ok(u64::try_from(count).unwrap_or(0))
}

/// List pending requests, oldest first.
pub async fn get_pending_requests(pool: &SqlitePool, limit: i64) -> Result<Vec<PendingRequest>> {
    sqlx::query_as(
        r"
        SELECT id, channel_id, window_from, window_to, enqueued_at
        FROM crawl_requests
        ORDER BY id
        LIMIT ?
        ",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to list crawl requests")
}

// ========== Running Channels ==========

/// Drop a channel's lease. Returns false if it held none.
pub async fn release_running_channel(pool: &SqlitePool, channel_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM running_channels WHERE channel_id = ?")
        .bind(channel_id)
        .execute(pool)
        .await
        .context("Failed to release channel")?;

    Ok(result.rows_affected() > 0)
}

/// Refresh the leases of `channels`.
pub async fn touch_running_channels(
    pool: &SqlitePool,
    channels: &[String],
    now_ms: i64,
) -> Result<u64> {
    if channels.is_empty() {
        return Ok(0);
    }
    let channels_json = serde_json::to_string(channels).context("Failed to encode channels")?;

    let result = sqlx::query(
        r"
        UPDATE running_channels
        SET heartbeat_ms = ?
        WHERE channel_id IN (SELECT value FROM json_each(?))
        ",
    )
    .bind(now_ms)
    .bind(channels_json)
    .execute(pool)
    .await
    .context("Failed to refresh channel leases")?;

    Ok(result.rows_affected())
}

/// Drop leases not refreshed since `stale_before_ms` and put their windows
/// back on the queue. Returns the requeued windows.
pub async fn expire_running_channels(
    pool: &SqlitePool,
    stale_before_ms: i64,
) -> Result<Vec<CrawlWindow>> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let expired: Vec<RunningChannel> = sqlx::query_as(
        r"
        DELETE FROM running_channels
        WHERE heartbeat_ms < ?
        RETURNING channel_id, window_from, window_to, heartbeat_ms, claimed_at
        ",
    )
    .bind(stale_before_ms)
    .fetch_all(&mut *tx)
    .await
    .context("Failed to expire channel leases")?;

    let mut windows = Vec::with_capacity(expired.len());
    for lease in expired {
        let window = lease.window();
        sqlx::query(
            r"
            INSERT INTO crawl_requests (channel_id, window_from, window_to)
            VALUES (?, ?, ?)
            ",
        )
        .bind(&window.channel_id)
        .bind(window.window_from)
        .bind(window.window_to)
        .execute(&mut *tx)
        .await
        .context("Failed to requeue expired lease")?;
        windows.push(window);
    }

    tx.commit().await.context("Failed to commit lease expiry")?;
    Ok(windows)
}

/// Count channels leased by any process.
pub async fn count_running_channels(pool: &SqlitePool) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM running_channels")
        .fetch_one(pool)
        .await
        .context("Failed to count running channels")?;

    Ok(u64::try_from(count).unwrap_or(0))
}

/// List leased channels, oldest claim first.
pub async fn get_running_channels(pool: &SqlitePool) -> Result<Vec<RunningChannel>> {
    sqlx::query_as(
        r"
        SELECT channel_id, window_from, window_to, heartbeat_ms, claimed_at
        FROM running_channels
        ORDER BY claimed_at, channel_id
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list running channels")
}

// ========== Settings ==========

/// Get a setting value.
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("Failed to read setting")?;

    Ok(row.map(|(value,)| value))
}

/// Insert or overwrite a setting value.
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO settings (key, value)
        VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = datetime('now')
        ",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("Failed to write setting")?;

    Ok(())
}

/// Insert a setting only if it does not exist yet. Returns true if inserted.
pub async fn insert_setting_if_absent(pool: &SqlitePool, key: &str, value: &str) -> Result<bool> {
    let result = sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await
        .context("Failed to initialize setting")?;

    Ok(result.rows_affected() > 0)
}

// ========== Channel State ==========

/// Install a channel's live window, resetting its progress.
pub async fn upsert_channel_state(pool: &SqlitePool, window: &CrawlWindow) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO channel_state (channel_id, window_from, window_to, progress_at)
        VALUES (?, ?, ?, NULL)
        ON CONFLICT(channel_id) DO UPDATE SET
            window_from = excluded.window_from,
            window_to = excluded.window_to,
            progress_at = NULL,
            updated_at = datetime('now')
        ",
    )
    .bind(&window.channel_id)
    .bind(window.window_from)
    .bind(window.window_to)
    .execute(pool)
    .await
    .context("Failed to write channel state")?;

    Ok(())
}

/// Get a channel's live state.
pub async fn get_channel_state(pool: &SqlitePool, channel_id: &str) -> Result<Option<ChannelState>> {
    sqlx::query_as(
        r"
        SELECT channel_id, window_from, window_to, progress_at, updated_at
        FROM channel_state
        WHERE channel_id = ?
        ",
    )
    .bind(channel_id)
    .fetch_optional(pool)
    .await
    .context("Failed to read channel state")
}

/// Change the window of a channel that has live state. Returns false if none.
pub async fn update_channel_window(pool: &SqlitePool, window: &CrawlWindow) -> Result<bool> {
    let result = sqlx::query(
        r"
        UPDATE channel_state
        SET window_from = ?, window_to = ?, updated_at = datetime('now')
        WHERE channel_id = ?
        ",
    )
    .bind(window.window_from)
    .bind(window.window_to)
    .bind(&window.channel_id)
    .execute(pool)
    .await
    .context("Failed to update channel window")?;

    Ok(result.rows_affected() > 0)
}

/// Clear a channel's live state. Returns true if there was any.
pub async fn delete_channel_state(pool: &SqlitePool, channel_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM channel_state WHERE channel_id = ?")
        .bind(channel_id)
        .execute(pool)
        .await
        .context("Failed to delete channel state")?;

    Ok(result.rows_affected() > 0)
}

/// Record how far back a channel's crawl has reached.
pub async fn set_channel_progress(
    pool: &SqlitePool,
    channel_id: &str,
    reached: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r"
        UPDATE channel_state
        SET progress_at = ?, updated_at = datetime('now')
        WHERE channel_id = ?
        ",
    )
    .bind(reached)
    .bind(channel_id)
    .execute(pool)
    .await
    .context("Failed to record channel progress")?;

    Ok(())
}

// ========== Posts ==========

/// Insert posts, skipping any `(channel_id, post_id)` already stored.
///
/// Returns the posts that were actually inserted, in input order.
pub async fn insert_posts_ignoring_duplicates(
    pool: &SqlitePool,
    channel_id: &str,
    posts: &[Post],
) -> Result<Vec<Post>> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    let mut inserted = Vec::new();

    for post in posts {
        let row: Option<(i64,)> = sqlx::query_as(
            r"
            INSERT INTO posts (channel_id, post_id, content, published_at, permalink)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(channel_id, post_id) DO NOTHING
            RETURNING id
            ",
        )
        .bind(channel_id)
        .bind(post.post_id)
        .bind(&post.content)
        .bind(post.published_at)
        .bind(&post.permalink)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to insert post")?;

        if row.is_some() {
            inserted.push(post.clone());
        }
    }

    tx.commit().await.context("Failed to commit posts")?;
    Ok(inserted)
}

/// Get the most recent stored posts of a channel.
pub async fn get_posts_for_channel(
    pool: &SqlitePool,
    channel_id: &str,
    limit: i64,
) -> Result<Vec<StoredPost>> {
    sqlx::query_as(
        r"
        SELECT id, channel_id, post_id, content, published_at, permalink, created_at
        FROM posts
        WHERE channel_id = ?
        ORDER BY post_id DESC
        LIMIT ?
        ",
    )
    .bind(channel_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to list posts")
}

/// Count stored posts of a channel.
pub async fn count_posts_for_channel(pool: &SqlitePool, channel_id: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE channel_id = ?")
        .bind(channel_id)
        .fetch_one(pool)
        .await
        .context("Failed to count posts")?;

    Ok(count)
}

// ========== Crawl Runs ==========

/// Record a newly claimed job. The run starts out pending.
pub async fn insert_run(pool: &SqlitePool, window: &CrawlWindow) -> Result<i64> {
    let result = sqlx::query(
        r"
        INSERT INTO crawl_runs (channel_id, window_from, window_to, state)
        VALUES (?, ?, ?, ?)
        ",
    )
    .bind(&window.channel_id)
    .bind(window.window_from)
    .bind(window.window_to)
    .bind(JobState::Pending.as_str())
    .execute(pool)
    .await
    .context("Failed to insert crawl run")?;

    Ok(result.last_insert_rowid())
}

/// Mark a run as running.
pub async fn set_run_running(pool: &SqlitePool, run_id: i64) -> Result<()> {
    sqlx::query(
        r"
        UPDATE crawl_runs
        SET state = ?, started_at = datetime('now')
        WHERE id = ?
        ",
    )
    .bind(JobState::Running.as_str())
    .bind(run_id)
    .execute(pool)
    .await
    .context("Failed to mark crawl run running")?;

    Ok(())
}

/// Write the terminal state of a run.
pub async fn finish_run(pool: &SqlitePool, run_id: i64, finish: &RunFinish) -> Result<()> {
    sqlx::query(
        r"
        UPDATE crawl_runs
        SET state = ?,
            stop_reason = ?,
            pages_fetched = ?,
            posts_found = ?,
            posts_inserted = ?,
            error_message = ?,
            finished_at = datetime('now')
        WHERE id = ?
        ",
    )
    .bind(finish.state.as_str())
    .bind(finish.stop_reason.map(|r| r.as_str()))
    .bind(i64::from(finish.pages_fetched))
    .bind(i64::try_from(finish.posts_found).unwrap_or(i64::MAX))
    .bind(i64::try_from(finish.posts_inserted).unwrap_or(i64::MAX))
    .bind(finish.error_message.as_deref())
    .bind(run_id)
    .execute(pool)
    .await
    .context("Failed to finish crawl run")?;

    Ok(())
}

/// Get a run by id.
pub async fn get_run(pool: &SqlitePool, run_id: i64) -> Result<Option<CrawlRun>> {
    sqlx::query_as("SELECT * FROM crawl_runs WHERE id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get crawl run")
}

/// Get the most recent runs, optionally for one channel.
pub async fn get_recent_runs(
    pool: &SqlitePool,
    channel_id: Option<&str>,
    limit: i64,
) -> Result<Vec<CrawlRun>> {
    sqlx::query_as(
        r"
        SELECT * FROM crawl_runs
        WHERE ?1 IS NULL OR channel_id = ?1
        ORDER BY id DESC
        LIMIT ?2
        ",
    )
    .bind(channel_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to list crawl runs")
}
