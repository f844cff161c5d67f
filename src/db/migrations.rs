use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    if current_version < 3 {
        debug!("Running migration v3");
        run_migration_v3(pool).await?;
        set_schema_version(pool, 3).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("DELETE FROM _schema_version")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: creating initial schema");

    // Pending crawl requests; rows are deleted when claimed
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS crawl_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id TEXT NOT NULL,
            window_from TEXT NOT NULL,
            window_to TEXT NOT NULL,
            enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create crawl_requests table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_crawl_requests_channel ON crawl_requests(channel_id)")
        .execute(pool)
        .await?;

    // Shared key/value settings
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create settings table")?;

    // Live window and progress of each channel
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS channel_state (
            channel_id TEXT PRIMARY KEY,
            window_from TEXT NOT NULL,
            window_to TEXT NOT NULL,
            progress_at TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create channel_state table")?;

    // Collected posts
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id TEXT NOT NULL,
            post_id INTEGER NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            published_at TEXT NOT NULL,
            permalink TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(channel_id, post_id)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create posts table")?;

    Ok(())
}

async fn run_migration_v2(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v2: adding crawl run history");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS crawl_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id TEXT NOT NULL,
            window_from TEXT NOT NULL,
            window_to TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending',
            stop_reason TEXT,
            pages_fetched INTEGER NOT NULL DEFAULT 0,
            posts_found INTEGER NOT NULL DEFAULT 0,
            posts_inserted INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            started_at TEXT,
            finished_at TEXT
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create crawl_runs table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_crawl_runs_channel ON crawl_runs(channel_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn run_migration_v3(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v3: adding shared running-channel leases");

    // One row per channel with a job in flight in any process. The row holds
    // the claimed window so an expired lease can be put back on the queue.
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS running_channels (
            channel_id TEXT PRIMARY KEY,
            window_from TEXT NOT NULL,
            window_to TEXT NOT NULL,
            heartbeat_ms INTEGER NOT NULL,
            claimed_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create running_channels table")?;

    Ok(())
}
