//! Operations exposed to the request surface: admitting, cancelling and
//! inspecting crawls, and adjusting the worker capacity.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::crawler::CrawlWindow;
use crate::db::{self, Database};
use crate::queue::TaskQueue;

const MAX_CHANNEL_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid channel id '{0}': expected 1-64 letters, digits or underscores")]
    InvalidChannel(String),
    #[error("window_from ({from}) is after window_to ({to})")]
    InvalidWindow {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Result of cancelling a channel's crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelSummary {
    /// Pending requests removed from the queue.
    pub pending_removed: u64,
    /// Whether a live window was cleared, which stops a running job.
    pub window_cleared: bool,
}

/// Check that a channel id is a plausible public channel username.
///
/// # Errors
///
/// Returns [`ServiceError::InvalidChannel`] if it is not.
pub fn validate_channel_id(channel_id: &str) -> Result<(), ServiceError> {
    let valid = !channel_id.is_empty()
        && channel_id.len() <= MAX_CHANNEL_ID_LEN
        && channel_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(ServiceError::InvalidChannel(channel_id.to_string()))
    }
}

fn validated_window(
    channel_id: &str,
    window_from: DateTime<Utc>,
    window_to: DateTime<Utc>,
) -> Result<CrawlWindow, ServiceError> {
    validate_channel_id(channel_id)?;
    let window = CrawlWindow::new(channel_id, window_from, window_to);
    if !window.is_valid() {
        return Err(ServiceError::InvalidWindow {
            from: window_from,
            to: window_to,
        });
    }
    Ok(window)
}

/// Admit a crawl request into the shared queue.
///
/// # Errors
///
/// Returns an error for an invalid channel or window, or if the queue fails.
pub async fn enqueue_crawl(
    db: &Database,
    channel_id: &str,
    window_from: DateTime<Utc>,
    window_to: DateTime<Utc>,
) -> Result<CrawlWindow, ServiceError> {
    let window = validated_window(channel_id, window_from, window_to)?;
    db.enqueue(&window).await?;
    info!(channel = %channel_id, from = %window_from, to = %window_to, "Crawl request enqueued");
    Ok(window)
}

/// Drop pending requests for a channel and clear its live window.
///
/// A running job finishes its current page and then stops.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn cancel_crawl(db: &Database, channel_id: &str) -> Result<CancelSummary, ServiceError> {
    let pending_removed = db.remove_channel(channel_id).await?;
    let window_cleared = db::delete_channel_state(db.pool(), channel_id).await?;
    info!(channel = %channel_id, pending_removed, window_cleared, "Crawl cancelled");
    Ok(CancelSummary {
        pending_removed,
        window_cleared,
    })
}

/// Change the live window of a channel; a running job uses it from its next
/// page on. Returns false if the channel has no live window.
///
/// # Errors
///
/// Returns an error for an invalid window or if the store fails.
pub async fn change_window(
    db: &Database,
    channel_id: &str,
    window_from: DateTime<Utc>,
    window_to: DateTime<Utc>,
) -> Result<bool, ServiceError> {
    let window = validated_window(channel_id, window_from, window_to)?;
    let changed = db::update_channel_window(db.pool(), &window).await?;
    if changed {
        info!(channel = %channel_id, from = %window_from, to = %window_to, "Crawl window changed");
    }
    Ok(changed)
}

/// Percentage of the window already walked, or -1 if unknown.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn get_progress(db: &Database, channel_id: &str) -> Result<i64, ServiceError> {
    let Some(state) = db::get_channel_state(db.pool(), channel_id).await? else {
        return Ok(-1);
    };
    Ok(state.progress_at.map_or(-1, |reached| {
        progress_percent(state.window_from, state.window_to, reached)
    }))
}

/// `100 * (to - reached) / (to - from)`, truncated toward zero.
///
/// A zero-length window counts as complete once anything was reached.
#[must_use]
pub fn progress_percent(
    window_from: DateTime<Utc>,
    window_to: DateTime<Utc>,
    reached: DateTime<Utc>,
) -> i64 {
    let span = i128::from((window_to - window_from).num_milliseconds());
    if span == 0 {
        return 100;
    }
    let walked = i128::from((window_to - reached).num_milliseconds());
    i64::try_from(walked * 100 / span).unwrap_or(-1)
}

/// Set the shared cap on concurrently running jobs.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn set_worker_capacity(db: &Database, capacity: u32) -> Result<(), ServiceError> {
    db.set_capacity(capacity).await?;
    info!(capacity, "Worker capacity changed");
    Ok(())
}

/// Current cap on concurrently running jobs.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn get_worker_capacity(db: &Database) -> Result<u32, ServiceError> {
    Ok(db.get_capacity().await?)
}
