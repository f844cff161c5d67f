use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crawler::{CrawlWindow, JobState, Post, StopReason};

/// A crawl request waiting in the queue.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingRequest {
    pub id: i64,
    pub channel_id: String,
    pub window_from: DateTime<Utc>,
    pub window_to: DateTime<Utc>,
    pub enqueued_at: String,
}

impl PendingRequest {
    #[must_use]
    pub fn window(&self) -> CrawlWindow {
        CrawlWindow::new(self.channel_id.clone(), self.window_from, self.window_to)
    }
}

/// Live window of a channel plus how far back its crawl has reached.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChannelState {
    pub channel_id: String,
    pub window_from: DateTime<Utc>,
    pub window_to: DateTime<Utc>,
    pub progress_at: Option<DateTime<Utc>>,
    pub updated_at: String,
}

impl ChannelState {
    #[must_use]
    pub fn window(&self) -> CrawlWindow {
        CrawlWindow::new(self.channel_id.clone(), self.window_from, self.window_to)
    }
}

/// Lease on a channel held by whichever process is crawling it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunningChannel {
    pub channel_id: String,
    pub window_from: DateTime<Utc>,
    pub window_to: DateTime<Utc>,
    /// Last refresh by the owning dispatcher, in Unix milliseconds.
    pub heartbeat_ms: i64,
    pub claimed_at: String,
}

impl RunningChannel {
    #[must_use]
    pub fn window(&self) -> CrawlWindow {
        CrawlWindow::new(self.channel_id.clone(), self.window_from, self.window_to)
    }
}

/// A post as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredPost {
    pub id: i64,
    pub channel_id: String,
    pub post_id: i64,
    pub content: String,
    pub published_at: DateTime<Utc>,
    pub permalink: String,
    pub created_at: String,
}

impl From<StoredPost> for Post {
    fn from(stored: StoredPost) -> Self {
        Self {
            channel_id: stored.channel_id,
            post_id: stored.post_id,
            content: stored.content,
            published_at: stored.published_at,
            permalink: stored.permalink,
        }
    }
}

/// History row for one dispatched crawl job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CrawlRun {
    pub id: i64,
    pub channel_id: String,
    pub window_from: DateTime<Utc>,
    pub window_to: DateTime<Utc>,
    pub state: String,
    pub stop_reason: Option<String>,
    pub pages_fetched: i64,
    pub posts_found: i64,
    pub posts_inserted: i64,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl CrawlRun {
    #[must_use]
    pub fn job_state(&self) -> Option<JobState> {
        JobState::parse(&self.state)
    }
}

/// Terminal details written when a run is reaped.
#[derive(Debug, Clone)]
pub struct RunFinish {
    pub state: JobState,
    pub stop_reason: Option<StopReason>,
    pub pages_fetched: u32,
    pub posts_found: usize,
    pub posts_inserted: usize,
    pub error_message: Option<String>,
}
