//! Channel feed crawling: page sources, the window filter and the
//! backward-pagination job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod job;
pub mod parser;
pub mod source;
pub mod telegram;

pub use job::{CrawlJob, CrawlOutcome, JobReport};
pub use parser::{filter_window, ParsedPage};
pub use source::{FeedSource, FetchError};
pub use telegram::TelegramSource;

/// A `[window_from, window_to]` range of posts requested for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlWindow {
    pub channel_id: String,
    /// Oldest publication time that is still collected.
    pub window_from: DateTime<Utc>,
    /// Posts published at or after this instant are skipped.
    pub window_to: DateTime<Utc>,
}

impl CrawlWindow {
    #[must_use]
    pub fn new(
        channel_id: impl Into<String>,
        window_from: DateTime<Utc>,
        window_to: DateTime<Utc>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            window_from,
            window_to,
        }
    }

    /// Whether `window_from <= window_to`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.window_from <= self.window_to
    }
}

/// A single channel post extracted from a feed page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub channel_id: String,
    pub post_id: i64,
    pub content: String,
    pub published_at: DateTime<Utc>,
    pub permalink: String,
}

/// Lifecycle of a crawl job as recorded in the run history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Why a pagination run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The parser saw a post older than `window_from`.
    WindowReached,
    /// The first page had nothing in the window, or the anchor reached the
    /// start of the channel.
    NoMoreHistory,
    /// Too many consecutive failed or empty pages after the first one.
    TooManyEmptyPages,
    /// The first page could not be fetched.
    FetchFailed,
    /// The channel's window was cleared while the job was running.
    Cancelled,
}

impl StopReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WindowReached => "window_reached",
            Self::NoMoreHistory => "no_more_history",
            Self::TooManyEmptyPages => "too_many_empty_pages",
            Self::FetchFailed => "fetch_failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Final job state implied by this stop reason.
    #[must_use]
    pub fn job_state(&self) -> JobState {
        match self {
            Self::FetchFailed => JobState::Failed,
            _ => JobState::Succeeded,
        }
    }
}

/// Pagination tuning shared by all jobs.
#[derive(Debug, Clone, Copy)]
pub struct CrawlSettings {
    /// Courtesy delay between page fetches of one job.
    pub page_delay: Duration,
    /// Consecutive failed/empty pages tolerated before giving up.
    pub max_empty_pages: u32,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_secs(1),
            max_empty_pages: 3,
        }
    }
}
