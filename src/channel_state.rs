//! Live per-channel window and progress, shared between running jobs and the
//! request surface.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::crawler::CrawlWindow;
use crate::db::{self, Database};

#[async_trait]
pub trait CrawlStateStore: Send + Sync {
    /// Install `window` as the live window of its channel, clearing progress.
    async fn begin(&self, window: &CrawlWindow) -> Result<()>;

    /// The live window of a channel, or `None` once it was cancelled.
    async fn current_window(&self, channel_id: &str) -> Result<Option<CrawlWindow>>;

    /// Record the publication time of the oldest post reached so far.
    async fn record_progress(&self, channel_id: &str, reached: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
impl CrawlStateStore for Database {
    async fn begin(&self, window: &CrawlWindow) -> Result<()> {
        db::upsert_channel_state(self.pool(), window).await
    }

    async fn current_window(&self, channel_id: &str) -> Result<Option<CrawlWindow>> {
        Ok(db::get_channel_state(self.pool(), channel_id)
            .await?
            .map(|state| state.window()))
    }

    async fn record_progress(&self, channel_id: &str, reached: DateTime<Utc>) -> Result<()> {
        db::set_channel_progress(self.pool(), channel_id, reached).await
    }
}
