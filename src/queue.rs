//! Durable queue of pending crawl requests shared by every dispatcher process.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::crawler::CrawlWindow;
use crate::db::{self, Database};

/// Pending crawl requests, the channels leased to running jobs, and the
/// shared concurrency cap.
///
/// Leases are shared by every process on the store: a leased channel is never
/// claimed again until its lease is released or expires, and the number of
/// leases never exceeds the capacity.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Add a pending request. Several requests for one channel may coexist.
    async fn enqueue(&self, window: &CrawlWindow) -> Result<()>;

    /// Atomically remove and return the oldest pending request whose channel
    /// is neither in `exclude` nor leased, leasing that channel. Returns `None`
    /// when nothing is eligible or every slot of the capacity is leased. Two
    /// concurrent callers never receive the same request.
    async fn claim_one(&self, exclude: &[String]) -> Result<Option<CrawlWindow>>;

    /// Drop every pending request for a channel, returning how many went.
    async fn remove_channel(&self, channel_id: &str) -> Result<u64>;

    /// Number of requests still waiting.
    async fn pending_count(&self) -> Result<u64>;

    /// Release the lease taken by `claim_one`.
    async fn release(&self, channel_id: &str) -> Result<()>;

    /// Refresh the leases of channels this caller is still crawling.
    async fn heartbeat(&self, channels: &[String]) -> Result<()>;

    /// Requeue the windows of leases not refreshed within `lease`.
    async fn expire_stale(&self, lease: Duration) -> Result<Vec<CrawlWindow>>;

    /// Number of channels leased by any process.
    async fn running_count(&self) -> Result<u64>;

    /// Current cap on concurrently running jobs.
    async fn get_capacity(&self) -> Result<u32>;

    async fn set_capacity(&self, capacity: u32) -> Result<()>;
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl TaskQueue for Database {
    async fn enqueue(&self, window: &CrawlWindow) -> Result<()> {
        db::enqueue_request(self.pool(), window).await?;
        Ok(())
    }

    async fn claim_one(&self, exclude: &[String]) -> Result<Option<CrawlWindow>> {
        db::claim_request(self.pool(), exclude, &self.keys().capacity, now_ms()).await
    }

    async fn remove_channel(&self, channel_id: &str) -> Result<u64> {
        db::delete_requests_for_channel(self.pool(), channel_id).await
    }

    async fn pending_count(&self) -> Result<u64> {
        db::count_pending_requests(self.pool()).await
    }

    async fn release(&self, channel_id: &str) -> Result<()> {
        db::release_running_channel(self.pool(), channel_id).await?;
        Ok(())
    }

    async fn heartbeat(&self, channels: &[String]) -> Result<()> {
        db::touch_running_channels(self.pool(), channels, now_ms()).await?;
        Ok(())
    }

    async fn expire_stale(&self, lease: Duration) -> Result<Vec<CrawlWindow>> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        db::expire_running_channels(self.pool(), now_ms().saturating_sub(lease_ms)).await
    }

    async fn running_count(&self) -> Result<u64> {
        db::count_running_channels(self.pool()).await
    }

    async fn get_capacity(&self) -> Result<u32> {
        let value = db::get_setting(self.pool(), &self.keys().capacity).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn set_capacity(&self, capacity: u32) -> Result<()> {
        db::set_setting(self.pool(), &self.keys().capacity, &capacity.to_string()).await
    }
}
