use anyhow::Result;
use async_trait::async_trait;

use crate::crawler::CrawlWindow;
use crate::db::{self, Database, RunFinish};

/// Durable history of dispatched jobs.
#[async_trait]
pub trait RunLog: Send + Sync {
    /// Record a claimed window, returning the new job id.
    async fn start_run(&self, window: &CrawlWindow) -> Result<i64>;

    async fn mark_running(&self, run_id: i64) -> Result<()>;

    async fn finish_run(&self, run_id: i64, finish: &RunFinish) -> Result<()>;
}

#[async_trait]
impl RunLog for Database {
    async fn start_run(&self, window: &CrawlWindow) -> Result<i64> {
        db::insert_run(self.pool(), window).await
    }

    async fn mark_running(&self, run_id: i64) -> Result<()> {
        db::set_run_running(self.pool(), run_id).await
    }

    async fn finish_run(&self, run_id: i64, finish: &RunFinish) -> Result<()> {
        db::finish_run(self.pool(), run_id, finish).await
    }
}
