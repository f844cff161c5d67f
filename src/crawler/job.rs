//! Backward pagination over one channel's history.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use super::{CrawlSettings, CrawlWindow, FeedSource, JobState, ParsedPage, Post, StopReason};
use crate::channel_state::CrawlStateStore;
use crate::sink::Sink;

/// Posts gathered by one pagination run and why it stopped.
#[derive(Debug, Clone)]
pub struct CrawlOutcome {
    pub stop: StopReason,
    /// Unique posts in the order they were reached, newest first.
    pub posts: Vec<Post>,
    pub pages_fetched: u32,
}

/// Final result of a job after its posts went through the sink.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub channel_id: String,
    pub stop: StopReason,
    pub pages_fetched: u32,
    pub posts_found: usize,
    /// Posts that were not stored before this job.
    pub inserted: Vec<Post>,
}

impl JobReport {
    #[must_use]
    pub fn state(&self) -> JobState {
        self.stop.job_state()
    }
}

/// Unique posts collected so far in a run.
#[derive(Debug, Default)]
struct Accumulator {
    posts: Vec<Post>,
    seen: HashSet<i64>,
}

impl Accumulator {
    /// Append posts not collected yet, returning how many were new.
    fn extend(&mut self, posts: Vec<Post>) -> usize {
        let before = self.posts.len();
        for post in posts {
            if self.seen.insert(post.post_id) {
                self.posts.push(post);
            }
        }
        self.posts.len() - before
    }
}

/// Crawl of a single channel window.
///
/// Pages are fetched one at a time, newest first. The anchor only moves when a
/// page actually returned posts, so a failed or empty page is retried at the
/// same position instead of silently skipping history.
pub struct CrawlJob {
    window: CrawlWindow,
    anchor_post_id: Option<i64>,
    source: Arc<dyn FeedSource>,
    state: Arc<dyn CrawlStateStore>,
    settings: CrawlSettings,
}

impl CrawlJob {
    #[must_use]
    pub fn new(
        window: CrawlWindow,
        source: Arc<dyn FeedSource>,
        state: Arc<dyn CrawlStateStore>,
        settings: CrawlSettings,
    ) -> Self {
        Self {
            window,
            anchor_post_id: None,
            source,
            state,
            settings,
        }
    }

    #[must_use]
    pub fn window(&self) -> &CrawlWindow {
        &self.window
    }

    /// Post id the next page will be requested at, once the first page is in.
    #[must_use]
    pub fn anchor(&self) -> Option<i64> {
        self.anchor_post_id
    }

    /// Paginate, then hand everything found to `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel state or the sink cannot be reached.
    /// Upstream fetch failures are reported through the stop reason instead.
    pub async fn run(mut self, sink: &dyn Sink) -> Result<JobReport> {
        let outcome = self.paginate().await?;
        let channel_id = self.window.channel_id.clone();

        let inserted = if outcome.stop == StopReason::FetchFailed || outcome.posts.is_empty() {
            Vec::new()
        } else {
            sink.persist(&channel_id, &outcome.posts).await?
        };

        info!(
            channel = %channel_id,
            stop = outcome.stop.as_str(),
            pages = outcome.pages_fetched,
            found = outcome.posts.len(),
            inserted = inserted.len(),
            "Crawl job finished"
        );

        Ok(JobReport {
            channel_id,
            stop: outcome.stop,
            pages_fetched: outcome.pages_fetched,
            posts_found: outcome.posts.len(),
            inserted,
        })
    }

    /// Walk the channel backward until a stop condition is met.
    ///
    /// # Errors
    ///
    /// Returns an error only if the channel state store fails.
    pub async fn paginate(&mut self) -> Result<CrawlOutcome> {
        let channel_id = self.window.channel_id.clone();
        let mut acc = Accumulator::default();
        let mut pages_fetched = 0;

        let markup = match self.source.fetch_page(&channel_id, None).await {
            Ok(markup) => markup,
            Err(e) => {
                warn!(channel = %channel_id, "Failed to fetch first page: {e}");
                return Ok(finish(StopReason::FetchFailed, acc, pages_fetched));
            }
        };
        pages_fetched += 1;

        let page = self.source.parse_page(&markup, &self.window);
        let Some(newest) = page.posts.iter().map(|p| p.post_id).max() else {
            debug!(channel = %channel_id, "No posts in window on the first page");
            return Ok(finish(StopReason::NoMoreHistory, acc, pages_fetched));
        };

        let mut anchor = newest - 1;
        self.anchor_post_id = Some(anchor);
        let boundary_passed = page.window_boundary_passed;
        self.accept_page(&mut acc, page).await;
        debug!(channel = %channel_id, anchor, total = acc.posts.len(), "First page collected");

        if boundary_passed {
            return Ok(finish(StopReason::WindowReached, acc, pages_fetched));
        }
        if anchor <= 1 {
            return Ok(finish(StopReason::NoMoreHistory, acc, pages_fetched));
        }

        let mut empty_streak = 0u32;
        loop {
            tokio::time::sleep(self.settings.page_delay).await;

            let fetched = self.source.fetch_page(&channel_id, Some(anchor)).await;
            pages_fetched += 1;

            // The window may have been changed or cleared while we were away.
            match self.state.current_window(&channel_id).await? {
                Some(window) => self.window = window,
                None => {
                    info!(channel = %channel_id, "Crawl window cleared, stopping");
                    return Ok(finish(StopReason::Cancelled, acc, pages_fetched));
                }
            }

            let page = match fetched {
                Ok(markup) => self.source.parse_page(&markup, &self.window),
                Err(e) => {
                    warn!(channel = %channel_id, anchor, "Failed to fetch page: {e}");
                    ParsedPage::default()
                }
            };
            let boundary_passed = page.window_boundary_passed;

            if let Some(oldest) = page.posts.iter().map(|p| p.post_id).min() {
                empty_streak = 0;
                anchor = oldest - 1;
                self.anchor_post_id = Some(anchor);
                let added = self.accept_page(&mut acc, page).await;
                debug!(
                    channel = %channel_id,
                    anchor,
                    added,
                    total = acc.posts.len(),
                    "Page collected"
                );
            } else if !boundary_passed {
                empty_streak += 1;
                warn!(channel = %channel_id, anchor, empty_streak, "Empty page");
                if empty_streak >= self.settings.max_empty_pages {
                    warn!(channel = %channel_id, "Too many consecutive empty pages, stopping");
                    return Ok(finish(StopReason::TooManyEmptyPages, acc, pages_fetched));
                }
            }

            if boundary_passed {
                return Ok(finish(StopReason::WindowReached, acc, pages_fetched));
            }
            if anchor <= 1 {
                debug!(channel = %channel_id, "Reached the beginning of the channel");
                return Ok(finish(StopReason::NoMoreHistory, acc, pages_fetched));
            }
        }
    }

    /// Add a page's posts and advance the recorded progress.
    async fn accept_page(&self, acc: &mut Accumulator, page: ParsedPage) -> usize {
        let oldest = page.posts.iter().map(|p| p.published_at).min();
        let added = acc.extend(page.posts);

        if let Some(reached) = oldest {
            if let Err(e) = self
                .state
                .record_progress(&self.window.channel_id, reached)
                .await
            {
                warn!(channel = %self.window.channel_id, "Failed to record progress: {e:#}");
            }
        }
        added
    }
}

fn finish(stop: StopReason, acc: Accumulator, pages_fetched: u32) -> CrawlOutcome {
    CrawlOutcome {
        stop,
        posts: acc.posts,
        pages_fetched,
    }
}
