//! Control loop that keeps up to `capacity` crawl jobs running.

mod runs;
mod state;

pub use runs::RunLog;
pub use state::{DispatchState, JobId, TrackedJob};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel_state::CrawlStateStore;
use crate::crawler::{CrawlJob, CrawlSettings, CrawlWindow, FeedSource, JobReport, JobState};
use crate::db::RunFinish;
use crate::queue::TaskQueue;
use crate::sink::Sink;

/// Everything the dispatcher needs from persistent storage.
pub trait CrawlStore: TaskQueue + Sink + CrawlStateStore + RunLog + 'static {}

impl<T> CrawlStore for T where T: TaskQueue + Sink + CrawlStateStore + RunLog + 'static {}

/// How long a channel lease survives without a heartbeat.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub reaped: usize,
    pub expired: usize,
    pub started: usize,
    /// Jobs in flight in this dispatcher.
    pub running: usize,
    pub capacity: u32,
}

/// Dispatcher for crawl jobs.
///
/// A cycle reaps finished jobs, refreshes the leases of its running channels,
/// requeues leases abandoned by dead processes, reads the capacity afresh and
/// claims work until the deficit is filled or the queue has nothing eligible.
/// Capacity and channel exclusivity are enforced through the shared leases,
/// so they hold across every dispatcher on the same store.
pub struct Dispatcher<S> {
    store: Arc<S>,
    source: Arc<dyn FeedSource>,
    settings: CrawlSettings,
    interval: Duration,
    lease: Duration,
    state: DispatchState,
    completions: Arc<Notify>,
}

impl<S: CrawlStore> Dispatcher<S> {
    /// Create a new dispatcher.
    pub fn new(
        store: Arc<S>,
        source: Arc<dyn FeedSource>,
        settings: CrawlSettings,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            source,
            settings,
            interval,
            lease: DEFAULT_LEASE,
            state: DispatchState::new(),
            completions: Arc::new(Notify::new()),
        }
    }

    /// Set how long a channel lease survives without a heartbeat.
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// In-flight jobs.
    #[must_use]
    pub fn state(&self) -> &DispatchState {
        &self.state
    }

    /// Run cycles on every tick and job completion until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            source = self.source.source_id(),
            interval_secs = self.interval.as_secs(),
            "Dispatcher started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let completions = Arc::clone(&self.completions);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                () = completions.notified() => {
                    debug!("Job completion observed");
                }
            }

            match self.run_cycle().await {
                Ok(summary) => {
                    if summary.started > 0 || summary.reaped > 0 || summary.expired > 0 {
                        info!(
                            reaped = summary.reaped,
                            expired = summary.expired,
                            started = summary.started,
                            running = summary.running,
                            capacity = summary.capacity,
                            "Dispatch cycle"
                        );
                    }
                }
                Err(e) => {
                    error!("Dispatch cycle failed: {e:#}");
                }
            }
        }

        self.shutdown().await;
        info!("Dispatcher stopped");
    }

    /// Run one dispatch cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read or a claimed job cannot be
    /// started. Jobs started before the error keep running.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary> {
        let reaped = self.reap().await;

        let running_channels = self.state.running_channels();
        self.store
            .heartbeat(&running_channels)
            .await
            .context("Failed to refresh channel leases")?;

        let expired = self
            .store
            .expire_stale(self.lease)
            .await
            .context("Failed to expire stale leases")?;
        for window in &expired {
            warn!(channel = %window.channel_id, "Requeued crawl abandoned by another dispatcher");
        }

        let capacity = self
            .store
            .get_capacity()
            .await
            .context("Failed to read capacity")?;
        let running_anywhere = self
            .store
            .running_count()
            .await
            .context("Failed to count running channels")?;
        let deficit = u64::from(capacity).saturating_sub(running_anywhere);

        let mut started = 0;
        for _ in 0..deficit {
            let exclude = self.state.running_channels();
            let Some(window) = self.store.claim_one(&exclude).await? else {
                debug!("No eligible crawl requests pending");
                break;
            };
            self.start_job(window).await?;
            started += 1;
        }

        Ok(CycleSummary {
            reaped,
            expired: expired.len(),
            started,
            running: self.state.running_count(),
            capacity,
        })
    }

    /// Wait for every in-flight job to finish and record the results.
    pub async fn drain(&mut self) -> usize {
        let jobs = self.state.take_all();
        let count = jobs.len();
        for job in jobs {
            self.finish(job).await;
        }
        count
    }

    /// Abort in-flight jobs and put their windows back on the queue so a
    /// restarted dispatcher picks them up again.
    ///
    /// Jobs that completed before the abort are recorded like any other
    /// finished job. Windows cancelled in the meantime are not requeued.
    pub async fn shutdown(&mut self) {
        for job in self.state.take_all() {
            job.handle.abort();
            match job.handle.await {
                Err(e) if e.is_cancelled() => self.interrupt(job.id, &job.window).await,
                outcome => self.record(job.id, &job.window, outcome).await,
            }
        }
    }

    async fn interrupt(&self, id: JobId, window: &CrawlWindow) {
        let channel_id = &window.channel_id;
        match self.store.current_window(channel_id).await {
            Ok(Some(live)) => {
                if let Err(e) = self.store.enqueue(&live).await {
                    error!(job_id = id, channel = %channel_id, "Failed to requeue interrupted job: {e:#}");
                } else {
                    info!(job_id = id, channel = %channel_id, "Requeued interrupted job");
                }
            }
            Ok(None) => {
                info!(job_id = id, channel = %channel_id, "Interrupted job was cancelled, not requeued");
            }
            Err(e) => {
                error!(job_id = id, channel = %channel_id, "Failed to read live window: {e:#}");
            }
        }

        let finish = failed_run("interrupted by shutdown".to_string());
        if let Err(e) = self.store.finish_run(id, &finish).await {
            error!(job_id = id, "Failed to record interrupted job: {e:#}");
        }
        self.release(channel_id).await;
    }

    async fn release(&self, channel_id: &str) {
        if let Err(e) = self.store.release(channel_id).await {
            error!(channel = %channel_id, "Failed to release channel lease: {e:#}");
        }
    }

    async fn reap(&mut self) -> usize {
        let finished = self.state.take_finished();
        let count = finished.len();
        for job in finished {
            self.finish(job).await;
        }
        count
    }

    async fn finish(&self, job: TrackedJob) {
        let outcome = job.handle.await;
        self.record(job.id, &job.window, outcome).await;
    }

    async fn record(
        &self,
        id: JobId,
        window: &CrawlWindow,
        outcome: Result<Result<JobReport>, JoinError>,
    ) {
        let finish = match outcome {
            Ok(Ok(report)) => RunFinish {
                state: report.state(),
                stop_reason: Some(report.stop),
                pages_fetched: report.pages_fetched,
                posts_found: report.posts_found,
                posts_inserted: report.inserted.len(),
                error_message: None,
            },
            Ok(Err(e)) => {
                warn!(job_id = id, channel = %window.channel_id, "Crawl job failed: {e:#}");
                failed_run(format!("{e:#}"))
            }
            Err(e) => {
                error!(job_id = id, channel = %window.channel_id, "Crawl job task panicked: {e}");
                failed_run(format!("job task panicked: {e}"))
            }
        };

        debug!(
            job_id = id,
            channel = %window.channel_id,
            state = finish.state.as_str(),
            "Reaped crawl job"
        );
        if let Err(e) = self.store.finish_run(id, &finish).await {
            error!(job_id = id, "Failed to record finished job: {e:#}");
        }
        self.release(&window.channel_id).await;
    }

    async fn start_job(&mut self, window: CrawlWindow) -> Result<JobId> {
        let prepared = async {
            let id = self.store.start_run(&window).await?;
            self.store.begin(&window).await?;
            Ok::<_, anyhow::Error>(id)
        }
        .await;

        let id = match prepared {
            Ok(id) => id,
            Err(e) => {
                // Don't lose the claimed request.
                if let Err(requeue) = self.store.enqueue(&window).await {
                    error!(channel = %window.channel_id, "Failed to requeue claimed request: {requeue:#}");
                }
                self.release(&window.channel_id).await;
                return Err(e.context("Failed to start crawl job"));
            }
        };

        let store = Arc::clone(&self.store);
        let state_store: Arc<dyn CrawlStateStore> = store.clone();
        let source = Arc::clone(&self.source);
        let settings = self.settings;
        let completions = Arc::clone(&self.completions);
        let job_window = window.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = store.mark_running(id).await {
                warn!(job_id = id, "Failed to mark job running: {e:#}");
            }
            let job = CrawlJob::new(job_window, source, state_store, settings);
            let result = job.run(store.as_ref()).await;
            completions.notify_one();
            result
        });

        info!(job_id = id, channel = %window.channel_id, "Started crawl job");
        self.state.track(id, window, handle);
        Ok(id)
    }
}

fn failed_run(error_message: String) -> RunFinish {
    RunFinish {
        state: JobState::Failed,
        stop_reason: None,
        pages_fetched: 0,
        posts_found: 0,
        posts_inserted: 0,
        error_message: Some(error_message),
    }
}
