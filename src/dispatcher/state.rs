use std::collections::HashMap;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::crawler::{CrawlWindow, JobReport};

/// Identifier of a dispatched job; the id of its run history row.
pub type JobId = i64;

/// A tracked job taken out of the dispatch state.
#[derive(Debug)]
pub struct TrackedJob {
    pub id: JobId,
    pub window: CrawlWindow,
    pub handle: JoinHandle<Result<JobReport>>,
}

/// In-flight jobs of one dispatcher.
///
/// Owned by the dispatcher and only touched from its cycle; jobs never write
/// to it themselves.
#[derive(Debug, Default)]
pub struct DispatchState {
    handles: HashMap<JobId, JoinHandle<Result<JobReport>>>,
    windows: HashMap<JobId, CrawlWindow>,
}

impl DispatchState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs started and not yet reaped.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.handles.len()
    }

    /// Number of tracked jobs whose task has completed but was not reaped yet.
    #[must_use]
    pub fn finished_count(&self) -> usize {
        self.handles.values().filter(|h| h.is_finished()).count()
    }

    /// Channels with a job in flight, sorted.
    #[must_use]
    pub fn running_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .windows
            .values()
            .map(|w| w.channel_id.clone())
            .collect();
        channels.sort();
        channels
    }

    #[must_use]
    pub fn is_channel_running(&self, channel_id: &str) -> bool {
        self.windows.values().any(|w| w.channel_id == channel_id)
    }

    pub fn track(&mut self, id: JobId, window: CrawlWindow, handle: JoinHandle<Result<JobReport>>) {
        self.handles.insert(id, handle);
        self.windows.insert(id, window);
    }

    /// Remove and return every job whose task has completed.
    pub fn take_finished(&mut self) -> Vec<TrackedJob> {
        let finished: Vec<JobId> = self
            .handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        finished.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove and return every tracked job.
    pub fn take_all(&mut self) -> Vec<TrackedJob> {
        let ids: Vec<JobId> = self.handles.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    fn remove(&mut self, id: JobId) -> Option<TrackedJob> {
        let handle = self.handles.remove(&id)?;
        let window = self.windows.remove(&id)?;
        Some(TrackedJob { id, window, handle })
    }
}
