use async_trait::async_trait;
use thiserror::Error;

use super::{CrawlWindow, ParsedPage};

/// Failure to retrieve one feed page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed page {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("request to feed failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A content source whose channel history can be walked backward page by page.
///
/// Dispatching and pagination only talk to this trait, so adding another
/// platform means adding another implementation.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Unique identifier for this source.
    fn source_id(&self) -> &'static str;

    /// Fetch the raw markup of one page.
    ///
    /// `anchor` of `None` requests the most recent page; `Some(id)` requests
    /// the page ending at post `id`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures and non-success statuses.
    async fn fetch_page(&self, channel_id: &str, anchor: Option<i64>)
        -> Result<String, FetchError>;

    /// Parse one page into the posts that fall inside `window`.
    fn parse_page(&self, markup: &str, window: &CrawlWindow) -> ParsedPage;
}
