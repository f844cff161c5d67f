//! Window filtering shared by every feed source.

use super::{CrawlWindow, Post};

/// Posts from one page that fall inside the requested window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    /// Accepted posts, newest first.
    pub posts: Vec<Post>,
    /// Set once a post older than `window_from` was seen. Everything further
    /// back in the channel is older still.
    pub window_boundary_passed: bool,
}

/// Apply the window to a page's candidate posts.
///
/// Candidates are scanned newest first regardless of the order they appeared
/// in the markup. Posts at or after `window_to` are skipped; the first post
/// before `window_from` ends the scan.
#[must_use]
pub fn filter_window(mut candidates: Vec<Post>, window: &CrawlWindow) -> ParsedPage {
    candidates.sort_by(|a, b| b.post_id.cmp(&a.post_id));

    let mut page = ParsedPage::default();
    for post in candidates {
        if post.published_at >= window.window_to {
            continue;
        }
        if post.published_at < window.window_from {
            page.window_boundary_passed = true;
            break;
        }
        page.posts.push(post);
    }
    page
}
