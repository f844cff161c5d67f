use anyhow::Result;
use async_trait::async_trait;

use crate::crawler::Post;
use crate::db::{self, Database};

/// Idempotent post storage keyed by `(channel_id, post_id)`.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Store `posts`, returning only those that were not already present.
    async fn persist(&self, channel_id: &str, posts: &[Post]) -> Result<Vec<Post>>;
}

#[async_trait]
impl Sink for Database {
    async fn persist(&self, channel_id: &str, posts: &[Post]) -> Result<Vec<Post>> {
        db::insert_posts_ignoring_duplicates(self.pool(), channel_id, posts).await
    }
}
