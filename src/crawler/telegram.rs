//! Telegram public channel preview (`https://t.me/s/<channel>`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, warn};

use super::parser::{filter_window, ParsedPage};
use super::source::{FeedSource, FetchError};
use super::{CrawlWindow, Post};
use crate::config::Config;

/// Feed source backed by Telegram's server-rendered channel preview.
#[derive(Debug, Clone)]
pub struct TelegramSource {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramSource {
    /// Create a source using an existing HTTP client.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Build a source and its HTTP client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::new(client, &config.feed_base_url))
    }

    /// URL of the most recent page, or of the page ending at `anchor`.
    #[must_use]
    pub fn page_url(&self, channel_id: &str, anchor: Option<i64>) -> String {
        match anchor {
            Some(id) => format!("{}/s/{channel_id}/{id}", self.base_url),
            None => format!("{}/s/{channel_id}", self.base_url),
        }
    }

    /// Public link to a single post.
    #[must_use]
    pub fn permalink(&self, channel_name: &str, post_id: i64) -> String {
        format!("{}/{channel_name}/{post_id}", self.base_url)
    }

    /// Extract every well-formed message on the page, in markup order.
    fn extract_candidates(&self, markup: &str, channel_id: &str) -> Vec<Post> {
        let document = Html::parse_document(markup);
        let message_selector =
            Selector::parse("div.tgme_widget_message").expect("Invalid selector");

        let mut candidates = Vec::new();
        for element in document.select(&message_selector) {
            match self.extract_message(&element, channel_id) {
                Ok(post) => candidates.push(post),
                Err(e) => {
                    warn!(channel = %channel_id, "Skipping malformed message: {e:#}");
                }
            }
        }
        candidates
    }

    fn extract_message(&self, element: &ElementRef, channel_id: &str) -> Result<Post> {
        let time_selector = Selector::parse("time[datetime]").expect("Invalid selector");
        let text_selector =
            Selector::parse("div.tgme_widget_message_text").expect("Invalid selector");

        let data_post = element
            .value()
            .attr("data-post")
            .context("message has no data-post attribute")?;
        let (channel_name, post_id) = split_data_post(data_post)
            .with_context(|| format!("unrecognised data-post '{data_post}'"))?;

        let datetime = element
            .select(&time_selector)
            .next()
            .and_then(|t| t.value().attr("datetime"))
            .context("message has no timestamp")?;
        let published_at = DateTime::parse_from_rfc3339(datetime)
            .with_context(|| format!("invalid timestamp '{datetime}'"))?
            .with_timezone(&Utc);

        let content = element
            .select(&text_selector)
            .next()
            .map(message_text)
            .unwrap_or_default();

        Ok(Post {
            channel_id: channel_id.to_string(),
            post_id,
            content,
            published_at,
            permalink: self.permalink(channel_name, post_id),
        })
    }
}

/// Text of a message body as authored: text nodes concatenated without a
/// separator, `<br>` as a newline, outer whitespace trimmed.
fn message_text(body: ElementRef) -> String {
    let mut text = String::new();
    for node in body.descendants() {
        match node.value() {
            Node::Text(t) => text.push_str(t),
            Node::Element(e) if e.name() == "br" => text.push('\n'),
            _ => {}
        }
    }
    text.trim().to_string()
}

/// Split `"<channel>/<id>"` into its parts.
fn split_data_post(data_post: &str) -> Option<(&str, i64)> {
    let (channel, id) = data_post.rsplit_once('/')?;
    let channel = channel.rsplit('/').next().unwrap_or(channel);
    if channel.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((channel, id.parse().ok()?))
}

#[async_trait]
impl FeedSource for TelegramSource {
    fn source_id(&self) -> &'static str {
        "telegram"
    }

    async fn fetch_page(
        &self,
        channel_id: &str,
        anchor: Option<i64>,
    ) -> Result<String, FetchError> {
        let url = self.page_url(channel_id, anchor);
        debug!(url = %url, "Fetching feed page");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
            });
        }

        Ok(response.text().await?)
    }

    fn parse_page(&self, markup: &str, window: &CrawlWindow) -> ParsedPage {
        let candidates = self.extract_candidates(markup, &window.channel_id);
        filter_window(candidates, window)
    }
}
