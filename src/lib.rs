//! Channel crawler library.
//!
//! Crawls the public web preview of Telegram-style channels backwards in
//! time, keeping posts inside a requested window. Crawl requests sit in a
//! durable queue shared by any number of dispatcher processes, each of which
//! keeps up to a shared capacity of crawl jobs running.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod api;
pub mod channel_state;
pub mod config;
pub mod crawler;
pub mod db;
pub mod dispatcher;
pub mod queue;
pub mod service;
pub mod sink;
