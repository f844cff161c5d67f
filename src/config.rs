use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::crawler::CrawlSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Names of the settings rows the crawler shares with other processes.
///
/// Every process pointed at the same database must agree on these, so they are
/// derived from a single prefix rather than scattered string literals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    /// Maximum number of concurrently running crawl jobs, stored as a decimal
    /// integer. Re-read by the dispatcher on every cycle.
    pub capacity: String,
}

impl StoreKeys {
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            capacity: format!("{prefix}worker_capacity"),
        }
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::with_prefix("")
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_path: PathBuf,
    pub store_keys: StoreKeys,

    // Feed
    pub feed_base_url: String,
    pub http_timeout: Duration,
    pub user_agent: String,

    // Crawling
    pub dispatch_interval: Duration,
    pub lease_timeout: Duration,
    pub page_delay: Duration,
    pub max_empty_pages: u32,
    pub default_capacity: u32,

    // Web Server
    pub web_host: String,
    pub web_port: u16,

    // Roles
    pub run_dispatcher: bool,
    pub run_api: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable holds an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Database
            database_path: PathBuf::from(env_or_default(
                "DATABASE_PATH",
                "./data/crawler.sqlite",
            )),
            store_keys: StoreKeys::with_prefix(&env_or_default("STORE_KEY_PREFIX", "")),

            // Feed
            feed_base_url: env_or_default("FEED_BASE_URL", "https://t.me"),
            http_timeout: Duration::from_secs(parse_env_u64("HTTP_TIMEOUT_SECS", 30)?),
            user_agent: env_or_default("USER_AGENT", "channel-crawler/0.1"),

            // Crawling
            dispatch_interval: Duration::from_secs(parse_env_u64("DISPATCH_INTERVAL_SECS", 60)?),
            lease_timeout: Duration::from_secs(parse_env_u64("LEASE_TIMEOUT_SECS", 300)?),
            page_delay: Duration::from_millis(parse_env_u64("PAGE_DELAY_MS", 1000)?),
            max_empty_pages: parse_env_u32("MAX_EMPTY_PAGES", 3)?,
            default_capacity: parse_env_u32("WORKER_CAPACITY", 3)?,

            // Web Server
            web_host: env_or_default("WEB_HOST", "0.0.0.0"),
            web_port: parse_env_u16("WEB_PORT", 8080)?,

            // Roles
            run_dispatcher: parse_env_bool("RUN_DISPATCHER", true)?,
            run_api: parse_env_bool("RUN_API", true)?,
        })
    }

    /// Configuration suitable for tests: no page delay, local paths.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            database_path: PathBuf::from("./data/test.sqlite"),
            store_keys: StoreKeys::default(),
            feed_base_url: "http://127.0.0.1:9".to_string(),
            http_timeout: Duration::from_secs(5),
            user_agent: "channel-crawler-test".to_string(),
            dispatch_interval: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(30),
            page_delay: Duration::ZERO,
            max_empty_pages: 3,
            default_capacity: 3,
            web_host: "127.0.0.1".to_string(),
            web_port: 0,
            run_dispatcher: true,
            run_api: true,
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_empty_pages == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MAX_EMPTY_PAGES".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.dispatch_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "DISPATCH_INTERVAL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        // A live dispatcher refreshes its leases once per cycle.
        if self.lease_timeout < self.dispatch_interval * 2 {
            return Err(ConfigError::InvalidValue {
                name: "LEASE_TIMEOUT_SECS".to_string(),
                message: "must be at least twice DISPATCH_INTERVAL_SECS".to_string(),
            });
        }
        if !self.feed_base_url.starts_with("http://") && !self.feed_base_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue {
                name: "FEED_BASE_URL".to_string(),
                message: format!("must be an http(s) URL, got '{}'", self.feed_base_url),
            });
        }
        if !self.run_dispatcher && !self.run_api {
            return Err(ConfigError::InvalidValue {
                name: "RUN_DISPATCHER".to_string(),
                message: "at least one of RUN_DISPATCHER and RUN_API must be enabled".to_string(),
            });
        }
        Ok(())
    }

    /// Pagination settings handed to every crawl job.
    #[must_use]
    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            page_delay: self.page_delay,
            max_empty_pages: self.max_empty_pages,
        }
    }
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u16(name: &str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}
