//! Runtime configuration.
//!
//! Every setting has a default and can be overridden with a `TIDEMARK_*`
//! environment variable. Blank values are treated as unset.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::observability::LogFormat;

/// Database whose tables hold raw event-time data.
pub const DEFAULT_EVENT_DATABASE: &str = "logs";

/// Engine and protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The primary event-time database. Its tables are synced without the
    /// after-creation filter and recovered without window clamping.
    pub event_database: String,
    /// Safety margin reserved before an invocation's deadline.
    pub deadline_margin: Duration,
    /// Maximum continuations in one job.
    pub max_continuations: u32,
    /// Maximum continuations whose cursor did not advance.
    pub max_no_progress: u32,
    /// Worker count used when a request does not specify one.
    pub default_num_workers: usize,
    /// Page size for catalog listings.
    pub partition_page_size: usize,
    /// Max keys per object-store listing when probing for data.
    pub probe_page_size: usize,
    /// Queue that receives continuation messages.
    pub queue_name: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_database: DEFAULT_EVENT_DATABASE.to_string(),
            deadline_margin: Duration::from_secs(60),
            max_continuations: 100,
            max_no_progress: 5,
            default_num_workers: 4,
            partition_page_size: 500,
            probe_page_size: 10,
            queue_name: "tidemark-tasks".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if a variable is set to an unparsable or
    /// invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if a variable is set to an unparsable or
    /// invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(name).and_then(|v| {
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
        };

        let mut config = Self::default();
        if let Some(v) = var("TIDEMARK_EVENT_DATABASE") {
            config.event_database = v;
        }
        if let Some(secs) = parse_var::<u64>("TIDEMARK_DEADLINE_MARGIN_SECS", var("TIDEMARK_DEADLINE_MARGIN_SECS"))? {
            config.deadline_margin = Duration::from_secs(secs);
        }
        if let Some(v) = parse_var("TIDEMARK_MAX_CONTINUATIONS", var("TIDEMARK_MAX_CONTINUATIONS"))? {
            config.max_continuations = v;
        }
        if let Some(v) = parse_var("TIDEMARK_MAX_NO_PROGRESS", var("TIDEMARK_MAX_NO_PROGRESS"))? {
            config.max_no_progress = v;
        }
        if let Some(v) = parse_var("TIDEMARK_NUM_WORKERS", var("TIDEMARK_NUM_WORKERS"))? {
            config.default_num_workers = v;
        }
        if let Some(v) = parse_var("TIDEMARK_PARTITION_PAGE_SIZE", var("TIDEMARK_PARTITION_PAGE_SIZE"))? {
            config.partition_page_size = v;
        }
        if let Some(v) = parse_var("TIDEMARK_PROBE_PAGE_SIZE", var("TIDEMARK_PROBE_PAGE_SIZE"))? {
            config.probe_page_size = v;
        }
        if let Some(v) = var("TIDEMARK_QUEUE_NAME") {
            config.queue_name = v;
        }
        if let Some(v) = var("TIDEMARK_LOG_FORMAT") {
            config.log_format = v.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for zero worker counts, page sizes, or
    /// limits, or an empty database or queue name.
    pub fn validate(&self) -> Result<()> {
        if self.event_database.is_empty() {
            return Err(Error::InvalidInput("event_database must not be empty".into()));
        }
        if self.queue_name.is_empty() {
            return Err(Error::InvalidInput("queue_name must not be empty".into()));
        }
        if self.max_continuations == 0 {
            return Err(Error::InvalidInput("max_continuations must be positive".into()));
        }
        if self.max_no_progress == 0 {
            return Err(Error::InvalidInput("max_no_progress must be positive".into()));
        }
        if self.default_num_workers == 0 {
            return Err(Error::InvalidInput("default_num_workers must be positive".into()));
        }
        if self.partition_page_size == 0 || self.probe_page_size == 0 {
            return Err(Error::InvalidInput("page sizes must be positive".into()));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(v) = value else {
        return Ok(None);
    };
    v.parse::<T>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a number: {e}")))
}
