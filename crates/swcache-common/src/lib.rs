//! # swcache common
//!
//! Pieces shared by the swcache crates and the binaries that embed them:
//!
//! - [`SwCacheError`], the error for configuration, setup and host I/O
//! - [`logging`]: subscriber setup (`LogConfig`, `init_logging`)
//! - [`retry`]: backoff used when precaching (`RetryConfig`, `retry_with_backoff`)
//!
//! Engine-level failures have their own error types next to the code that
//! raises them (`NetError`, `StoreError`, `ServiceWorkerError`).

use std::time::Duration;

use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, Backoff, RetryConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum SwCacheError {
    /// Invalid or unreadable configuration.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The global log subscriber could not be installed.
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl SwCacheError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether trying again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwCacheError::Io(_) | SwCacheError::Timeout(_))
    }

    /// Short label for the `category` log field.
    pub fn category(&self) -> &'static str {
        match self {
            SwCacheError::Config { .. } => "config",
            SwCacheError::Io(_) => "io",
            SwCacheError::Timeout(_) => "timeout",
            SwCacheError::Logging(_) => "logging",
        }
    }
}

pub type Result<T> = std::result::Result<T, SwCacheError>;
