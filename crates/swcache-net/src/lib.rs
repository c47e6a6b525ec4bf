//! # swcache net
//!
//! What the caching engine knows about HTTP: a [`Request`] it intercepts, a
//! [`Response`] snapshot it stores or returns, and the [`Fetcher`] it goes to
//! the network through.
//!
//! Responses hold their body as [`bytes::Bytes`], so a snapshot can be handed
//! to the page and written to a cache namespace without copying.
//! [`HttpFetcher`] talks to real origins, [`MockFetcher`] scripts the network
//! in-process for tests and headless runs.

use thiserror::Error;

pub mod fetch;
pub mod mock;
pub mod pattern;
pub mod request;
pub mod response;

pub use fetch::{Fetcher, HttpFetcher, LoaderConfig};
pub use mock::MockFetcher;
pub use pattern::PathPattern;
pub use request::{Request, RequestMode};
pub use response::{Response, ResponseSource};

/// Why a fetch produced no response at all.
///
/// A non-2xx status is not an error here; it is a [`Response`].
#[derive(Error, Debug)]
pub enum NetError {
    #[error("fetch failed: {0}")]
    RequestFailed(String),

    #[error("bad url {0}")]
    InvalidUrl(String),

    /// The origin could not be reached (no route, refused, timed out).
    #[error("offline: {0}")]
    Offline(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl NetError {
    /// Whether the failure looks like a lost connection rather than a bad
    /// request.
    pub fn is_offline(&self) -> bool {
        match self {
            NetError::Offline(_) => true,
            NetError::Transport(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_classification() {
        assert!(NetError::Offline("/".into()).is_offline());
        assert!(!NetError::RequestFailed("status 500".into()).is_offline());
        assert!(!NetError::InvalidUrl("::".into()).is_offline());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            NetError::RequestFailed("status 404".into()).to_string(),
            "fetch failed: status 404"
        );
        assert_eq!(NetError::Offline("/_next/app.js".into()).to_string(), "offline: /_next/app.js");
    }
}
