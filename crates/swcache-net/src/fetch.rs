//! The network seam and its reqwest implementation.

use std::time::Duration;

use async_trait::async_trait;
use http::header::ACCEPT_LANGUAGE;
use http::HeaderValue;
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::{debug, info};

use crate::{NetError, Request, Response};

/// One request, one response. Implementations keep no cache of their own.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// Settings for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub user_agent: String,
    /// Sent unless the request carries its own `Accept-Language`.
    pub accept_language: String,
    /// Whole-request timeout.
    pub timeout: Duration,
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            user_agent: concat!("swcache/", env!("CARGO_PKG_VERSION")).to_owned(),
            accept_language: "en-US,en;q=0.9".to_owned(),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] over a shared reqwest [`Client`].
pub struct HttpFetcher {
    client: Client,
    accept_language: Option<HeaderValue>,
}

impl HttpFetcher {
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout)
            .redirect(Policy::limited(config.max_redirects))
            .build()?;
        let accept_language = HeaderValue::from_str(&config.accept_language).ok();

        info!(
            user_agent = %config.user_agent,
            timeout = ?config.timeout,
            "HTTP fetcher ready"
        );
        Ok(HttpFetcher {
            client,
            accept_language,
        })
    }

    fn classify(request: &Request, error: reqwest::Error) -> NetError {
        if error.is_connect() || error.is_timeout() {
            NetError::Offline(format!("{}: {error}", request.url))
        } else {
            NetError::Transport(error)
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let mut headers = request.headers.clone();
        if let Some(language) = &self.accept_language {
            headers.entry(ACCEPT_LANGUAGE).or_insert_with(|| language.clone());
        }

        let reply = self
            .client
            .request(request.method.clone(), request.url.as_str())
            .headers(headers)
            .send()
            .await
            .map_err(|e| Self::classify(request, e))?;

        let status = reply.status();
        let final_url = reply.url().clone();
        let reply_headers = reply.headers().clone();
        let body = reply.bytes().await.map_err(|e| Self::classify(request, e))?;

        debug!(url = %final_url, %status, bytes = body.len(), "Fetched from network");

        let mut response = Response::new(status, body).with_url(final_url);
        response.headers = reply_headers;
        Ok(response)
    }
}
