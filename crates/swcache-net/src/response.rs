//! Response snapshots.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Made up by the engine, never fetched.
    Synthetic,
}

/// Status, headers and body of a finished fetch.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL after redirects, when known.
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub source: ResponseSource,
    body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Response {
            url: None,
            status,
            headers: HeaderMap::new(),
            source: ResponseSource::Network,
            body: body.into(),
        }
    }

    /// `503` with a plain-text `Offline` body, used when neither the network
    /// nor a cache namespace has an answer.
    pub fn offline() -> Self {
        let mut response = Response::new(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"Offline"))
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response.source = ResponseSource::Synthetic;
        response
    }

    pub fn with_url(self, url: Url) -> Self {
        Response { url: Some(url), ..self }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Same snapshot, marked as read back from a cache namespace.
    pub fn into_cached(self) -> Self {
        Response {
            source: ResponseSource::Cache,
            ..self
        }
    }

    /// 2xx.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self.source, ResponseSource::Synthetic)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
