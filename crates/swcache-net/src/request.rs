//! Intercepted requests.

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::NetError;

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    #[default]
    SameOrigin,
    Cors,
    NoCors,
}

/// A request as the engine sees it at the fetch hook.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
}

impl Request {
    fn build(url: Url, mode: RequestMode) -> Self {
        Request {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode,
        }
    }

    /// Subresource GET.
    pub fn get(url: Url) -> Self {
        Self::build(url, RequestMode::SameOrigin)
    }

    /// Document load of `url`.
    pub fn navigate(url: Url) -> Self {
        Self::build(url, RequestMode::Navigate)
    }

    pub fn parse(raw: &str) -> Result<Self, NetError> {
        match Url::parse(raw) {
            Ok(url) => Ok(Self::get(url)),
            Err(e) => Err(NetError::InvalidUrl(format!("{raw} ({e})"))),
        }
    }

    pub fn method(self, method: Method) -> Self {
        Request { method, ..self }
    }

    pub fn mode(self, mode: RequestMode) -> Self {
        Request { mode, ..self }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_navigation(&self) -> bool {
        matches!(self.mode, RequestMode::Navigate)
    }

    /// Scheme, host and port all match `origin`.
    pub fn is_same_origin(&self, origin: &Url) -> bool {
        self.url.origin() == origin.origin()
    }

    /// `"<METHOD> <url without fragment>"`.
    pub fn cache_key(&self) -> String {
        let url = self.url.as_str();
        let without_fragment = match url.find('#') {
            Some(at) => &url[..at],
            None => url,
        };
        format!("{} {without_fragment}", self.method)
    }
}
