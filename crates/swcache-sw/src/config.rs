//! Engine configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use swcache_common::{RetryConfig, SwCacheError};

use crate::cache::CacheNames;

/// Configuration for one deployed version of the caching worker.
///
/// Bumping `cache_version` is what invalidates the versioned namespaces of
/// the previous deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix shared by every namespace this engine owns.
    pub cache_prefix: String,

    /// Version tag embedded in the static and app namespace names.
    pub cache_version: String,

    /// Path of the worker script, relative to the origin.
    pub script_url: String,

    /// Registration scope.
    pub scope: String,

    /// Assets stored at install time.
    pub precache: Vec<String>,

    /// Document served to offline navigations with no exact cache hit.
    pub navigation_fallback: String,

    /// Request classification.
    pub routes: RouteConfig,

    /// Retry policy for each precache asset.
    pub precache_retry: PrecacheRetry,

    /// Request activation at the end of install instead of waiting for a
    /// SkipWaiting message.
    pub skip_waiting_on_install: bool,
}

/// Path rules used by the strategy router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Requests under these prefixes are never intercepted.
    pub bypass_prefixes: Vec<String>,

    /// Requests whose path contains any of these are never intercepted
    /// (dev-server hot reload endpoints).
    pub bypass_markers: Vec<String>,

    pub font_extensions: Vec<String>,

    /// Content-hashed build output; safe to serve from cache forever.
    pub immutable_prefix: String,

    /// Prefetched page data.
    pub prefetch_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecacheRetry {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "octopus".to_string(),
            cache_version: "v1".to_string(),
            script_url: "/sw.js".to_string(),
            scope: "/".to_string(),
            precache: vec![
                "/".to_string(),
                "/manifest.json".to_string(),
                "/web-app-manifest-192x192.png".to_string(),
                "/web-app-manifest-512x512.png".to_string(),
                "/logo-dark.svg".to_string(),
            ],
            navigation_fallback: "/".to_string(),
            routes: RouteConfig::default(),
            precache_retry: PrecacheRetry::default(),
            skip_waiting_on_install: false,
        }
    }
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            bypass_prefixes: vec!["/api/".to_string()],
            bypass_markers: vec!["webpack-hmr".to_string()],
            font_extensions: vec![".woff".to_string(), ".woff2".to_string(), ".ttf".to_string()],
            immutable_prefix: "/_next/static/".to_string(),
            prefetch_prefix: "/_next/data/".to_string(),
        }
    }
}

impl Default for PrecacheRetry {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_ms: 100,
        }
    }
}

impl PrecacheRetry {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            ..RetryConfig::default()
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, SwCacheError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SwCacheError::config_with_source("invalid engine config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SwCacheError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Namespace names for this version.
    pub fn cache_names(&self) -> CacheNames {
        CacheNames::new(&self.cache_prefix, &self.cache_version)
    }

    pub fn validate(&self) -> Result<(), SwCacheError> {
        if self.cache_prefix.is_empty() || self.cache_prefix.ends_with('-') {
            return Err(SwCacheError::config(format!(
                "cache_prefix must be non-empty and must not end with '-': {:?}",
                self.cache_prefix
            )));
        }
        if self.cache_version.is_empty() {
            return Err(SwCacheError::config("cache_version must be non-empty"));
        }

        let paths = [
            ("script_url", &self.script_url),
            ("scope", &self.scope),
            ("navigation_fallback", &self.navigation_fallback),
            ("routes.immutable_prefix", &self.routes.immutable_prefix),
            ("routes.prefetch_prefix", &self.routes.prefetch_prefix),
        ];
        for (field, path) in paths {
            require_absolute(field, path)?;
        }
        for path in &self.precache {
            require_absolute("precache", path)?;
        }
        for path in &self.routes.bypass_prefixes {
            require_absolute("routes.bypass_prefixes", path)?;
        }

        Ok(())
    }
}

fn require_absolute(field: &str, path: &str) -> Result<(), SwCacheError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(SwCacheError::config(format!(
            "{field} must be an origin-relative path starting with '/': {path:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.precache.len(), 5);
        assert_eq!(config.routes.immutable_prefix, "/_next/static/");
        assert!(!config.skip_waiting_on_install);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{"cache_version": "v7"}"#).unwrap();
        assert_eq!(config.cache_version, "v7");
        assert_eq!(config.cache_prefix, "octopus");
        assert_eq!(config.cache_names().static_ns.name, "octopus-static-v7");
    }

    #[test]
    fn test_rejects_bad_prefix() {
        let err = EngineConfig::from_json_str(r#"{"cache_prefix": "octopus-"}"#).unwrap_err();
        assert_eq!(err.category(), "config");

        assert!(EngineConfig::from_json_str(r#"{"cache_prefix": ""}"#).is_err());
    }

    #[test]
    fn test_rejects_relative_paths() {
        let config = EngineConfig {
            precache: vec!["manifest.json".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(EngineConfig::from_json_str("{ not json").is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"cache_version": "v2", "skip_waiting_on_install": true,
                "precache_retry": {{"max_attempts": 0}}}}"#
        )
        .unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.cache_version, "v2");
        assert!(config.skip_waiting_on_install);
        assert_eq!(config.precache_retry.to_retry_config().max_attempts, 1);
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert_eq!(err.category(), "io");
    }
}
