//! Strategy router.
//!
//! Rules are evaluated top-down and the first match wins:
//!
//! ```text
//! cross-origin / non-GET        → pass through
//! bypass prefix / dev marker    → pass through
//! font extension                → CacheFirst            (font ns)
//! immutable prefix              → CacheFirst            (static ns)
//! prefetch prefix               → NetworkFirst          (app ns)
//! navigation                    → NetworkFirst + "/"    (app ns)
//! anything else                 → StaleWhileRevalidate  (app ns)
//! ```

use http::Method;
use swcache_net::{PathPattern, Request};
use url::Url;

use crate::cache::{CacheNames, NamespaceKind};
use crate::config::EngineConfig;
use crate::strategy::Strategy;

/// Classification bucket for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    ImmutableStatic,
    PrefetchData,
    Navigation,
    GenericStatic,
    Font,
}

impl ResourceClass {
    pub fn namespace_kind(&self) -> NamespaceKind {
        match self {
            ResourceClass::ImmutableStatic => NamespaceKind::Static,
            ResourceClass::Font => NamespaceKind::Font,
            ResourceClass::PrefetchData
            | ResourceClass::Navigation
            | ResourceClass::GenericStatic => NamespaceKind::App,
        }
    }
}

/// Where and how an intercepted request is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub class: ResourceClass,
    pub strategy: Strategy,
    pub namespace: String,
}

pub struct StrategyRouter {
    origin: Url,
    bypass: Vec<PathPattern>,
    fonts: Vec<PathPattern>,
    immutable: PathPattern,
    prefetch: PathPattern,
    navigation_fallback: String,
    names: CacheNames,
}

impl StrategyRouter {
    pub fn new(origin: Url, config: &EngineConfig) -> Self {
        let routes = &config.routes;
        let bypass = routes
            .bypass_prefixes
            .iter()
            .map(|p| PathPattern::prefix(p))
            .chain(routes.bypass_markers.iter().map(|m| PathPattern::contains(m)))
            .collect();

        Self {
            origin,
            bypass,
            fonts: routes
                .font_extensions
                .iter()
                .map(|e| PathPattern::extension(e))
                .collect(),
            immutable: PathPattern::prefix(&routes.immutable_prefix),
            prefetch: PathPattern::prefix(&routes.prefetch_prefix),
            navigation_fallback: config.navigation_fallback.clone(),
            names: config.cache_names(),
        }
    }

    /// Classify a request. `None` means the request is not intercepted.
    pub fn classify(&self, request: &Request) -> Option<ResourceClass> {
        if request.method != Method::GET || !request.is_same_origin(&self.origin) {
            return None;
        }

        let path = request.url.path();
        if PathPattern::any_matches(&self.bypass, path) {
            return None;
        }

        let class = if PathPattern::any_matches(&self.fonts, path) {
            ResourceClass::Font
        } else if self.immutable.matches(path) {
            ResourceClass::ImmutableStatic
        } else if self.prefetch.matches(path) {
            ResourceClass::PrefetchData
        } else if request.is_navigation() {
            ResourceClass::Navigation
        } else {
            ResourceClass::GenericStatic
        };
        Some(class)
    }

    /// Resolve the strategy and namespace for a request.
    pub fn route(&self, request: &Request) -> Option<Route> {
        let class = self.classify(request)?;
        let strategy = match class {
            ResourceClass::Font | ResourceClass::ImmutableStatic => Strategy::CacheFirst,
            ResourceClass::PrefetchData => Strategy::NetworkFirst { fallback: None },
            ResourceClass::Navigation => Strategy::NetworkFirst {
                fallback: Some(self.navigation_fallback.clone()),
            },
            ResourceClass::GenericStatic => Strategy::StaleWhileRevalidate,
        };

        Some(Route {
            class,
            strategy,
            namespace: self.names.get(class.namespace_kind()).name.clone(),
        })
    }
}
