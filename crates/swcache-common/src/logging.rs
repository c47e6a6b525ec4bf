//! Subscriber setup for hosts embedding the engine.
//!
//! The engine itself only emits `tracing` events. Binaries call
//! [`init_logging`] once at startup.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::SwCacheError;

/// Directives applied when neither `RUST_LOG` nor an explicit filter is set.
const DEFAULT_DIRECTIVES: &[&str] = &["hyper=warn", "reqwest=warn", "rustls=warn"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, with targets.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl FromStr for LogFormat {
    type Err = SwCacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(SwCacheError::config(format!("unknown log format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for everything not covered by a directive.
    pub level: Level,
    pub format: LogFormat,
    /// Source file and line on each event (pretty only).
    pub include_location: bool,
    /// Log span creation and close.
    pub include_span_events: bool,
    /// Replaces the default directives and `RUST_LOG`, e.g. `"swcache_sw=debug"`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            include_location: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Everything at debug, with locations and span events.
    pub fn debug() -> Self {
        Self {
            level: Level::DEBUG,
            include_location: true,
            include_span_events: true,
            ..Self::default()
        }
    }

    /// JSON at info.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Explicit filter, then `RUST_LOG`, then the level plus the default
    /// directives.
    fn env_filter(&self) -> EnvFilter {
        if let Some(custom) = &self.filter {
            if let Ok(filter) = EnvFilter::try_new(custom) {
                return filter;
            }
        }
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }

        DEFAULT_DIRECTIVES
            .iter()
            .filter_map(|d| d.parse::<Directive>().ok())
            .fold(EnvFilter::new(self.level.to_string()), |filter, directive| {
                filter.add_directive(directive)
            })
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber.
///
/// Fails if one is already installed.
pub fn init_logging(config: LogConfig) -> crate::Result<()> {
    let fmt_layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_span_events(config.span_events())
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_span_events(config.span_events())
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(config.span_events())
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(config.env_filter())
        .try_init()
        .map_err(|e| SwCacheError::Logging(e.to_string()))
}
