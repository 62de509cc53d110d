//! Log setup for the HSA runtime workspace.
//!
//! `hsa-core` only emits `tracing` events and spans. Whoever owns the process
//! (a tool, a test binary, a benchmark) picks a [`LogProfile`], optionally
//! adjusts it through [`LogConfig`], and installs the subscriber once with
//! [`install`]. Integration tests call [`init_test_logging`], which routes
//! output through the libtest capture.

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::sync::Once;

pub use tracing::{debug, error, info, trace, warn};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Filter used when neither the config nor `RUST_LOG` names one.
pub const DEFAULT_FILTER: &str = "warn,hsa_core=info";

/// Preset combinations of format and verbosity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogProfile {
    /// Human-readable output on a terminal.
    Local,
    /// Line-delimited JSON for log collectors.
    Ci,
    /// JSON with runtime debug events, span close timings and perf spans.
    Performance,
}

impl LogProfile {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "ci" => Some(Self::Ci),
            "performance" | "perf" => Some(Self::Performance),
            _ => None,
        }
    }
}

/// Formatter used by the installed layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Subscriber settings.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Explicit filter directives. `None` defers to `RUST_LOG`, then
    /// [`DEFAULT_FILTER`].
    pub filter: Option<String>,
    pub format: LogFormat,
    pub ansi: bool,
    /// Show thread names. The runtime names its worker threads
    /// (`hsa-async-events`, `hsa-blit-N`) so this is on by default.
    pub thread_names: bool,
    pub span_events: FmtSpan,
    /// Turns [`performance::PerformanceSpan`] logging on or off.
    pub perf_spans: bool,
    /// Spans shorter than this many microseconds are not logged.
    pub perf_threshold_us: Option<u64>,
}

impl From<LogProfile> for LogConfig {
    fn from(profile: LogProfile) -> Self {
        let base = Self {
            filter: None,
            format: LogFormat::Pretty,
            ansi: true,
            thread_names: true,
            span_events: FmtSpan::NONE,
            perf_spans: false,
            perf_threshold_us: None,
        };
        match profile {
            LogProfile::Local => Self {
                perf_spans: cfg!(debug_assertions),
                ..base
            },
            LogProfile::Ci => Self {
                format: LogFormat::Json,
                ansi: false,
                ..base
            },
            LogProfile::Performance => Self {
                filter: Some("warn,hsa_core=debug,hsa_tracing=debug".to_string()),
                format: LogFormat::Json,
                ansi: false,
                span_events: FmtSpan::CLOSE,
                perf_spans: true,
                ..base
            },
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogProfile::Local.into()
    }
}

impl LogConfig {
    /// Start from `HSA_LOG_PROFILE` and apply the remaining overrides.
    ///
    /// # Environment Variables
    ///
    /// - `HSA_LOG_PROFILE` - `local` (default), `ci` or `performance`
    /// - `HSA_LOG` - filter directives, takes precedence over `RUST_LOG`
    /// - `HSA_LOG_FORMAT` - `pretty`, `compact` or `json`
    /// - `HSA_PERF_SPANS` - `1`/`true`/`yes` enables perf spans, anything else disables
    /// - `HSA_PERF_THRESHOLD_US` - minimum logged span duration
    pub fn from_env() -> Self {
        let profile = env::var("HSA_LOG_PROFILE")
            .ok()
            .and_then(|value| LogProfile::parse(&value))
            .unwrap_or(LogProfile::Local);
        let mut config = LogConfig::from(profile);

        if let Some(filter) = env::var("HSA_LOG").ok().filter(|f| !f.trim().is_empty()) {
            config.filter = Some(filter);
        }
        if let Some(format) = env::var("HSA_LOG_FORMAT").ok().and_then(|f| LogFormat::parse(&f)) {
            config = config.format(format);
        }
        if let Ok(value) = env::var("HSA_PERF_SPANS") {
            config.perf_spans = matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(threshold) = env::var("HSA_PERF_THRESHOLD_US")
            .ok()
            .and_then(|t| t.trim().parse().ok())
        {
            config.perf_threshold_us = Some(threshold);
        }
        config
    }

    /// Switch formatter. JSON never carries ANSI escapes.
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        if format == LogFormat::Json {
            self.ansi = false;
        }
        self
    }

    pub fn filter(mut self, directives: impl Into<String>) -> Self {
        self.filter = Some(directives.into());
        self
    }

    fn env_filter(&self) -> Result<EnvFilter, LogSetupError> {
        match &self.filter {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| LogSetupError::Filter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
        }
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_ansi(self.ansi && self.format != LogFormat::Json)
            .with_thread_names(self.thread_names)
            .with_span_events(self.span_events.clone());
        match self.format {
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }

    fn apply_perf_settings(&self) {
        performance::set_enabled(self.perf_spans);
        performance::set_default_threshold(self.perf_threshold_us);
    }
}

/// Failures while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LogSetupError {
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// Another global subscriber is already installed.
    #[error("log subscriber already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// Install `config` as the process-wide subscriber.
pub fn install(config: &LogConfig) -> Result<(), LogSetupError> {
    let filter = config.env_filter()?;
    config.apply_perf_settings();
    Registry::default()
        .with(config.fmt_layer())
        .with(filter)
        .try_init()?;
    Ok(())
}

/// Install a compact subscriber writing through the test harness capture.
///
/// Safe to call from every test; only the first call installs anything and
/// failures (another subscriber already present) are ignored.
pub fn init_test_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let config = LogConfig::from_env().format(LogFormat::Compact);
        let Ok(filter) = config.env_filter() else {
            return;
        };
        config.apply_perf_settings();
        let layer = fmt::layer()
            .compact()
            .with_test_writer()
            .with_ansi(false)
            .with_thread_names(true);
        let _ = Registry::default().with(layer).with(filter).try_init();
    });
}
