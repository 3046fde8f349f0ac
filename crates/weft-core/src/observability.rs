//! Observability infrastructure for weft.
//!
//! Structured logging with consistent spans. Components never install a
//! global logger themselves; the process entry point (or a test harness)
//! calls [`init_logging`] and everything else uses `tracing` macros.

use tracing::Span;
use tracing_subscriber::fmt::TestWriter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable selecting the log format.
pub const LOG_FORMAT_ENV: &str = "WEFT_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name; anything other than `json` is pretty.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// How the process-wide subscriber is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Output format.
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
    /// Route output through the test harness capture instead of stderr.
    pub test_writer: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            default_filter: "info".to_string(),
            test_writer: false,
        }
    }
}

impl LogConfig {
    /// Reads the format from `WEFT_LOG_FORMAT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Reads the format through `getter`.
    #[must_use]
    pub fn from_env_with(getter: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            format: getter(LOG_FORMAT_ENV).map_or_else(LogFormat::default, |name| {
                LogFormat::from_name(&name)
            }),
            ..Self::default()
        }
    }

    /// Quiet, captured output for test binaries.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            default_filter: "warn".to_string(),
            test_writer: true,
            ..Self::default()
        }
    }
}

/// Installs the global subscriber.
///
/// Returns false when a subscriber is already installed, so repeated calls
/// from tests or embedding hosts are harmless.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `weft_tasks=debug`)
pub fn init_logging(config: &LogConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let writer = if config.test_writer {
        BoxMakeWriter::new(TestWriter::new())
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };
    let layer = fmt::layer().with_writer(writer);

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.pretty())
            .try_init(),
    };
    installed.is_ok()
}

/// Creates a span for task controller operations.
///
/// ```rust
/// use weft_core::observability::controller_span;
///
/// let span = controller_span("handle_task_failed", "acme-corp");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn controller_span(operation: &str, tenant: &str) -> Span {
    tracing::info_span!("task_controller", op = operation, tenant = tenant)
}
