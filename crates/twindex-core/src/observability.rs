//! Observability infrastructure for twindex.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors so that every component
//! logs with the same fields.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `twindex_search=debug`)
///
/// # Example
///
/// ```rust
/// use twindex_core::observability::{LogFormat, init_logging};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for per-twin updater operations.
#[must_use]
pub fn updater_span(operation: &str, twin_id: &str) -> Span {
    tracing::info_span!("updater", op = operation, twin_id = twin_id)
}

/// Creates a span for enforcement-flow operations.
#[must_use]
pub fn enforcement_span(operation: &str, twin_id: &str) -> Span {
    tracing::info_span!("enforcement", op = operation, twin_id = twin_id)
}

/// Creates a span for bulk-writer operations.
#[must_use]
pub fn bulk_span(operation: &str, partition: usize) -> Span {
    tracing::info_span!("bulk", op = operation, partition = partition)
}
