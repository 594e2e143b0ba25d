//! Observability infrastructure for Oxbow.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors used across all components.

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
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `oxbow_flow=debug`)
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

/// Creates a span for task lifecycle operations with standard fields.
///
/// # Example
///
/// ```rust
/// use oxbow_core::observability::task_span;
///
/// let span = task_span("dispatch", "7c9e6679-7425-40de-944b-e07fc1f90ae7", None);
/// let _guard = span.enter();
/// // ... process the task
/// ```
#[must_use]
pub fn task_span(operation: &str, task_id: &str, trace_id: Option<&str>) -> Span {
    tracing::info_span!(
        "task",
        op = operation,
        task_id = task_id,
        trace_id = trace_id.unwrap_or(""),
    )
}

/// Creates a span for webhook intake operations.
#[must_use]
pub fn webhook_span(source: &str, external_id: &str) -> Span {
    tracing::info_span!("webhook", source = source, external_id = external_id)
}
