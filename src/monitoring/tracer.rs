/*!
 * Run Tracing
 * Structured tracing for executor runs using the tracing crate
 *
 * Every run carries its run id as a span field, so the lifecycle events a
 * strategy emits can be correlated across worker threads.
 */

use crate::core::types::RunningMode;
use std::time::Instant;
use tracing::{debug, info, span, warn, Level, Span};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use uuid::Uuid;

/// Enables JSON output when set to `1` or `true`
pub const ENV_TRACE_JSON: &str = "RUNNABLE_TRACE_JSON";

/// Install the global subscriber
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - RUNNABLE_TRACE_JSON: Enable JSON output (default: false)
///
/// Returns false when a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var(ENV_TRACE_JSON)
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_line_number(true)
                    .with_file(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Structured tracing initialized");
    }
    installed
}

/// Span covering one executor operation (`run`, `map`, `close`, ...)
pub struct RunSpan {
    span: Span,
    start: Instant,
    run_id: Uuid,
    operation: &'static str,
}

impl RunSpan {
    /// Runs slower than this are reported at warn level
    const SLOW_RUN_MS: u128 = 10_000;

    pub fn new(operation: &'static str, run_id: Uuid, mode: RunningMode, workers: usize) -> Self {
        let span = span!(
            Level::INFO,
            "run",
            run_id = %run_id,
            operation = operation,
            mode = %mode,
            workers = workers,
            jobs = tracing::field::Empty,
            successes = tracing::field::Empty,
            failures = tracing::field::Empty,
            error = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        span.in_scope(|| debug!(operation, run_id = %run_id, "run started"));

        Self {
            span,
            start: Instant::now(),
            run_id,
            operation,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn record_jobs(&self, jobs: usize) {
        self.span.record("jobs", jobs);
    }

    /// Record how the collected results split
    pub fn record_outcomes(&self, successes: usize, failures: usize) {
        self.span.record("successes", successes);
        self.span.record("failures", failures);
    }

    pub fn record_error(&self, error: &dyn std::fmt::Display) {
        self.span.record("error", tracing::field::display(error));
    }

    /// Enter the span context
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for RunSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let _entered = self.span.enter();
        self.span.record("duration_ms", duration.as_millis());

        if duration.as_millis() > Self::SLOW_RUN_MS {
            warn!(
                run_id = %self.run_id,
                operation = self.operation,
                duration_ms = duration.as_millis(),
                slow = true,
                "slow run detected"
            );
        } else {
            debug!(
                run_id = %self.run_id,
                operation = self.operation,
                duration_us = duration.as_micros(),
                "run completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_keeps_run_id() {
        let run_id = Uuid::new_v4();
        let span = RunSpan::new("run", run_id, RunningMode::MultiThread, 2);
        span.record_jobs(2);
        span.record_outcomes(1, 1);
        assert_eq!(span.run_id(), run_id);
    }

    #[test]
    fn test_second_init_is_refused() {
        let _ = init_tracing();
        assert!(!init_tracing());
    }
}
