/*!
 * Monitoring
 * Structured tracing setup and per-run spans
 */

pub mod tracer;

pub use tracer::{init_tracing, RunSpan, ENV_TRACE_JSON};
