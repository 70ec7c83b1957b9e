//! Observability utilities: logging bootstrap, spans and timers.

mod logging;

pub use logging::{init_tracing, step_span, LogFormat, SpanTimer};
