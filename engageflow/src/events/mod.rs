//! Event sink system for observability.
//!
//! Every state transition in the engine is reported as a
//! [`PipelineEvent`](crate::core::PipelineEvent) through an [`EventSink`]
//! passed in as a dependency.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
