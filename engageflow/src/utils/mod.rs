//! Utility functions for identifiers, timestamps and text handling.

mod ids;
mod text;
pub mod timestamps;

pub use ids::{generate_run_id, generate_task_id};
pub use text::truncate_chars;
pub use timestamps::{elapsed_ms, format_iso8601, iso_timestamp, now_utc, Timestamp};
