//! Identifier generation.

use uuid::Uuid;

/// Generates a run correlation token (UUID v7, time ordered).
#[must_use]
pub fn generate_run_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generates a task identifier (UUID v4).
#[must_use]
pub fn generate_task_id() -> String {
    Uuid::new_v4().to_string()
}
