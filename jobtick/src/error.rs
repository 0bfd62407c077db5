//! Validation errors and the helper used to turn any error into the text stored in
//! [`crate::job::Job::last_error`].
use serde::Serialize;
use thiserror::Error;

use crate::{job::config::ConfigError, schedule::ScheduleError};

/// Substituted for a structured error payload that cannot be rendered.
pub const UNSERIALIZABLE_PAYLOAD: &str = "[Unserializable]";

/// Rejected input when creating or updating a job.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Job name must not be empty")]
    EmptyName,
    #[error("Invalid cron expression: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("Invalid job config: {0}")]
    Config(#[from] ConfigError),
    #[error("max retries must be between 0 and {max}, got {value}")]
    MaxRetries { value: u16, max: u16 },
    #[error("Unknown job status `{0}`")]
    UnknownStatus(String),
    #[error("Unknown job type `{0}`")]
    UnknownJobType(String),
}

/// Flatten an error and its chain of sources into a single line.
///
/// Sources whose message is already contained in the outer message are skipped, so wrapping
/// errors that repeat their cause in `Display` are not duplicated.
pub fn to_display_string<E>(error: &E) -> String
where
    E: std::error::Error + ?Sized,
{
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_message = cause.to_string();
        if !cause_message.is_empty() && !message.contains(&cause_message) {
            message.push_str(": ");
            message.push_str(&cause_message);
        }
        source = cause.source();
    }
    message
}

/// Render a structured payload attached to an error as compact JSON.
pub(crate) fn render_payload<T>(payload: &T) -> String
where
    T: Serialize + ?Sized,
{
    serde_json::to_string(payload).unwrap_or_else(|_| UNSERIALIZABLE_PAYLOAD.to_owned())
}
