//! Error types for webtask-migrate.

use thiserror::Error;

use crate::engine::EngineState;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed constructor or call arguments. Raised before any
    /// asynchronous work starts.
    #[error("{0}")]
    Validation(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: EngineState, to: EngineState },

    #[error(transparent)]
    Remote(#[from] CallError),

    /// A deployment operation failed; `action` reads like "download the webtask".
    #[error("Failed to {action} due to the following error: {source}")]
    Deployment {
        action: &'static str,
        #[source]
        source: CallError,
    },

    #[error("token error: {0}")]
    Token(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single remote call, after classification.
///
/// Absence (404) is not an error and never shows up here; the dispatcher
/// resolves it to `Ok(None)`.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Optimistic-concurrency mismatch. Never retried.
    #[error("Conditional PUT failed with etag mismatch")]
    Conflict,

    /// Any other non-success status.
    #[error("Request failed with status '{status}'{}", message_suffix(.message))]
    Status {
        status: u16,
        message: Option<String>,
    },

    /// The request never produced a response.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Retry budget spent on a retryable failure.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<CallError>,
    },

    /// The dispatcher lanes are gone and the call can no longer complete.
    #[error("dispatcher shut down before the call completed")]
    Shutdown,
}

impl CallError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::Status { status, .. } => *status >= 500,
            CallError::Transport(_) => true,
            CallError::Conflict | CallError::Exhausted { .. } | CallError::Shutdown => false,
        }
    }
}

fn message_suffix(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(" and message '{m}'."),
        None => String::new(),
    }
}
