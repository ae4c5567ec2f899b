use thiserror::Error;

use crate::browser::BrowserError;

/// Errors surfaced by the session and purge engine
#[derive(Debug, Error)]
pub enum SentinelError {
    /// No running browser to attach to and none could be launched
    #[error("no browser session available: {0}")]
    SessionUnavailable(String),

    /// `stop()` was called while `start()` was still connecting
    #[error("session start aborted")]
    SessionAborted,

    #[error(transparent)]
    Browser(#[from] BrowserError),
}
