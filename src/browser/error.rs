use thiserror::Error;

/// Errors raised at the browser boundary.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// Nothing answered on the remote-debugging endpoint.
    #[error("could not connect to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// No Chrome/Chromium/Edge executable on this machine.
    #[error("no browser executable found, install Chrome or set CHROME_PATH")]
    ChromeNotFound,

    /// The browser process could not be started or never came up.
    #[error("failed to launch browser: {0}")]
    LaunchFailed(String),

    /// The tab closed or navigated away under us.
    #[error("page {target_id} is gone")]
    PageGone { target_id: String },

    /// Script evaluation threw or returned garbage.
    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("timed out after {timeout_ms}ms: {context}")]
    Timeout { timeout_ms: u64, context: String },

    /// Protocol-level error reported by the browser.
    #[error("CDP error: {0}")]
    Cdp(String),
}
