use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::browser::{BrowserError, PageHandle};

/// Injected into every page. Counts clicks, keystrokes and scrolls, samples
/// mouse movement at most every 500ms, and stamps the last interaction.
/// Guarded so a second install in the same context leaves the running
/// counters alone; navigation resets it to a fresh zero vector.
pub const INSTALL_SCRIPT: &str = r#"(function () {
    if (window.__ramSentinelInstalled) return false;
    window.__ramSentinelInstalled = true;

    var now = Date.now();
    var v = window.__ramSentinel = {
        clicks: 0,
        keys: 0,
        scrolls: 0,
        mouseSamples: 0,
        lastActive: now,
        installedAt: now
    };
    var opts = { passive: true, capture: true };
    var touch = function () { v.lastActive = Date.now(); };

    window.addEventListener('click', function () { v.clicks++; touch(); }, opts);
    window.addEventListener('keydown', function () { v.keys++; touch(); }, opts);
    window.addEventListener('scroll', function () { v.scrolls++; touch(); }, opts);

    var lastMove = 0;
    window.addEventListener('mousemove', function () {
        var t = Date.now();
        if (t - lastMove < 500) return;
        lastMove = t;
        v.mouseSamples++;
        v.lastActive = t;
    }, opts);
    return true;
})()"#;

/// Reads the tracker's vector, or `null` when no tracker runs in this context.
pub const READ_EXPRESSION: &str =
    "window.__ramSentinel ? Object.assign({}, window.__ramSentinel) : null";

/// Per-page interaction counters, as kept by the tracker script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivityVector {
    pub clicks: u64,
    pub keys: u64,
    pub scrolls: u64,
    pub mouse_samples: u64,
    /// Unix millis of the last interaction
    #[serde(rename = "lastActive")]
    pub last_active_timestamp: i64,
    /// Unix millis when the tracker was installed
    pub installed_at: i64,
}

impl ActivityVector {
    /// Vector for a page we have no telemetry for: treated as active right now.
    pub fn untracked(now_ms: i64) -> Self {
        Self {
            last_active_timestamp: now_ms,
            installed_at: now_ms,
            ..Self::default()
        }
    }

    /// Seconds since the last interaction. Never negative.
    pub fn idle_seconds(&self, now_ms: i64) -> f64 {
        let last = if self.last_active_timestamp > 0 {
            self.last_active_timestamp
        } else {
            now_ms
        };
        (now_ms - last).max(0) as f64 / 1000.0
    }
}

/// Result of an install attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    /// Tracker was injected by this call
    Fresh,
    /// Tracker was already running in this context
    AlreadyPresent,
    /// Page was navigating, closed or unresponsive
    Failed,
}

/// Installs the tracker and reads it back, with a bound on every page call.
#[derive(Debug, Clone)]
pub struct ActivityInstrumentor {
    timeout: Duration,
}

impl ActivityInstrumentor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Inject the tracker. Failures are logged and swallowed; the page simply
    /// has no telemetry this cycle.
    pub async fn install(&self, page: &dyn PageHandle) -> Installed {
        match tokio::time::timeout(self.timeout, page.evaluate(INSTALL_SCRIPT)).await {
            Ok(Ok(Value::Bool(true))) => Installed::Fresh,
            Ok(Ok(_)) => Installed::AlreadyPresent,
            Ok(Err(e)) => {
                tracing::debug!(url = %page.url(), error = %e, "tracker install failed");
                Installed::Failed
            }
            Err(_) => {
                tracing::debug!(url = %page.url(), "tracker install timed out");
                Installed::Failed
            }
        }
    }

    /// Fetch the page's current vector. Pages without a tracker get
    /// [`ActivityVector::untracked`].
    pub async fn read(
        &self,
        page: &dyn PageHandle,
        now_ms: i64,
    ) -> Result<ActivityVector, BrowserError> {
        let raw = tokio::time::timeout(self.timeout, page.evaluate(READ_EXPRESSION))
            .await
            .map_err(|_| BrowserError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
                context: format!("reading telemetry from {}", page.url()),
            })??;

        if raw.is_null() {
            return Ok(ActivityVector::untracked(now_ms));
        }

        let mut vector: ActivityVector = serde_json::from_value(raw)
            .map_err(|e| BrowserError::EvaluationFailed(format!("bad telemetry: {e}")))?;
        if vector.last_active_timestamp <= 0 {
            vector.last_active_timestamp = now_ms;
        }
        Ok(vector)
    }
}
