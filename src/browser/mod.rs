mod cdp;
mod chrome;
mod error;
#[cfg(test)]
pub mod testing;

pub use cdp::CdpDriver;
pub use error::BrowserError;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a browser context was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextOrigin {
    /// Attached to a browser that was already running
    Existing,
    /// Launched by us
    Launched,
}

/// Title/url pair of an open tab, for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub title: String,
    pub url: String,
}

/// A reference to a live tab.
///
/// The tab can disappear at any moment (closed by the user, navigated,
/// crashed), so every async method may fail with a "gone" error and
/// callers must treat that as routine.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Stable identifier of the underlying target
    fn id(&self) -> &str;
    /// Title as of enumeration
    fn title(&self) -> &str;
    /// URL as of enumeration
    fn url(&self) -> &str;

    /// Evaluate a JS expression in the page's current execution context
    /// and return its value.
    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError>;

    /// Close the tab.
    async fn close(&self) -> Result<(), BrowserError>;

    fn info(&self) -> TabInfo {
        TabInfo {
            title: self.title().to_string(),
            url: self.url().to_string(),
        }
    }
}

/// A controllable browser context owning a set of pages.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    fn origin(&self) -> ContextOrigin;

    /// Enumerate the pages currently open in this context
    async fn pages(&self) -> Result<Vec<Arc<dyn PageHandle>>, BrowserError>;

    /// Release the context (and the browser, if we launched it).
    async fn close(&self) -> Result<(), BrowserError>;

    /// Release the driver transport. Called after `close`, even when
    /// `close` failed.
    async fn disconnect(&self) -> Result<(), BrowserError>;
}

/// Produces browser contexts, either by attaching or by launching.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Attach to a browser listening on `endpoint` and reuse its default context
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn BrowserContext>, BrowserError>;

    /// Launch a fresh browser process with a new context
    async fn launch(&self, headless: bool) -> Result<Box<dyn BrowserContext>, BrowserError>;
}
