use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::browser::{BrowserContext, BrowserDriver, BrowserError, ContextOrigin, PageHandle, TabInfo};
use crate::config::Config;
use crate::error::SentinelError;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// ```text
/// Disconnected -> Connecting -> {ConnectedExisting | ConnectedNew} -> Stopping -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    /// Attached to a browser that was already running
    ConnectedExisting,
    /// Running on a browser we launched
    ConnectedNew,
    Stopping,
}

/// A live browser context and the pages it owns.
pub struct SessionHandle {
    id: u64,
    context: Box<dyn BrowserContext>,
}

impl SessionHandle {
    pub fn new(context: Box<dyn BrowserContext>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            context,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn origin(&self) -> ContextOrigin {
        self.context.origin()
    }

    /// Pages currently open in this session's context
    pub async fn pages(&self) -> Result<Vec<Arc<dyn PageHandle>>, BrowserError> {
        self.context.pages().await
    }

    /// Title/url of every open page, for display
    pub async fn open_tabs(&self) -> Result<Vec<TabInfo>, BrowserError> {
        Ok(self.pages().await?.iter().map(|p| p.info()).collect())
    }

    /// Release the context, then the transport. Failures are logged only.
    async fn release(&self) {
        if let Err(e) = self.context.close().await {
            tracing::warn!(session = self.id, error = %e, "failed to close browser context");
        }
        if let Err(e) = self.context.disconnect().await {
            tracing::warn!(session = self.id, error = %e, "failed to release browser driver");
        }
    }
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    handle: Option<Arc<SessionHandle>>,
    /// Set while `start` is in flight
    connecting: Option<CancellationToken>,
}

/// Owns at most one session at a time.
pub struct SessionManager {
    driver: Arc<dyn BrowserDriver>,
    config: Arc<Config>,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(driver: Arc<dyn BrowserDriver>, config: Arc<Config>) -> Self {
        Self {
            driver,
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Attach to the browser on the debug endpoint, or launch a new one.
    ///
    /// Returns the existing handle if already started.
    pub async fn start(&self, headless: bool) -> Result<Arc<SessionHandle>, SentinelError> {
        let cancel = {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = &inner.handle {
                return Ok(Arc::clone(handle));
            }
            if let Some(previous) = inner.connecting.take() {
                previous.cancel();
            }
            let token = CancellationToken::new();
            inner.connecting = Some(token.clone());
            inner.state = SessionState::Connecting;
            token
        };

        let acquired = tokio::select! {
            result = self.acquire(headless) => Some(result),
            _ = cancel.cancelled() => None,
        };

        let mut inner = self.inner.lock().await;
        let ours = inner
            .connecting
            .as_ref()
            .is_some_and(|token| !token.is_cancelled() && !cancel.is_cancelled());
        if ours {
            inner.connecting = None;
        }

        let context = match acquired {
            Some(Ok(context)) => context,
            Some(Err(e)) => {
                if ours {
                    inner.state = SessionState::Disconnected;
                }
                return Err(e);
            }
            None => return Err(SentinelError::SessionAborted),
        };

        let handle = Arc::new(SessionHandle::new(context));
        if !ours {
            // stop() won the race after the context was acquired
            drop(inner);
            handle.release().await;
            return Err(SentinelError::SessionAborted);
        }

        inner.state = match handle.origin() {
            ContextOrigin::Existing => SessionState::ConnectedExisting,
            ContextOrigin::Launched => SessionState::ConnectedNew,
        };
        inner.handle = Some(Arc::clone(&handle));
        tracing::info!(session = handle.id(), origin = ?handle.origin(), "browser session started");
        Ok(handle)
    }

    async fn acquire(&self, headless: bool) -> Result<Box<dyn BrowserContext>, SentinelError> {
        let endpoint = &self.config.debug_endpoint;
        match self.driver.connect(endpoint).await {
            Ok(context) => {
                tracing::info!(%endpoint, "connected to existing browser");
                return Ok(context);
            }
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "could not attach to a running browser, launching a new one");
            }
        }

        self.driver
            .launch(headless)
            .await
            .map_err(|e| SentinelError::SessionUnavailable(e.to_string()))
    }

    /// Tear the session down. Idempotent and infallible: release errors are
    /// logged and swallowed. During `Connecting` it aborts the attempt.
    pub async fn stop(&self) {
        let handle = {
            let mut inner = self.inner.lock().await;
            if let Some(token) = inner.connecting.take() {
                token.cancel();
                inner.state = SessionState::Disconnected;
            }
            match inner.handle.take() {
                Some(handle) => {
                    inner.state = SessionState::Stopping;
                    handle
                }
                None => return,
            }
        };

        handle.release().await;
        self.inner.lock().await.state = SessionState::Disconnected;
        tracing::info!(session = handle.id(), "browser session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{FakeBrowser, FakeDriver, FakePage};
    use std::time::Duration;

    fn manager(driver: FakeDriver) -> SessionManager {
        SessionManager::new(Arc::new(driver), Arc::new(Config::default()))
    }

    #[tokio::test]
    async fn test_attaches_to_existing_browser() {
        let browser = FakeBrowser::with_pages(vec![Arc::new(FakePage::untracked("A", "http://a"))]);
        let manager = manager(FakeDriver {
            existing: Some(Arc::clone(&browser)),
            ..FakeDriver::default()
        });

        let handle = manager.start(true).await.unwrap();
        assert_eq!(handle.origin(), ContextOrigin::Existing);
        assert_eq!(manager.state().await, SessionState::ConnectedExisting);
        assert_eq!(handle.open_tabs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_launch() {
        let launched = FakeBrowser::with_pages(Vec::new());
        let driver = Arc::new(FakeDriver {
            launchable: Some(Arc::clone(&launched)),
            ..FakeDriver::default()
        });
        let manager = SessionManager::new(driver.clone(), Arc::new(Config::default()));

        let handle = manager.start(true).await.unwrap();
        assert_eq!(handle.origin(), ContextOrigin::Launched);
        assert_eq!(manager.state().await, SessionState::ConnectedNew);
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
        assert_eq!(driver.launches.load(Ordering::SeqCst), 1);
        assert!(handle.pages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_browser_is_session_unavailable() {
        let manager = manager(FakeDriver::default());
        let err = manager.start(true).await.err().unwrap();
        assert!(matches!(err, SentinelError::SessionUnavailable(_)));
        assert_eq!(manager.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_start_twice_reuses_handle() {
        let driver = Arc::new(FakeDriver {
            launchable: Some(FakeBrowser::with_pages(Vec::new())),
            ..FakeDriver::default()
        });
        let manager = SessionManager::new(driver.clone(), Arc::new(Config::default()));

        let first = manager.start(true).await.unwrap();
        let second = manager.start(true).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(driver.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_releases_and_is_idempotent() {
        let browser = FakeBrowser::with_pages(Vec::new());
        let manager = manager(FakeDriver {
            launchable: Some(Arc::clone(&browser)),
            ..FakeDriver::default()
        });

        manager.stop().await;
        assert_eq!(manager.state().await, SessionState::Disconnected);

        manager.start(false).await.unwrap();
        manager.stop().await;
        manager.stop().await;

        assert!(browser.closed.load(Ordering::SeqCst));
        assert!(browser.disconnected.load(Ordering::SeqCst));
        assert_eq!(manager.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_swallows_close_failure_and_still_disconnects() {
        let browser = FakeBrowser::with_pages(Vec::new());
        browser.fail_close.store(true, Ordering::SeqCst);
        let manager = manager(FakeDriver {
            launchable: Some(Arc::clone(&browser)),
            ..FakeDriver::default()
        });

        manager.start(true).await.unwrap();
        manager.stop().await;

        assert!(!browser.closed.load(Ordering::SeqCst));
        assert!(browser.disconnected.load(Ordering::SeqCst));
        assert_eq!(manager.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_during_connecting_aborts_start() {
        let browser = FakeBrowser::with_pages(Vec::new());
        let manager = Arc::new(manager(FakeDriver {
            existing: Some(Arc::clone(&browser)),
            connect_delay: Duration::from_millis(500),
            ..FakeDriver::default()
        }));

        let starter = Arc::clone(&manager);
        let start = tokio::spawn(async move { starter.start(true).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state().await, SessionState::Connecting);
        manager.stop().await;

        let result = start.await.unwrap();
        assert!(matches!(result, Err(SentinelError::SessionAborted)));
        assert_eq!(manager.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_swallows_disconnect_failure() {
        let browser = FakeBrowser::with_pages(Vec::new());
        browser.fail_disconnect.store(true, Ordering::SeqCst);
        let manager = manager(FakeDriver {
            existing: Some(Arc::clone(&browser)),
            ..FakeDriver::default()
        });

        manager.start(true).await.unwrap();
        manager.stop().await;

        assert!(browser.closed.load(Ordering::SeqCst));
        assert!(!browser.disconnected.load(Ordering::SeqCst));
        assert_eq!(manager.state().await, SessionState::Disconnected);

        // Nothing left to release
        manager.stop().await;
        assert_eq!(manager.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_swallows_both_release_failures() {
        let browser = FakeBrowser::with_pages(Vec::new());
        browser.fail_close.store(true, Ordering::SeqCst);
        browser.fail_disconnect.store(true, Ordering::SeqCst);
        let manager = manager(FakeDriver {
            launchable: Some(Arc::clone(&browser)),
            ..FakeDriver::default()
        });

        manager.start(true).await.unwrap();
        manager.stop().await;
        assert_eq!(manager.state().await, SessionState::Disconnected);

        // A fresh start works after a failed teardown
        browser.fail_close.store(false, Ordering::SeqCst);
        browser.fail_disconnect.store(false, Ordering::SeqCst);
        manager.start(true).await.unwrap();
        assert_eq!(manager.state().await, SessionState::ConnectedNew);
    }

    #[tokio::test]
    async fn test_stop_after_acquire_releases_the_context() {
        let browser = FakeBrowser::with_pages(Vec::new());
        let manager = Arc::new(manager(FakeDriver {
            existing: Some(Arc::clone(&browser)),
            connect_delay: Duration::from_millis(100),
            ..FakeDriver::default()
        }));

        let starter = Arc::clone(&manager);
        let start = tokio::spawn(async move { starter.start(true).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.state().await, SessionState::Connecting);

        // Hold the state lock so stop() queues ahead of start()'s second lock
        let guard = manager.inner.lock().await;
        let stopper = Arc::clone(&manager);
        let stop = tokio::spawn(async move { stopper.stop().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!browser.closed.load(Ordering::SeqCst));
        drop(guard);

        stop.await.unwrap();
        let result = start.await.unwrap();
        assert!(matches!(result, Err(SentinelError::SessionAborted)));
        assert!(browser.closed.load(Ordering::SeqCst));
        assert!(browser.disconnected.load(Ordering::SeqCst));
        assert_eq!(manager.state().await, SessionState::Disconnected);
        assert!(manager.inner.lock().await.handle.is_none());
    }

    #[tokio::test]
    async fn test_sessions_own_disjoint_pages() {
        let first = FakeBrowser::with_pages(vec![Arc::new(FakePage::untracked("A", "http://a"))]);
        let second = FakeBrowser::with_pages(vec![
            Arc::new(FakePage::untracked("B", "http://b")),
            Arc::new(FakePage::untracked("C", "http://c")),
        ]);
        let a = manager(FakeDriver {
            existing: Some(first),
            ..FakeDriver::default()
        });
        let b = manager(FakeDriver {
            launchable: Some(second),
            ..FakeDriver::default()
        });

        let (ha, hb) = tokio::join!(a.start(true), b.start(true));
        let (ha, hb) = (ha.unwrap(), hb.unwrap());
        assert_ne!(ha.id(), hb.id());

        let urls_a: Vec<_> = ha.open_tabs().await.unwrap().into_iter().map(|t| t.url).collect();
        let urls_b: Vec<_> = hb.open_tabs().await.unwrap().into_iter().map(|t| t.url).collect();
        assert_eq!(urls_a, vec!["http://a"]);
        assert_eq!(urls_b, vec!["http://b", "http://c"]);
    }
}
