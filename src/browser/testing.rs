use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{BrowserContext, BrowserDriver, BrowserError, ContextOrigin, PageHandle};
use crate::telemetry::{ActivityVector, INSTALL_SCRIPT, READ_EXPRESSION};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Default)]
struct PageState {
    tracker: Option<ActivityVector>,
    closed: bool,
    fail_install: bool,
    fail_read: bool,
    hung: bool,
}

/// In-memory tab. Mirrors the tracker script: the first install creates a
/// zeroed vector stamped "now", later installs are no-ops, and reads return
/// `null` until a tracker exists.
pub struct FakePage {
    id: String,
    title: String,
    url: String,
    state: Mutex<PageState>,
}

impl FakePage {
    /// A page with no tracker yet
    pub fn untracked(title: &str, url: &str) -> Self {
        Self {
            id: format!("T{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            title: title.to_string(),
            url: url.to_string(),
            state: Mutex::new(PageState::default()),
        }
    }

    /// A page whose tracker is already running with `vector`
    pub fn tracked(title: &str, url: &str, vector: ActivityVector) -> Self {
        let page = Self::untracked(title, url);
        page.state.lock().unwrap().tracker = Some(vector);
        page
    }

    /// Mutate the live counters, as user interaction would
    pub fn interact(&self, f: impl FnOnce(&mut ActivityVector)) {
        let mut state = self.state.lock().unwrap();
        if let Some(v) = state.tracker.as_mut() {
            f(v);
        }
    }

    pub fn fail_install(&self) {
        self.state.lock().unwrap().fail_install = true;
    }

    pub fn fail_read(&self) {
        self.state.lock().unwrap().fail_read = true;
    }

    /// Every later evaluate never returns
    pub fn hang(&self) {
        self.state.lock().unwrap().hung = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl PageHandle for FakePage {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        let hung = self.state.lock().unwrap().hung;
        if hung {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(BrowserError::PageGone {
                target_id: self.id.clone(),
            });
        }

        if expression == INSTALL_SCRIPT {
            if state.fail_install {
                return Err(BrowserError::EvaluationFailed(
                    "Execution context was destroyed".into(),
                ));
            }
            if state.tracker.is_some() {
                return Ok(Value::Bool(false));
            }
            state.tracker = Some(ActivityVector::untracked(chrono::Utc::now().timestamp_millis()));
            return Ok(Value::Bool(true));
        }

        if expression == READ_EXPRESSION {
            if state.fail_read {
                return Err(BrowserError::EvaluationFailed("page unresponsive".into()));
            }
            return Ok(match state.tracker {
                Some(v) => serde_json::to_value(v).unwrap(),
                None => Value::Null,
            });
        }

        Err(BrowserError::EvaluationFailed(format!(
            "unexpected expression: {expression}"
        )))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(BrowserError::PageGone {
                target_id: self.id.clone(),
            });
        }
        state.closed = true;
        Ok(())
    }
}

/// Shared state behind a fake context, kept by tests for inspection.
#[derive(Default)]
pub struct FakeBrowser {
    pages: Mutex<Vec<Arc<FakePage>>>,
    pub closed: AtomicBool,
    pub disconnected: AtomicBool,
    pub fail_close: AtomicBool,
    pub fail_disconnect: AtomicBool,
}

impl FakeBrowser {
    pub fn with_pages(pages: Vec<Arc<FakePage>>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(pages),
            ..Self::default()
        })
    }

    pub fn open_count(&self) -> usize {
        self.pages
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.is_closed())
            .count()
    }

    pub fn context(self: &Arc<Self>, origin: ContextOrigin) -> Box<dyn BrowserContext> {
        Box::new(FakeContext {
            browser: Arc::clone(self),
            origin,
        })
    }
}

struct FakeContext {
    browser: Arc<FakeBrowser>,
    origin: ContextOrigin,
}

#[async_trait]
impl BrowserContext for FakeContext {
    fn origin(&self) -> ContextOrigin {
        self.origin
    }

    async fn pages(&self) -> Result<Vec<Arc<dyn PageHandle>>, BrowserError> {
        Ok(self
            .browser
            .pages
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.is_closed())
            .map(|p| Arc::clone(p) as Arc<dyn PageHandle>)
            .collect())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if self.browser.fail_close.load(Ordering::SeqCst) {
            return Err(BrowserError::Cdp("browser already gone".into()));
        }
        self.browser.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrowserError> {
        if self.browser.fail_disconnect.load(Ordering::SeqCst) {
            return Err(BrowserError::Cdp("connection closed".into()));
        }
        self.browser.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Driver handing out fake contexts.
#[derive(Default)]
pub struct FakeDriver {
    /// Answers `connect` when set
    pub existing: Option<Arc<FakeBrowser>>,
    /// Answers `launch` when set
    pub launchable: Option<Arc<FakeBrowser>>,
    /// Delay before `connect` answers
    pub connect_delay: Duration,
    pub connects: AtomicUsize,
    pub launches: AtomicUsize,
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn BrowserContext>, BrowserError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.connect_delay).await;
        match &self.existing {
            Some(browser) => Ok(browser.context(ContextOrigin::Existing)),
            None => Err(BrowserError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            }),
        }
    }

    async fn launch(&self, _headless: bool) -> Result<Box<dyn BrowserContext>, BrowserError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        match &self.launchable {
            Some(browser) => Ok(browser.context(ContextOrigin::Launched)),
            None => Err(BrowserError::ChromeNotFound),
        }
    }
}
