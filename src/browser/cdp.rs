use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::chrome::{self, ProfileDir};
use super::error::BrowserError;
use super::{BrowserContext, BrowserDriver, ContextOrigin, PageHandle};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingTx = oneshot::Sender<Result<Value, String>>;
/// Flattened session id per attached target, shared by a context's pages
type SessionCache = Arc<Mutex<HashMap<String, String>>>;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Protocol error messages that mean the target no longer exists
const GONE_MARKERS: &[&str] = &[
    "No target with given id",
    "No session with given id",
    "Target closed",
    "Session closed",
    "Cannot find context with specified id",
    "Execution context was destroyed",
];

struct CdpCommand {
    method: String,
    params: Value,
    session_id: Option<String>,
    response_tx: PendingTx,
}

/// A browser-level CDP socket with a background handler task.
///
/// Only the handful of commands the purger needs; pages are driven through
/// flattened target sessions.
struct CdpConnection {
    cmd_tx: mpsc::Sender<CdpCommand>,
    handler: JoinHandle<()>,
}

impl CdpConnection {
    async fn connect(ws_url: &str) -> Result<Self, BrowserError> {
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(ws_url))
            .await
            .map_err(|_| BrowserError::Timeout {
                timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
                context: format!("WebSocket handshake with {ws_url}"),
            })?
            .map_err(|e| BrowserError::ConnectionFailed {
                endpoint: ws_url.to_string(),
                reason: e.to_string(),
            })?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<CdpCommand>(64);
        let handler = tokio::spawn(handler_loop(ws, cmd_rx));
        Ok(Self { cmd_tx, handler })
    }

    async fn send(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, BrowserError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CdpCommand {
                method: method.into(),
                params,
                session_id: session_id.map(String::from),
                response_tx: tx,
            })
            .await
            .map_err(|_| BrowserError::Cdp("connection closed".into()))?;

        let result = tokio::time::timeout(COMMAND_TIMEOUT, rx)
            .await
            .map_err(|_| BrowserError::Timeout {
                timeout_ms: COMMAND_TIMEOUT.as_millis() as u64,
                context: format!("CDP {method}"),
            })?
            .map_err(|_| BrowserError::Cdp("response dropped".into()))?;

        result.map_err(BrowserError::Cdp)
    }

    fn shutdown(&self) {
        self.handler.abort();
    }
}

/// Routes commands out over the socket and responses back to their callers.
/// Events (messages without an id) are not needed and are dropped.
async fn handler_loop(ws: WsStream, mut cmd_rx: mpsc::Receiver<CdpCommand>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<u64, PendingTx> = HashMap::new();
    let next_id = AtomicU64::new(1);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let mut msg = json!({
                    "id": id,
                    "method": cmd.method,
                    "params": cmd.params,
                });
                if let Some(session_id) = cmd.session_id {
                    msg["sessionId"] = Value::String(session_id);
                }
                let abandoned = drop_abandoned(&mut pending);
                if abandoned > 0 {
                    tracing::debug!(abandoned, "dropped CDP replies nobody is waiting for");
                }
                pending.insert(id, cmd.response_tx);
                if ws_tx.send(Message::Text(msg.to_string())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(val) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                let Some(id) = val.get("id").and_then(Value::as_u64) else {
                    continue;
                };
                if let Some(tx) = pending.remove(&id) {
                    if let Some(err) = val.get("error") {
                        let msg = err["message"].as_str().unwrap_or("CDP error");
                        let _ = tx.send(Err(msg.into()));
                    } else {
                        let _ = tx.send(Ok(val["result"].clone()));
                    }
                }
            }
        }
    }
    tracing::debug!(pending = pending.len(), "CDP handler loop exited");
}

/// Forget commands whose caller timed out and dropped its receiver.
fn drop_abandoned(pending: &mut HashMap<u64, PendingTx>) -> usize {
    let before = pending.len();
    pending.retain(|_, tx| !tx.is_closed());
    before - pending.len()
}

/// Keep only sessions whose target is still open.
fn retain_live(sessions: &mut HashMap<String, String>, live: &HashSet<String>) {
    sessions.retain(|target_id, _| live.contains(target_id));
}

fn is_gone(err: &BrowserError) -> bool {
    match err {
        BrowserError::Cdp(msg) => GONE_MARKERS.iter().any(|m| msg.contains(m)),
        _ => false,
    }
}

/// A tab reached through a flattened target session.
struct CdpPage {
    conn: Arc<CdpConnection>,
    target_id: String,
    title: String,
    url: String,
    sessions: SessionCache,
    session_id: OnceCell<String>,
}

impl CdpPage {
    fn gone_or(&self, err: BrowserError) -> BrowserError {
        if is_gone(&err) {
            BrowserError::PageGone {
                target_id: self.target_id.clone(),
            }
        } else {
            err
        }
    }

    /// Attach once per target for the life of the context; later scans
    /// reuse the cached session.
    async fn session(&self) -> Result<&str, BrowserError> {
        let session_id = self
            .session_id
            .get_or_try_init(|| async {
                if let Some(cached) = self.sessions.lock().await.get(&self.target_id) {
                    return Ok(cached.clone());
                }
                let result = self
                    .conn
                    .send(
                        "Target.attachToTarget",
                        json!({ "targetId": self.target_id, "flatten": true }),
                        None,
                    )
                    .await?;
                let session_id = result["sessionId"]
                    .as_str()
                    .map(String::from)
                    .ok_or_else(|| BrowserError::Cdp("attachToTarget returned no sessionId".into()))?;
                self.sessions
                    .lock()
                    .await
                    .insert(self.target_id.clone(), session_id.clone());
                Ok::<_, BrowserError>(session_id)
            })
            .await
            .map_err(|e| self.gone_or(e))?;
        Ok(session_id.as_str())
    }
}

#[async_trait]
impl PageHandle for CdpPage {
    fn id(&self) -> &str {
        &self.target_id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        let session_id = self.session().await?;
        let result = self
            .conn
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": false,
                }),
                Some(session_id),
            )
            .await
            .map_err(|e| self.gone_or(e))?;

        if let Some(exception) = result.get("exceptionDetails") {
            let msg = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("evaluation error");
            return Err(BrowserError::EvaluationFailed(msg.into()));
        }
        Ok(result["result"]["value"].clone())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let result = self
            .conn
            .send(
                "Target.closeTarget",
                json!({ "targetId": self.target_id }),
                None,
            )
            .await
            .map_err(|e| self.gone_or(e))?;
        self.sessions.lock().await.remove(&self.target_id);

        // Newer browsers return an empty object; older ones report `success`
        if result["success"].as_bool() == Some(false) {
            return Err(BrowserError::PageGone {
                target_id: self.target_id.clone(),
            });
        }
        Ok(())
    }
}

/// Resources only a launched browser owns
struct LaunchedProcess {
    child: Child,
    profile_dir: ProfileDir,
}

/// A browser context reached over CDP.
struct CdpContext {
    conn: Arc<CdpConnection>,
    origin: ContextOrigin,
    /// Set for contexts we created; attached sessions use the default context
    context_id: Option<String>,
    sessions: SessionCache,
    process: Mutex<Option<LaunchedProcess>>,
}

impl CdpContext {
    fn owns(&self, info: &Value, foreign: &HashSet<String>) -> bool {
        let context = info["browserContextId"].as_str().unwrap_or_default();
        match &self.context_id {
            Some(ours) => context == ours,
            None => !foreign.contains(context),
        }
    }
}

#[async_trait]
impl BrowserContext for CdpContext {
    fn origin(&self) -> ContextOrigin {
        self.origin
    }

    async fn pages(&self) -> Result<Vec<Arc<dyn PageHandle>>, BrowserError> {
        // Non-default contexts belong to someone else when we're attached
        let foreign: HashSet<String> = if self.context_id.is_none() {
            let result = self
                .conn
                .send("Target.getBrowserContexts", json!({}), None)
                .await?;
            result["browserContextIds"]
                .as_array()
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        } else {
            HashSet::new()
        };

        let result = self.conn.send("Target.getTargets", json!({}), None).await?;
        let infos = result["targetInfos"].as_array().cloned().unwrap_or_default();

        let live: HashSet<String> = infos
            .iter()
            .filter_map(|info| info["targetId"].as_str())
            .map(String::from)
            .collect();
        retain_live(&mut *self.sessions.lock().await, &live);

        let mut pages: Vec<Arc<dyn PageHandle>> = Vec::new();
        for info in infos {
            if info["type"].as_str() != Some("page") || !self.owns(&info, &foreign) {
                continue;
            }
            let Some(target_id) = info["targetId"].as_str() else {
                continue;
            };
            pages.push(Arc::new(CdpPage {
                conn: Arc::clone(&self.conn),
                target_id: target_id.to_string(),
                title: info["title"].as_str().unwrap_or_default().to_string(),
                url: info["url"].as_str().unwrap_or_default().to_string(),
                sessions: Arc::clone(&self.sessions),
                session_id: OnceCell::new(),
            }));
        }
        Ok(pages)
    }

    async fn close(&self) -> Result<(), BrowserError> {
        // Attached: the browser is the user's, leave it running
        let Some(context_id) = &self.context_id else {
            return Ok(());
        };

        let disposed = self
            .conn
            .send(
                "Target.disposeBrowserContext",
                json!({ "browserContextId": context_id }),
                None,
            )
            .await;
        // The socket drops as the browser exits, so the reply may never arrive
        let _ = self.conn.send("Browser.close", json!({}), None).await;
        disposed.map(|_| ())
    }

    async fn disconnect(&self) -> Result<(), BrowserError> {
        // Leave no debugger sessions behind in a browser we don't own
        let sessions: Vec<String> = self.sessions.lock().await.drain().map(|(_, id)| id).collect();
        if self.context_id.is_none() {
            for session_id in sessions {
                let detach = self.conn.send(
                    "Target.detachFromTarget",
                    json!({ "sessionId": session_id }),
                    None,
                );
                if let Ok(Err(e)) = tokio::time::timeout(CONNECT_TIMEOUT, detach).await {
                    tracing::debug!(%session_id, error = %e, "detach failed");
                }
            }
        }
        self.conn.shutdown();

        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };

        // The profile directory goes when `process` drops
        if let Ok(Some(_)) = process.child.try_wait() {
            return Ok(());
        }
        process
            .child
            .kill()
            .await
            .map_err(|e| BrowserError::Cdp(format!("kill browser: {e}")))
    }
}

/// Driver that attaches to or launches Chromium-family browsers over CDP.
#[derive(Debug, Default, Clone)]
pub struct CdpDriver;

impl CdpDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserDriver for CdpDriver {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn BrowserContext>, BrowserError> {
        let ws_url = chrome::browser_ws_url(endpoint, CONNECT_TIMEOUT).await?;
        let conn = CdpConnection::connect(&ws_url).await?;

        Ok(Box::new(CdpContext {
            conn: Arc::new(conn),
            origin: ContextOrigin::Existing,
            context_id: None,
            sessions: SessionCache::default(),
            process: Mutex::new(None),
        }))
    }

    async fn launch(&self, headless: bool) -> Result<Box<dyn BrowserContext>, BrowserError> {
        let chrome_path = chrome::find_chrome().ok_or(BrowserError::ChromeNotFound)?;
        tracing::debug!(path = %chrome_path.display(), headless, "launching browser");

        // Dropping `launched` kills the process and removes its profile
        let launched = chrome::launch(&chrome_path, headless).await?;
        let conn = CdpConnection::connect(&launched.ws_url).await?;

        let created = conn
            .send("Target.createBrowserContext", json!({}), None)
            .await;
        let context_id = match created {
            Ok(result) => result["browserContextId"].as_str().map(String::from),
            Err(e) => {
                conn.shutdown();
                return Err(e);
            }
        };
        let Some(context_id) = context_id else {
            conn.shutdown();
            return Err(BrowserError::Cdp(
                "createBrowserContext returned no browserContextId".into(),
            ));
        };

        Ok(Box::new(CdpContext {
            conn: Arc::new(conn),
            origin: ContextOrigin::Launched,
            context_id: Some(context_id),
            sessions: SessionCache::default(),
            process: Mutex::new(Some(LaunchedProcess {
                child: launched.child,
                profile_dir: launched.profile_dir,
            })),
        }))
    }
}
