use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command};

use super::error::BrowserError;

#[cfg(target_os = "macos")]
const KNOWN_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
    "/opt/homebrew/bin/chromium",
    "/usr/local/bin/chromium",
];

#[cfg(target_os = "windows")]
const KNOWN_PATHS: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
    r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
];

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const KNOWN_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
];

/// Executable names looked up on `PATH` when no known path matches
const PATH_NAMES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
    "msedge",
];

/// How long a freshly spawned browser gets to open its debug port
const STARTUP_ATTEMPTS: u32 = 50;
const STARTUP_POLL: Duration = Duration::from_millis(100);

/// Find a Chromium-family browser.
///
/// Search order: `CHROME_PATH`, the platform's install locations, then `PATH`.
pub fn find_chrome() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("CHROME_PATH") {
        let path = PathBuf::from(&env_path);
        if is_executable(&path) {
            return Some(path);
        }
        tracing::debug!(path = %env_path, "CHROME_PATH set but not executable, falling through");
    }

    for candidate in KNOWN_PATHS {
        let path = PathBuf::from(candidate);
        if is_executable(&path) {
            tracing::debug!(path = %candidate, "found browser binary");
            return Some(path);
        }
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for name in PATH_NAMES {
            let candidate = dir.join(exe_name(name));
            if is_executable(&candidate) {
                tracing::debug!(path = %candidate.display(), "found browser binary on PATH");
                return Some(candidate);
            }
        }
    }

    None
}

fn exe_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.is_file()
        && path
            .metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// A browser process we started, plus the throwaway profile it runs on.
pub struct LaunchedBrowser {
    pub child: Child,
    pub ws_url: String,
    pub profile_dir: ProfileDir,
}

/// Throwaway `--user-data-dir`, deleted when dropped.
#[derive(Debug)]
pub struct ProfileDir {
    path: PathBuf,
}

impl ProfileDir {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProfileDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    dir = %self.path.display(),
                    error = %e,
                    "failed to remove browser profile"
                );
            }
        }
    }
}

/// Spawn the browser with remote debugging on a free loopback port and
/// wait for its browser-level WebSocket URL.
///
/// On failure the process is killed and its profile directory removed.
pub async fn launch(chrome_path: &Path, headless: bool) -> Result<LaunchedBrowser, BrowserError> {
    let port = free_port()?;
    let profile_dir = ProfileDir::new(
        std::env::temp_dir().join(format!("ram-sentinel-profile-{port}")),
    );

    let mut cmd = Command::new(chrome_path);
    cmd.arg(format!("--remote-debugging-port={port}"))
        .arg(format!("--user-data-dir={}", profile_dir.path().display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-dev-shm-usage");
    if headless {
        cmd.arg("--headless=new").arg("--disable-gpu");
    }
    let mut child = cmd
        .arg("about:blank")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

    let endpoint = format!("http://127.0.0.1:{port}");
    let ws_url = wait_for_ws_url(&endpoint, &mut child).await?;

    Ok(LaunchedBrowser {
        child,
        ws_url,
        profile_dir,
    })
}

fn free_port() -> Result<u16, BrowserError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| BrowserError::LaunchFailed(format!("bind port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| BrowserError::LaunchFailed(format!("local_addr: {e}")))?
        .port();
    Ok(port)
}

async fn wait_for_ws_url(endpoint: &str, child: &mut Child) -> Result<String, BrowserError> {
    for _ in 0..STARTUP_ATTEMPTS {
        tokio::time::sleep(STARTUP_POLL).await;

        if let Some(status) = child
            .try_wait()
            .map_err(|e| BrowserError::LaunchFailed(format!("wait: {e}")))?
        {
            return Err(BrowserError::LaunchFailed(format!(
                "browser exited early with {status}"
            )));
        }

        if let Ok(ws_url) = browser_ws_url(endpoint, STARTUP_POLL * 5).await {
            return Ok(ws_url);
        }
    }

    Err(BrowserError::LaunchFailed(format!(
        "browser did not open {endpoint} within 5 seconds"
    )))
}

/// Query `<endpoint>/json/version` for the browser-level debugger socket.
pub async fn browser_ws_url(endpoint: &str, timeout: Duration) -> Result<String, BrowserError> {
    let url = format!("{}/json/version", endpoint.trim_end_matches('/'));
    let connection_failed = |reason: String| BrowserError::ConnectionFailed {
        endpoint: endpoint.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| connection_failed(e.to_string()))?;
    let version: Value = client
        .get(&url)
        .send()
        .await
        .map_err(|e| connection_failed(e.to_string()))?
        .json()
        .await
        .map_err(|e| connection_failed(e.to_string()))?;

    version["webSocketDebuggerUrl"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| connection_failed("no webSocketDebuggerUrl in /json/version".into()))
}
