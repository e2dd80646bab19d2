//! Playwright page driver
//!
//! Runs one long-lived `node` process with `driver.js` and talks to it over
//! stdin/stdout, one JSON object per line. Node resolves `playwright` from
//! `node_project_dir`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{LaunchOptions, PageDriver, ReadinessCondition, SessionLauncher};
use crate::error::{SmokeError, SmokeResult};
use crate::matcher::Matcher;

const DRIVER_SCRIPT: &str = include_str!("driver.js");

/// Per-call timeout handed to Playwright for click/type
const ACTION_TIMEOUT_MS: u64 = 5_000;

/// How long `npx playwright --version` may take
const INSTALL_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Limit for the graceful `close` request
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for node to exit after stdin is closed.
/// `CLOSE_TIMEOUT + EXIT_TIMEOUT` stays below the session's housekeeping bound.
const EXIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Launches `node driver.js` sessions
#[derive(Debug, Clone)]
pub struct PlaywrightLauncher {
    node_project_dir: PathBuf,
    node_binary: String,
}

impl PlaywrightLauncher {
    pub fn new(node_project_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_project_dir: node_project_dir.into(),
            node_binary: "node".to_string(),
        }
    }

    /// Use a different node executable
    pub fn with_node_binary(mut self, node_binary: impl Into<String>) -> Self {
        self.node_binary = node_binary.into();
        self
    }

    /// Check if Playwright is installed, without letting npx fetch it
    async fn check_playwright_installed(&self) -> SmokeResult<()> {
        let status = Command::new("npx")
            .args(["--no-install", "playwright", "--version"])
            .current_dir(&self.node_project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(INSTALL_CHECK_TIMEOUT, status).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(SmokeError::Launch(format!(
                "`npx playwright --version` exited with {} in {}",
                status,
                self.node_project_dir.display()
            ))),
            Ok(Err(e)) => Err(SmokeError::Launch(format!("npx not available: {}", e))),
            Err(_) => Err(SmokeError::Launch(format!(
                "`npx playwright --version` did not finish within {:?}",
                INSTALL_CHECK_TIMEOUT
            ))),
        }
    }
}

#[async_trait]
impl SessionLauncher for PlaywrightLauncher {
    async fn launch(&self, options: &LaunchOptions) -> SmokeResult<Box<dyn PageDriver>> {
        self.check_playwright_installed().await?;

        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("driver.js");
        tokio::fs::write(&script_path, DRIVER_SCRIPT).await?;

        debug!("Starting Playwright driver: {}", script_path.display());

        let mut child = Command::new(&self.node_binary)
            .arg(&script_path)
            .current_dir(&self.node_project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SmokeError::Launch(format!("failed to start {}: {}", self.node_binary, e)))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SmokeError::Launch("driver stdout not captured".to_string()))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("playwright: {}", line);
                }
            })
        });

        let mut driver = PlaywrightDriver {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
            stderr_task,
            _script_dir: script_dir,
        };

        let launch = json!({
            "headless": options.headless,
            "slow_mo_ms": options.slow_mo_ms,
            "args": options.args,
            "viewport": { "width": options.viewport.width, "height": options.viewport.height },
        });

        match driver.call("launch", launch).await {
            Ok(Ok(_)) => {
                info!("Browser launched");
                Ok(Box::new(driver))
            }
            Ok(Err(failure)) => Err(SmokeError::Launch(failure.message)),
            Err(e) => Err(SmokeError::Launch(e.to_string())),
        }
    }
}

/// Error reported by the driver for a single call
#[derive(Debug, Clone, Default, Deserialize)]
struct DriverFailure {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

impl DriverFailure {
    fn is_timeout(&self) -> bool {
        self.kind == "timeout"
    }

    fn is_not_found(&self) -> bool {
        self.kind == "not_found"
    }
}

#[derive(Debug, Deserialize)]
struct DriverResponse {
    id: u64,
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<DriverFailure>,
}

pub struct PlaywrightDriver {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    stderr_task: Option<JoinHandle<()>>,
    _script_dir: TempDir,
}

impl PlaywrightDriver {
    /// Send one request. The outer result is transport, the inner one is the driver's answer.
    async fn call(&mut self, op: &str, mut payload: Value) -> SmokeResult<Result<Value, DriverFailure>> {
        self.next_id += 1;
        let id = self.next_id;
        payload["id"] = json!(id);
        payload["op"] = json!(op);

        let stdin = self.stdin.as_mut().ok_or(SmokeError::SessionClosed)?;
        let mut line = serde_json::to_string(&payload)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Err(SmokeError::Driver(format!("driver exited during '{}'", op)));
            };

            let response: DriverResponse = match serde_json::from_str(&line) {
                Ok(response) => response,
                Err(_) => {
                    debug!("playwright: {}", line);
                    continue;
                }
            };

            // answers to calls abandoned after a timeout
            if response.id != id {
                debug!("Discarding stale driver response #{}", response.id);
                continue;
            }

            return Ok(if response.ok {
                Ok(response.value)
            } else {
                Err(response.error.unwrap_or_default())
            });
        }
    }

    async fn call_ok(&mut self, op: &str, payload: Value) -> SmokeResult<Value> {
        self.call(op, payload)
            .await?
            .map_err(|failure| SmokeError::Driver(format!("{} failed: {}", op, failure.message)))
    }

    /// Call an op whose target element may be missing
    async fn call_on_element(&mut self, op: &str, matcher: &Matcher, payload: Value) -> SmokeResult<()> {
        match self.call(op, payload).await? {
            Ok(_) => Ok(()),
            Err(failure) if failure.is_not_found() || failure.is_timeout() => {
                Err(SmokeError::not_found(matcher, failure.message))
            }
            Err(failure) => Err(SmokeError::Driver(format!("{} failed: {}", op, failure.message))),
        }
    }

    /// Close stdin so the driver exits, and kill it if it does not
    async fn shutdown_child(&mut self) {
        self.stdin.take();

        match tokio::time::timeout(EXIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Playwright driver exited with {}", status),
            Ok(Err(e)) => {
                warn!("Failed to wait for Playwright driver: {}", e);
                let _ = self.child.start_kill();
            }
            Err(_) => {
                warn!("Playwright driver did not exit, killing it");
                let _ = self.child.start_kill();
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

fn matcher_json(matcher: &Matcher) -> Value {
    match matcher {
        Matcher::Css(selector) => json!({ "kind": "css", "selector": selector }),
        Matcher::Text(text) => json!({ "kind": "text", "text": text }),
        Matcher::TextWithin { selector, text } => {
            json!({ "kind": "text_within", "selector": selector, "text": text })
        }
    }
}

#[async_trait]
impl PageDriver for PlaywrightDriver {
    async fn new_page(&mut self) -> SmokeResult<()> {
        self.call_ok("new_page", json!({})).await.map(|_| ())
    }

    async fn navigate(&mut self, url: &str, wait_until: ReadinessCondition, timeout: Duration) -> SmokeResult<()> {
        let timeout_ms = timeout.as_millis() as u64;
        let payload = json!({ "url": url, "wait_until": wait_until.as_str(), "timeout_ms": timeout_ms });

        match self.call("navigate", payload).await? {
            Ok(_) => Ok(()),
            Err(failure) if failure.is_timeout() => Err(SmokeError::NavigationTimeout {
                url: url.to_string(),
                timeout_ms,
            }),
            Err(failure) => Err(SmokeError::Driver(format!("navigation to {} failed: {}", url, failure.message))),
        }
    }

    async fn wait_for(&mut self, matcher: &Matcher, timeout: Duration) -> SmokeResult<()> {
        let payload = json!({ "matcher": matcher_json(matcher), "timeout_ms": timeout.as_millis() as u64 });
        self.call_on_element("wait_for", matcher, payload).await
    }

    async fn click(&mut self, matcher: &Matcher) -> SmokeResult<()> {
        let payload = json!({ "matcher": matcher_json(matcher), "timeout_ms": ACTION_TIMEOUT_MS });
        self.call_on_element("click", matcher, payload).await
    }

    async fn type_text(&mut self, matcher: &Matcher, text: &str) -> SmokeResult<()> {
        let payload = json!({ "matcher": matcher_json(matcher), "text": text, "timeout_ms": ACTION_TIMEOUT_MS });
        self.call_on_element("type", matcher, payload).await
    }

    async fn screenshot(&mut self, path: &Path) -> SmokeResult<()> {
        // node runs in the project dir, so hand it an absolute path
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        self.call_ok("screenshot", json!({ "path": path })).await.map(|_| ())
    }

    async fn title(&mut self) -> SmokeResult<String> {
        let value = self.call_ok("title", json!({})).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&mut self) -> SmokeResult<()> {
        let result = if self.stdin.is_some() {
            match tokio::time::timeout(CLOSE_TIMEOUT, self.call_ok("close", json!({}))).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(SmokeError::Driver(format!("close did not finish within {:?}", CLOSE_TIMEOUT))),
            }
        } else {
            Ok(())
        };

        self.shutdown_child().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matcher_json_shapes() {
        assert_eq!(
            matcher_json(&Matcher::css("div[contenteditable=true]")),
            json!({ "kind": "css", "selector": "div[contenteditable=true]" })
        );
        assert_eq!(matcher_json(&Matcher::text("Submit")), json!({ "kind": "text", "text": "Submit" }));
        assert_eq!(
            matcher_json(&Matcher::text_within("button", "Resume")),
            json!({ "kind": "text_within", "selector": "button", "text": "Resume" })
        );
    }

    #[test]
    fn test_driver_response_parsing() {
        let ok: DriverResponse = serde_json::from_str(r#"{"id":3,"ok":true,"value":"Studio"}"#).unwrap();
        assert_eq!(ok.id, 3);
        assert_eq!(ok.value, json!("Studio"));

        let failed: DriverResponse =
            serde_json::from_str(r#"{"id":4,"ok":false,"error":{"kind":"not_found","message":"no element"}}"#)
                .unwrap();
        let failure = failed.error.unwrap();
        assert!(failure.is_not_found());
        assert!(!failure.is_timeout());
    }

    #[test]
    fn test_driver_script_handles_every_op() {
        for op in ["launch", "new_page", "navigate", "wait_for", "click", "type", "screenshot", "title", "close"] {
            assert!(DRIVER_SCRIPT.contains(&format!("async {}(", op)), "driver.js lacks {}", op);
        }
    }

    #[tokio::test]
    async fn test_missing_node_project_fails_launch() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = PlaywrightLauncher::new(dir.path().join("does-not-exist"));
        let options = LaunchOptions {
            viewport: super::super::Viewport { width: 10, height: 10 },
            headless: true,
            slow_mo_ms: 0,
            args: vec![],
            launch_timeout: Duration::from_secs(60),
        };
        let err = launcher.launch(&options).await.err().unwrap();
        assert!(matches!(err, SmokeError::Launch(_)));
    }

    /// A driver whose child never answers and ignores stdin EOF
    #[cfg(unix)]
    fn unresponsive_driver() -> PlaywrightDriver {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().unwrap();

        PlaywrightDriver {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
            stderr_task: None,
            _script_dir: tempfile::tempdir().unwrap(),
        }
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_close_kills_unresponsive_driver() {
        let mut driver = unresponsive_driver();

        let start = tokio::time::Instant::now();
        let err = driver.close().await.unwrap_err();
        assert!(matches!(err, SmokeError::Driver(_)), "{:?}", err);
        assert!(start.elapsed() >= CLOSE_TIMEOUT + EXIT_TIMEOUT);
        assert!(start.elapsed() < Duration::from_secs(15));
        assert!(driver.stdin.is_none());

        // killed, not exited on its own after 30 s
        let status = driver.child.wait().await.unwrap();
        assert_eq!(status.code(), None);
    }
}
