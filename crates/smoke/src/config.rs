//! Harness configuration
//!
//! Every field has a default matching the studio smoke test, so a missing or
//! partial TOML file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::browser::{LaunchOptions, Viewport};
use crate::error::{SmokeError, SmokeResult};
use crate::process::ProcessSpec;

/// Top-level harness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Server under test
    pub server: ServerConfig,

    /// How to decide the server can take requests
    pub readiness: ReadinessConfig,

    /// Headless browser settings
    pub browser: BrowserConfig,

    /// Hosted UI wrapping the loopback URL
    pub ui: UiConfig,

    /// Scenario file (None = built-in orchestrator scenario)
    pub scenario: Option<PathBuf>,

    /// Where to write the JSON run report (None = no report)
    pub results_path: Option<PathBuf>,
}

/// Server process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Executable to launch
    pub program: String,

    /// Arguments passed to the executable
    pub args: Vec<String>,

    /// Working directory for the server
    pub working_dir: PathBuf,

    /// Loopback host the server binds
    pub host: String,

    /// Port the server binds
    pub port: u16,

    /// Time between graceful and forceful termination
    pub grace_period_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: "uv".to_string(),
            args: vec![
                "run".to_string(),
                "--env-file".to_string(),
                ".env".to_string(),
                "--".to_string(),
                "langgraph".to_string(),
                "dev".to_string(),
                "--port".to_string(),
                "8080".to_string(),
                "--no-browser".to_string(),
                "--no-reload".to_string(),
            ],
            working_dir: PathBuf::from("../../../"),
            host: "127.0.0.1".to_string(),
            port: 8080,
            grace_period_ms: 2000,
        }
    }
}

impl ServerConfig {
    /// Loopback URL of the server
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn process_spec(&self) -> ProcessSpec {
        ProcessSpec {
            program: self.program.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            port: Some(self.port),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessStrategy {
    /// Sleep for `settle_ms` and assume the server is up
    Fixed,
    /// Poll until the server port accepts TCP connections
    #[default]
    Port,
    /// Poll until `http_path` answers with a success status
    Http,
}

/// Readiness probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub strategy: ReadinessStrategy,

    /// Settle delay for the fixed strategy
    pub settle_ms: u64,

    /// Give up polling after this long and carry on
    pub max_wait_ms: u64,

    /// Delay between probes
    pub poll_interval_ms: u64,

    /// Path probed by the HTTP strategy
    pub http_path: String,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            strategy: ReadinessStrategy::Port,
            settle_ms: 5000,
            max_wait_ms: 30_000,
            poll_interval_ms: 250,
            http_path: "/ok".to_string(),
        }
    }
}

impl ReadinessConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Browser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub viewport: Viewport,

    /// Delay Playwright inserts between operations
    pub slow_mo_ms: u64,

    /// Extra Chromium arguments
    pub args: Vec<String>,

    /// Upper bound for starting the browser, including the Playwright install check
    pub launch_timeout_ms: u64,

    /// Node project directory that has `playwright` installed
    pub node_project_dir: PathBuf,

    /// The single screenshot artifact, overwritten on every capture
    pub screenshot_path: PathBuf,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport: Viewport { width: 2000, height: 1000 },
            slow_mo_ms: 10,
            args: vec!["--no-sandbox".to_string()],
            launch_timeout_ms: 60_000,
            node_project_dir: PathBuf::from("."),
            screenshot_path: PathBuf::from("langgraph-test-result.png"),
        }
    }
}

impl BrowserConfig {
    pub fn launch_options(&self) -> LaunchOptions {
        let mut args = self.args.clone();
        let window_size = format!("--window-size={},{}", self.viewport.width, self.viewport.height);
        if !args.iter().any(|a| a.starts_with("--window-size=")) {
            args.push(window_size);
        }

        LaunchOptions {
            viewport: self.viewport,
            headless: self.headless,
            slow_mo_ms: self.slow_mo_ms,
            args,
            launch_timeout: Duration::from_millis(self.launch_timeout_ms),
        }
    }
}

/// Hosted UI that takes the loopback URL as a query parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// None = navigate straight to the loopback URL
    pub frontend_url: Option<String>,

    /// Query parameter carrying the loopback URL
    pub base_url_param: String,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            frontend_url: Some("https://smith.langchain.com/studio/".to_string()),
            base_url_param: "baseUrl".to_string(),
        }
    }
}

impl UiConfig {
    /// URL the browser should open for a server at `base_url`
    pub fn target_url(&self, base_url: &str) -> SmokeResult<String> {
        match &self.frontend_url {
            None => Ok(base_url.to_string()),
            Some(frontend) => {
                let url = Url::parse_with_params(frontend, &[(self.base_url_param.as_str(), base_url)])
                    .map_err(|e| SmokeError::Config(format!("invalid frontend url '{}': {}", frontend, e)))?;
                Ok(url.to_string())
            }
        }
    }
}

impl HarnessConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> SmokeResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> SmokeResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Move the server to `port`, keeping a `--port` argument in step
    pub fn set_port(&mut self, port: u16) -> SmokeResult<()> {
        if port == 0 {
            return Err(SmokeError::Config("server.port must be a fixed port".to_string()));
        }

        let old = self.server.port.to_string();
        let mut args = self.server.args.iter_mut().peekable();
        while let Some(arg) = args.next() {
            if arg.as_str() == "--port" {
                if let Some(value) = args.peek_mut() {
                    if value.as_str() == old {
                        **value = port.to_string();
                    }
                }
            }
        }

        self.server.port = port;
        Ok(())
    }

    fn validate(&self) -> SmokeResult<()> {
        if self.server.program.trim().is_empty() {
            return Err(SmokeError::Config("server.program must not be empty".to_string()));
        }
        if self.server.port == 0 {
            return Err(SmokeError::Config("server.port must be a fixed port".to_string()));
        }
        if self.browser.viewport.width == 0 || self.browser.viewport.height == 0 {
            return Err(SmokeError::Config("browser.viewport must be non-empty".to_string()));
        }
        Ok(())
    }
}
