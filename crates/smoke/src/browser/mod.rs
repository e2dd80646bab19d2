//! Headless browser session
//!
//! [`BrowserSession`] owns one driver and one page for the whole run. The
//! driver itself is behind [`PageDriver`] so the run can be exercised without
//! a real browser.

pub mod playwright;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{SmokeError, SmokeResult};
use crate::matcher::Matcher;

pub use playwright::PlaywrightLauncher;

/// Headroom over a step timeout before the session gives up on the driver
const DRIVER_MARGIN: Duration = Duration::from_secs(5);

/// Bound for click/type, which do not wait for their target
const ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound for screenshots, titles and close
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Browser launch parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub viewport: Viewport,
    pub headless: bool,
    pub slow_mo_ms: u64,
    pub args: Vec<String>,
    /// Bound on the whole launch; a launcher that never answers fails with `Launch`
    pub launch_timeout: Duration,
}

/// When a navigation counts as finished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessCondition {
    #[default]
    Load,
    DomContentLoaded,
    /// No network connections for at least 500 ms
    NetworkIdle,
}

impl ReadinessCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadinessCondition::Load => "load",
            ReadinessCondition::DomContentLoaded => "domcontentloaded",
            ReadinessCondition::NetworkIdle => "networkidle",
        }
    }
}

/// Browser automation primitives for a single page
#[async_trait]
pub trait PageDriver: Send {
    async fn new_page(&mut self) -> SmokeResult<()>;

    async fn navigate(&mut self, url: &str, wait_until: ReadinessCondition, timeout: Duration) -> SmokeResult<()>;

    /// Wait until an element matching `matcher` is visible
    async fn wait_for(&mut self, matcher: &Matcher, timeout: Duration) -> SmokeResult<()>;

    /// Click the first match; fails with `ElementNotFound` if nothing matches right now
    async fn click(&mut self, matcher: &Matcher) -> SmokeResult<()>;

    /// Type into the first match; fails with `ElementNotFound` if nothing matches right now
    async fn type_text(&mut self, matcher: &Matcher, text: &str) -> SmokeResult<()>;

    async fn screenshot(&mut self, path: &Path) -> SmokeResult<()>;

    async fn title(&mut self) -> SmokeResult<String>;

    async fn close(&mut self) -> SmokeResult<()>;
}

/// Starts browser drivers
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> SmokeResult<Box<dyn PageDriver>>;
}

/// One entry in the screenshot log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotRecord {
    /// 1-based capture order
    pub ordinal: usize,
    pub label: String,
    pub path: PathBuf,
    /// sha256 of the file right after capture
    pub sha256: Option<String>,
}

pub struct BrowserSession {
    driver: Box<dyn PageDriver>,
    page_open: bool,
    closed: bool,
    artifact_path: PathBuf,
    screenshots: Vec<ScreenshotRecord>,
}

impl BrowserSession {
    /// Launch a browser; any failure is reported as `Launch`
    pub async fn launch(
        launcher: &dyn SessionLauncher,
        options: &LaunchOptions,
        artifact_path: impl Into<PathBuf>,
    ) -> SmokeResult<Self> {
        info!(
            "Launching browser ({}x{}, headless: {})",
            options.viewport.width, options.viewport.height, options.headless
        );

        let limit = options.launch_timeout;
        let driver = bounded(limit, launcher.launch(options), || {
            SmokeError::Launch(format!("timed out launching browser after {:?}", limit))
        })
        .await
        .map_err(|e| match e {
            SmokeError::Launch(_) => e,
            other => SmokeError::Launch(other.to_string()),
        })?;

        Ok(Self {
            driver,
            page_open: false,
            closed: false,
            artifact_path: artifact_path.into(),
            screenshots: Vec::new(),
        })
    }

    /// Open the run's page; later calls reuse it
    pub async fn open_page(&mut self) -> SmokeResult<()> {
        if self.closed {
            return Err(SmokeError::SessionClosed);
        }
        if self.page_open {
            return Ok(());
        }

        bounded(HOUSEKEEPING_TIMEOUT, self.driver.new_page(), || {
            SmokeError::Driver("timed out opening a page".to_string())
        })
        .await?;
        self.page_open = true;
        Ok(())
    }

    pub async fn navigate(&mut self, url: &str, wait_until: ReadinessCondition, limit: Duration) -> SmokeResult<()> {
        self.ensure_page()?;
        info!("Navigating to {}", url);

        let timeout_ms = limit.as_millis() as u64;
        bounded(limit + DRIVER_MARGIN, self.driver.navigate(url, wait_until, limit), || {
            SmokeError::NavigationTimeout { url: url.to_string(), timeout_ms }
        })
        .await
    }

    /// Wait until `matcher` shows up on the page
    pub async fn wait_for_marker(&mut self, matcher: &Matcher, limit: Duration) -> SmokeResult<()> {
        self.ensure_page()?;
        debug!("Waiting up to {:?} for {}", limit, matcher);

        bounded(limit + DRIVER_MARGIN, self.driver.wait_for(matcher, limit), || {
            SmokeError::not_found(matcher, format!("not visible within {} ms", limit.as_millis()))
        })
        .await
    }

    pub async fn click(&mut self, matcher: &Matcher) -> SmokeResult<()> {
        self.ensure_page()?;
        debug!("Clicking {}", matcher);

        bounded(ACTION_TIMEOUT, self.driver.click(matcher), || {
            SmokeError::not_found(matcher, "click did not complete")
        })
        .await
    }

    pub async fn type_text(&mut self, matcher: &Matcher, text: &str) -> SmokeResult<()> {
        self.ensure_page()?;
        debug!("Typing {} chars into {}", text.chars().count(), matcher);

        bounded(ACTION_TIMEOUT, self.driver.type_text(matcher, text), || {
            SmokeError::not_found(matcher, "typing did not complete")
        })
        .await
    }

    /// Capture the page to the artifact path, replacing the previous capture
    pub async fn screenshot(&mut self, label: &str) -> SmokeResult<&ScreenshotRecord> {
        self.ensure_page()?;

        if let Some(parent) = self.artifact_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let path = self.artifact_path.clone();
        bounded(HOUSEKEEPING_TIMEOUT, self.driver.screenshot(&path), || {
            SmokeError::Driver(format!("timed out capturing screenshot '{}'", label))
        })
        .await?;

        let sha256 = match tokio::fs::read(&path).await {
            Ok(data) => Some(hex::encode(Sha256::digest(&data))),
            Err(e) => {
                warn!("Screenshot '{}' was not written to {}: {}", label, path.display(), e);
                None
            }
        };

        let record = ScreenshotRecord {
            ordinal: self.screenshots.len() + 1,
            label: label.to_string(),
            path,
            sha256,
        };
        debug!("Screenshot #{} '{}' -> {}", record.ordinal, record.label, record.path.display());
        self.screenshots.push(record);

        Ok(&self.screenshots[self.screenshots.len() - 1])
    }

    pub async fn title(&mut self) -> SmokeResult<String> {
        self.ensure_page()?;
        bounded(HOUSEKEEPING_TIMEOUT, self.driver.title(), || {
            SmokeError::Driver("timed out reading page title".to_string())
        })
        .await
    }

    /// Close the browser. Closing twice is a no-op.
    pub async fn close(&mut self) -> SmokeResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.page_open = false;

        info!("Closing browser");
        bounded(HOUSEKEEPING_TIMEOUT, self.driver.close(), || {
            SmokeError::Driver("timed out closing the browser".to_string())
        })
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn screenshots(&self) -> &[ScreenshotRecord] {
        &self.screenshots
    }

    fn ensure_page(&self) -> SmokeResult<()> {
        if self.closed {
            return Err(SmokeError::SessionClosed);
        }
        if !self.page_open {
            return Err(SmokeError::Driver("no page open".to_string()));
        }
        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Browser session dropped without close()");
        }
    }
}

async fn bounded<T, F>(limit: Duration, fut: F, on_elapsed: impl FnOnce() -> SmokeError) -> SmokeResult<T>
where
    F: std::future::Future<Output = SmokeResult<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_elapsed()),
    }
}
