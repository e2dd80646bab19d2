//! Test run orchestration: server, browser, interrupt check and teardown

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserSession, PlaywrightLauncher, ScreenshotRecord, SessionLauncher};
use crate::config::HarnessConfig;
use crate::detector::{InterruptDetector, TestVerdict};
use crate::error::{SmokeError, SmokeResult};
use crate::process::{log_sink, ManagedProcess, OutputSink, ProcessState};
use crate::readiness;
use crate::shutdown::{Shutdown, ShutdownReason};
use crate::spec::{InteractionStep, Scenario};
use crate::terminator::{platform_terminator, ProcessTerminator};

/// Stages of a run, in the order they are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    ProcessStarted,
    /// Readiness probe finished (or gave up)
    Ready,
    SessionLaunched,
    /// First navigation done
    Navigated,
    /// Running the step at this index
    Interacting(usize),
    AwaitingInterrupt,
    VerdictReached,
    Teardown,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(TestVerdict),
    /// Stopped by a termination signal
    Cancelled(ShutdownReason),
    /// The run panicked
    Crashed(String),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(verdict) => verdict.exit_code(),
            RunOutcome::Cancelled(_) => 0,
            RunOutcome::Crashed(_) => 1,
        }
    }
}

/// Everything known about a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub scenario: String,
    pub outcome: RunOutcome,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub states: Vec<RunState>,
    pub screenshots: Vec<ScreenshotRecord>,
    pub process_state: ProcessState,
    /// True once the browser has been closed, or when none was launched
    pub session_closed: bool,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Write the report as pretty JSON
    pub fn write(&self, path: &Path) -> SmokeResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;

        info!("Results written to: {}", path.display());
        Ok(())
    }

    fn log_summary(&self) {
        match &self.outcome {
            RunOutcome::Completed(TestVerdict::Passed) => info!("TEST PASSED ✅"),
            RunOutcome::Completed(TestVerdict::Failed { diagnostic }) => {
                error!("TEST FAILED ❌");
                error!("{}", diagnostic);
            }
            RunOutcome::Cancelled(reason) => info!("Run cancelled by {}", reason),
            RunOutcome::Crashed(message) => error!("Run crashed: {}", message),
        }
        info!(
            "Scenario '{}' finished in {} ms (exit code {})",
            self.scenario, self.duration_ms, self.exit_code
        );
    }
}

/// Resources owned by one run
struct RunContext {
    process: ManagedProcess,
    session: Option<BrowserSession>,
    states: Vec<RunState>,
    torn_down: bool,
}

impl RunContext {
    fn enter(&mut self, state: RunState) {
        info!("Run state: {:?}", state);
        self.states.push(state);
    }

    fn session(&mut self) -> SmokeResult<&mut BrowserSession> {
        self.session.as_mut().ok_or(SmokeError::SessionClosed)
    }
}

/// Orchestrates one smoke test run
pub struct TestRunner {
    config: HarnessConfig,
    scenario: Scenario,
    launcher: Arc<dyn SessionLauncher>,
    terminator: Arc<dyn ProcessTerminator>,
    sink: OutputSink,
    shutdown: Shutdown,
}

impl TestRunner {
    /// Create a runner with the production browser and terminator
    pub fn new(config: HarnessConfig, scenario: Scenario) -> Self {
        let launcher = Arc::new(PlaywrightLauncher::new(config.browser.node_project_dir.clone()));
        Self {
            config,
            scenario,
            launcher,
            terminator: platform_terminator(),
            sink: log_sink(),
            shutdown: Shutdown::new(),
        }
    }

    /// Create a runner for the scenario named in `config`, or the built-in one
    pub fn from_config(config: HarnessConfig) -> SmokeResult<Self> {
        let scenario = match &config.scenario {
            Some(path) => Scenario::from_file(path)?,
            None => Scenario::builtin()?,
        };
        Ok(Self::new(config, scenario))
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn SessionLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn ProcessTerminator>) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn with_output_sink(mut self, sink: OutputSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle for cancelling the run
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Run the scenario. Never fails: every failure ends up in the report.
    pub async fn run(&self) -> RunReport {
        let started_at = Utc::now();
        let start = Instant::now();
        info!("Running scenario '{}'", self.scenario.name);

        let mut ctx = RunContext {
            process: ManagedProcess::new(self.terminator.clone(), self.config.server.grace_period()),
            session: None,
            states: vec![RunState::Init],
            torn_down: false,
        };

        let outcome = {
            let execute = AssertUnwindSafe(self.execute(&mut ctx)).catch_unwind();
            tokio::select! {
                biased;
                reason = self.shutdown.cancelled() => {
                    warn!("Run interrupted by {}", reason);
                    RunOutcome::Cancelled(reason)
                }
                result = execute => match result {
                    Ok(verdict) => RunOutcome::Completed(verdict),
                    Err(panic) => RunOutcome::Crashed(panic_message(panic.as_ref())),
                },
            }
        };

        self.teardown(&mut ctx).await;

        let report = RunReport {
            scenario: self.scenario.name.clone(),
            exit_code: outcome.exit_code(),
            outcome,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            states: ctx.states.clone(),
            screenshots: ctx.session.as_ref().map(|s| s.screenshots().to_vec()).unwrap_or_default(),
            process_state: ctx.process.state(),
            session_closed: ctx.session.as_ref().map_or(true, |s| s.is_closed()),
        };
        report.log_summary();

        if let Some(path) = &self.config.results_path {
            if let Err(e) = report.write(path) {
                warn!("Failed to write results to {}: {}", path.display(), e);
            }
        }

        report
    }

    async fn execute(&self, ctx: &mut RunContext) -> TestVerdict {
        let verdict = match self.drive(ctx).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!("Run failed: {}", e);
                TestVerdict::from_error(&e)
            }
        };
        ctx.enter(RunState::VerdictReached);
        verdict
    }

    async fn drive(&self, ctx: &mut RunContext) -> SmokeResult<TestVerdict> {
        let server = &self.config.server;
        let spec = server.process_spec();
        info!("Starting server: {}", spec.command_line());
        ctx.process.start(&spec, self.sink.clone())?;
        ctx.enter(RunState::ProcessStarted);

        readiness::wait_until_ready(&mut ctx.process, server, &self.config.readiness).await?;
        ctx.enter(RunState::Ready);

        let base_url = server.base_url();
        let target = self.config.ui.target_url(&base_url)?;

        let session = BrowserSession::launch(
            self.launcher.as_ref(),
            &self.config.browser.launch_options(),
            self.config.browser.screenshot_path.clone(),
        )
        .await?;
        ctx.session = Some(session);
        ctx.enter(RunState::SessionLaunched);
        ctx.session()?.open_page().await?;

        let total = self.scenario.steps.len();
        let mut navigated = false;
        for (index, step) in self.scenario.steps.iter().enumerate() {
            if navigated {
                ctx.enter(RunState::Interacting(index));
            }
            info!("Step {}/{}: {}", index + 1, total, step.name());

            run_step(ctx.session()?, step, &target, &base_url).await?;

            if !navigated && matches!(step, InteractionStep::Navigate { .. }) {
                navigated = true;
                ctx.enter(RunState::Navigated);
            }
        }

        ctx.enter(RunState::AwaitingInterrupt);
        let detector = InterruptDetector::new(self.scenario.interrupt.clone());
        Ok(detector.await_interrupt(ctx.session()?).await)
    }

    /// Close the browser, then stop the server. Runs once per context.
    async fn teardown(&self, ctx: &mut RunContext) {
        if ctx.torn_down {
            return;
        }
        ctx.torn_down = true;
        ctx.enter(RunState::Teardown);

        if let Some(session) = ctx.session.as_mut() {
            if let Err(e) = session.close().await {
                warn!("Failed to close browser: {}", e);
            }
        }

        ctx.process.terminate().await;
        ctx.enter(RunState::Done);
    }
}

async fn run_step(session: &mut BrowserSession, step: &InteractionStep, target: &str, base_url: &str) -> SmokeResult<()> {
    match step {
        InteractionStep::Navigate { url, wait_until, timeout_ms } => {
            let url = url.replace("{target}", target).replace("{base_url}", base_url);
            session.navigate(&url, *wait_until, Duration::from_millis(*timeout_ms)).await
        }
        InteractionStep::WaitFor { matcher, timeout_ms } => {
            session.wait_for_marker(matcher, Duration::from_millis(*timeout_ms)).await
        }
        InteractionStep::Click { target } => session.click(target).await,
        InteractionStep::Type { target, text } => session.type_text(target, text).await,
        InteractionStep::Screenshot { label } => {
            let record = session.screenshot(label).await?;
            debug!("Captured screenshot #{} ({})", record.ordinal, record.label);
            Ok(())
        }
        InteractionStep::Sleep { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            Ok(())
        }
        InteractionStep::LogTitle => {
            let title = session.title().await?;
            info!("Page title: {}", title);
            Ok(())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(RunOutcome::Completed(TestVerdict::Passed).exit_code(), 0);
        assert_eq!(RunOutcome::Completed(TestVerdict::interrupt_missing("x")).exit_code(), 1);
        assert_eq!(RunOutcome::Cancelled(ShutdownReason::Interrupt).exit_code(), 0);
        assert_eq!(RunOutcome::Crashed("boom".to_string()).exit_code(), 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_report_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/report.json");
        let report = RunReport {
            scenario: "orchestrator-interrupt".to_string(),
            outcome: RunOutcome::Completed(TestVerdict::Passed),
            exit_code: 0,
            started_at: Utc::now(),
            duration_ms: 12,
            states: vec![RunState::Init, RunState::Interacting(3), RunState::Done],
            screenshots: vec![],
            process_state: ProcessState::Terminated,
            session_closed: true,
        };
        report.write(&path).unwrap();

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["outcome"]["outcome"], "completed");
        assert_eq!(json["outcome"]["detail"]["verdict"], "passed");
        assert_eq!(json["states"][1]["interacting"], 3);
        assert_eq!(json["process_state"], "terminated");
    }
}
