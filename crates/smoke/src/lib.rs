//! Human-in-the-loop smoke test for the graph dev server
//!
//! This crate starts the dev server as a subprocess, drives the studio UI in a
//! headless browser and checks that the graph pauses for human feedback:
//! - Spawns and owns the server process tree
//! - Controls Playwright through a long-lived node driver
//! - Runs a declarative YAML scenario against one page
//! - Waits for the interrupt marker and a resume control
//! - Tears everything down exactly once, on signals and panics too
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TestRunner (orchestrator)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ManagedProcess      start() / terminate() / has_exited()   │
//! │    └── ProcessTerminator   SIGTERM, tree kill, port kill    │
//! │  readiness           fixed | port | http probe              │
//! │  BrowserSession      launch, one page, screenshot log       │
//! │    └── PageDriver          PlaywrightDriver (node, JSONL)   │
//! │  Scenario (YAML)     navigate, wait_for, click, type, ...   │
//! │  InterruptDetector   marker + resume control -> TestVerdict │
//! │  Shutdown            SIGINT/SIGTERM -> CancellationToken    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod browser;
pub mod config;
pub mod detector;
pub mod error;
pub mod matcher;
pub mod process;
pub mod readiness;
pub mod runner;
pub mod shutdown;
pub mod spec;
pub mod terminator;

pub use config::HarnessConfig;
pub use detector::TestVerdict;
pub use error::{SmokeError, SmokeResult};
pub use runner::{RunOutcome, RunReport, RunState, TestRunner};
pub use spec::{InteractionStep, Scenario};
