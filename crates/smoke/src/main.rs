//! hitl-smoke
//!
//! Runs the human-in-the-loop smoke test and exits with its verdict.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hitl_smoke::{HarnessConfig, SmokeResult, TestRunner};

#[derive(Parser, Debug)]
#[command(name = "hitl-smoke")]
#[command(about = "Smoke test for human-in-the-loop interrupts in the graph dev server")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "HITL_SMOKE_CONFIG", default_value = "hitl-smoke.toml")]
    config: PathBuf,

    /// Scenario file (defaults to the built-in orchestrator scenario)
    #[arg(short, long)]
    scenario: Option<PathBuf>,

    /// Port the dev server listens on
    #[arg(short, long)]
    port: Option<u16>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Open the loopback URL directly instead of the hosted studio
    #[arg(long)]
    no_frontend: bool,

    /// Write a JSON run report here
    #[arg(short, long)]
    results: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if cli.json_logs {
        tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    info!("hitl-smoke v{}", env!("CARGO_PKG_VERSION"));

    let code = match load_config(&cli).and_then(TestRunner::from_config) {
        Ok(runner) => match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt.block_on(async move {
                let _signals = runner.shutdown().listen_for_signals();
                runner.run().await.exit_code()
            }),
            Err(e) => {
                error!("Failed to create tokio runtime: {}", e);
                1
            }
        },
        Err(e) => {
            error!("{}", e);
            1
        }
    };

    std::process::exit(code);
}

fn load_config(cli: &Cli) -> SmokeResult<HarnessConfig> {
    let mut config = HarnessConfig::load(&cli.config)?;

    if let Some(scenario) = &cli.scenario {
        config.scenario = Some(scenario.clone());
    }
    if let Some(port) = cli.port {
        config.set_port(port)?;
    }
    if cli.headed {
        config.browser.headless = false;
    }
    if cli.no_frontend {
        config.ui.frontend_url = None;
    }
    if let Some(results) = &cli.results {
        config.results_path = Some(results.clone());
    }

    Ok(config)
}
