//! ATLAS CLI — thin launcher: wait for the target to become reachable,
//! load configuration from the environment, run one session, write the
//! trace, and exit.

#![allow(clippy::print_stdout)]

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use atlas::llm::{CortexOracle, OpenAiOracle, StubOracle};
use atlas::{run_once, AtlasConfig};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Run a single ATLAS reconnaissance session against an allowlisted target.
#[derive(Parser)]
#[command(name = "atlas")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory the trace artifact is written under.
    #[arg(long, default_value = "traces")]
    traces_dir: std::path::PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("atlas={level},atlas_cli={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .init();
}

async fn run(cli: Cli) -> atlas::Result<()> {
    let config = AtlasConfig::from_env()?;

    wait_for_target(&config).await;

    let oracle: Arc<dyn CortexOracle> = match &config.openai_api_key {
        Some(key) => Arc::new(OpenAiOracle::new(key.clone(), "gpt-4o-mini")),
        None => {
            tracing::warn!("OPENAI_API_KEY not set; Cortex will terminate after one hop");
            Arc::new(StubOracle)
        }
    };

    let report = run_once(&config, oracle).await?;
    let path = atlas::trace::write_trace(&report, &cli.traces_dir)?;

    println!("trace written to {}", path.display());
    Ok(())
}

/// Poll the target until it responds or `WAIT_FOR_TARGET_MS` elapses.
/// Readiness failures are logged, never fatal — `run_once` will simply
/// observe transport errors on its first dispatch if the target never
/// comes up.
async fn wait_for_target(config: &AtlasConfig) {
    if config.wait_for_target_ms == 0 {
        return;
    }

    let client = reqwest::Client::new();
    let deadline = std::time::Instant::now() + Duration::from_millis(config.wait_for_target_ms);
    let interval = Duration::from_millis(config.wait_for_target_interval_ms);

    while std::time::Instant::now() < deadline {
        if client.get(config.target_url.clone()).send().await.is_ok() {
            tracing::info!(target = %config.target_url, "target is reachable");
            return;
        }
        tokio::time::sleep(interval).await;
    }

    tracing::warn!(target = %config.target_url, "target did not become reachable before the wait window elapsed");
}
