use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use load_harness::config::{self, Config, ExecutorModel, RunConfig};
use load_harness::harness::{self, NamedRun};
use load_harness::metrics::print_summary;
use load_harness::scheduler::AbortHandle;

/// Exit status when the run completed but a threshold was breached.
const EXIT_THRESHOLDS_FAILED: u8 = 99;

fn print_banner(run: &NamedRun) {
    let config: &RunConfig = &run.config;
    info!("════════════════════════════════════════════════════════════");
    info!("                  HTTP LOAD HARNESS");
    info!("════════════════════════════════════════════════════════════");
    info!("Scenario: {}", run.name);
    info!("Test ID: {}", config.test_id);
    info!("Target: {} {:?}", config.base_url, config.paths);
    info!("Workload: {} ({})", config.workload, config.method);
    info!("Mode: {}, scenario: {}", config.mode, config.scenario);
    match config.executor {
        ExecutorModel::Vus => info!(
            "Executor: vus (target {}, ramp {})",
            config.target_vus, config.ramp
        ),
        ExecutorModel::Rps => info!(
            "Executor: rps ({} rps, pool {}..{})",
            config.rps, config.preallocated_vus, config.max_vus
        ),
    }
    info!("Auth: {}", if config.auth.enabled { "bearer" } else { "none" });
    info!("Think time: {:?}", config.think_time);
    let thresholds: Vec<String> = config.thresholds.iter().map(ToString::to_string).collect();
    info!("Thresholds: {}", thresholds.join(", "));
    info!("════════════════════════════════════════════════════════════");
}

/// The single configured scenario, or every entry of the scenario file.
async fn named_runs(base: Config) -> Result<(Vec<NamedRun>, Option<std::path::PathBuf>)> {
    let Some(path) = base.scenario_file.clone() else {
        let config = base.resolve().context("Invalid configuration")?;
        let export = config.summary_export.clone();
        return Ok((vec![NamedRun::single(config)], export));
    };

    let raw = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
    let mut runs = Vec::new();
    for named in config::parse_scenario_file(&raw).context("Invalid scenario file")? {
        let config = named
            .config
            .resolve()
            .with_context(|| format!("Invalid configuration for scenario {}", named.name))?;
        runs.push(NamedRun::new(named.name, config));
    }
    Ok((runs, base.summary_export))
}

async fn run() -> Result<bool> {
    let (runs, export) = named_runs(Config::parse()).await?;
    for run in &runs {
        print_banner(run);
    }

    let abort = AbortHandle::new();
    let on_signal = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping new iterations");
            on_signal.abort();
        }
    });

    let report = harness::run_all(runs, abort, export.as_deref()).await?;

    print_summary(&report.snapshots);
    report.verdict.log();

    info!("════════════════════════════════════════════════════════════");
    if report.passed() {
        info!("                    RUN PASSED");
    } else {
        info!("                    RUN FAILED");
    }
    info!("════════════════════════════════════════════════════════════");

    Ok(report.passed())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_THRESHOLDS_FAILED),
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
