use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::config::RunConfig;
use crate::credential::CredentialSource;
use crate::executor::RequestExecutor;
use crate::metrics::{Metrics, ScenarioSnapshot};
use crate::plan::SchedulingPlan;
use crate::scheduler::{AbortHandle, RunStats, Scheduler};
use crate::setup;
use crate::threshold::Verdict;

/// A resolved configuration and the tag its iterations are recorded under.
#[derive(Debug, Clone)]
pub struct NamedRun {
    pub name: String,
    pub config: RunConfig,
}

impl NamedRun {
    pub fn new(name: impl Into<String>, config: RunConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Tagged `<mode>/<scenario>`, as a single-scenario run is.
    pub fn single(config: RunConfig) -> Self {
        Self {
            name: config.metric_tag(),
            config,
        }
    }
}

/// What one scenario of a run did.
#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    /// Tag the thresholds were evaluated against
    pub tag: String,
    pub test_id: String,
    pub plan: SchedulingPlan,
    pub credential_source: Option<CredentialSource>,
    pub preflight_status: Option<u16>,
    pub stats: RunStats,
}

/// Everything known about a finished run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub scenarios: Vec<ScenarioReport>,
    pub snapshots: Vec<ScenarioSnapshot>,
    pub verdict: Verdict,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }

    pub fn scenario(&self, tag: &str) -> Option<&ScenarioReport> {
        self.scenarios.iter().find(|s| s.tag == tag)
    }

    pub async fn export(&self, path: &Path) -> Result<()> {
        let json = sonic_rs::to_string_pretty(self).context("Failed to encode run summary")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write run summary to {}", path.display()))?;
        info!("Summary written to {}", path.display());
        Ok(())
    }
}

/// A scenario after setup, ready to be scheduled.
struct Staged {
    tag: String,
    config: RunConfig,
    scheduler: Scheduler,
    executor: Arc<RequestExecutor>,
    credential_source: Option<CredentialSource>,
    preflight_status: Option<u16>,
}

impl Staged {
    async fn prepare(run: NamedRun, metrics: &Metrics, abort: &AbortHandle) -> Result<Self> {
        let NamedRun { name: tag, config } = run;
        let plan = SchedulingPlan::from_config(&config)
            .with_context(|| format!("Failed to build scheduling plan for {tag}"))?;
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let prepared = setup::prepare(&http, &config, metrics, abort).await?;
        let series = metrics
            .series(&tag)
            .await
            .context("Failed to create run metrics")?;
        let executor = Arc::new(RequestExecutor::new(
            http,
            Arc::new(prepared.template),
            series,
            config.think_time,
        ));

        let graceful_stop = config.effective_graceful_stop();
        if graceful_stop > config.graceful_stop {
            info!(
                "[{tag}] Graceful stop raised from {:?} to {graceful_stop:?} to cover the request timeout",
                config.graceful_stop
            );
        }
        let scheduler = Scheduler::new(plan, graceful_stop, config.max_duration);

        Ok(Self {
            tag,
            config,
            scheduler,
            executor,
            credential_source: prepared.credential_source,
            preflight_status: prepared.preflight_status,
        })
    }

    async fn execute(self, abort: &AbortHandle) -> ScenarioReport {
        let plan = self.scheduler.plan();
        info!(
            "[{}] Starting {} run: {} stages over {:?}",
            self.tag,
            plan.model_name(),
            plan.profile().stages.len(),
            plan.total_duration()
        );
        let stats = self.scheduler.run(self.executor, abort).await;
        info!(
            "[{}] Run finished ({:?}): {} iterations started, {} completed, {} dropped, {} interrupted",
            self.tag,
            stats.stop_reason,
            stats.iterations_started,
            stats.iterations_completed,
            stats.dropped_iterations,
            stats.interrupted_iterations
        );

        ScenarioReport {
            tag: self.tag,
            test_id: self.config.test_id,
            plan: self.scheduler.plan().clone(),
            credential_source: self.credential_source,
            preflight_status: self.preflight_status,
            stats,
        }
    }
}

/// Setup, then the scheduled phase, then threshold evaluation, for a single scenario.
///
/// Configuration problems surface before any request is sent. Per-request failures never make
/// this return an error; they only show up in the report.
pub async fn run(config: RunConfig, abort: AbortHandle) -> Result<RunReport> {
    let export = config.summary_export.clone();
    run_all(vec![NamedRun::single(config)], abort, export.as_deref()).await
}

/// Several named scenarios sharing one metrics registry. Setup runs for each scenario in turn,
/// then all scheduled phases run side by side; each tag is held to its own thresholds.
pub async fn run_all(
    runs: Vec<NamedRun>,
    abort: AbortHandle,
    summary_export: Option<&Path>,
) -> Result<RunReport> {
    if runs.is_empty() {
        bail!("No scenarios to run");
    }
    let mut tags = HashSet::new();
    for run in &runs {
        if !tags.insert(run.name.as_str()) {
            bail!("Scenario {:?} is listed twice", run.name);
        }
    }

    let metrics = Metrics::new();
    let mut staged = Vec::with_capacity(runs.len());
    for run in runs {
        staged.push(Staged::prepare(run, &metrics, &abort).await?);
    }
    let thresholds: Vec<_> = staged
        .iter()
        .map(|s| s.config.thresholds.clone())
        .collect();

    let scenarios = join_all(staged.into_iter().map(|s| s.execute(&abort))).await;

    let snapshots = metrics.snapshots().await;
    let mut verdicts = Vec::with_capacity(scenarios.len());
    for (scenario, thresholds) in scenarios.iter().zip(&thresholds) {
        let verdict = Verdict::evaluate(
            &scenario.tag,
            thresholds,
            &snapshots,
            scenario.stats.iterations_started,
        )
        .context("Failed to evaluate thresholds")?;
        verdicts.push(verdict);
    }

    let report = RunReport {
        scenarios,
        snapshots,
        verdict: Verdict::merge(verdicts),
    };

    if let Some(path) = summary_export {
        report.export(path).await?;
    }
    Ok(report)
}
