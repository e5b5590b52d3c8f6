use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hdrhistogram::Histogram;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::MetricsError;
use crate::executor::{IterationResult, Outcome};

/// Highest latency the histograms track, in microseconds. Slower requests are clamped to it.
const MAX_TRACKED_MICROS: u64 = 3_600_000_000;

// =============================================================================
// Per-tag series
// =============================================================================

/// Counters and latency distribution for one tag. Shared by every client, so all updates are
/// atomic increments or go through the histogram lock.
pub struct ScenarioMetrics {
    tag: String,
    accepted: AtomicU64,
    rejected: AtomicU64,
    server_error: AtomicU64,
    other: AtomicU64,
    transport_errors: AtomicU64,
    latency: Mutex<Histogram<u64>>,
}

impl ScenarioMetrics {
    fn new(tag: &str) -> Result<Self, MetricsError> {
        Ok(Self {
            tag: tag.to_string(),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            server_error: AtomicU64::new(0),
            other: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            latency: Mutex::new(Histogram::new_with_bounds(1, MAX_TRACKED_MICROS, 3)?),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Count one classified response and add its latency to the distribution.
    pub async fn record(&self, result: &IterationResult) {
        let counter = match result.outcome {
            Outcome::Accepted => &self.accepted,
            Outcome::Rejected => &self.rejected,
            Outcome::ServerError => &self.server_error,
            Outcome::Other => &self.other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if result.transport_error {
            self.transport_errors.fetch_add(1, Ordering::Relaxed);
        }

        let micros = u64::try_from(result.elapsed.as_micros()).unwrap_or(u64::MAX);
        self.latency.lock().await.saturating_record(micros);
    }

    /// Count iterations that were cut off before they could classify a response. They land in
    /// `other` with no latency sample.
    pub fn record_interrupted(&self, count: u64) {
        self.other.fetch_add(count, Ordering::Relaxed);
        self.transport_errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
            + self.rejected.load(Ordering::Relaxed)
            + self.server_error.load(Ordering::Relaxed)
            + self.other.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> ScenarioSnapshot {
        let histogram = self.latency.lock().await.clone();
        ScenarioSnapshot::new(
            self.tag.clone(),
            Counts {
                accepted: self.accepted.load(Ordering::Relaxed),
                rejected: self.rejected.load(Ordering::Relaxed),
                server_error: self.server_error.load(Ordering::Relaxed),
                other: self.other.load(Ordering::Relaxed),
                transport_errors: self.transport_errors.load(Ordering::Relaxed),
            },
            histogram,
        )
    }
}

// =============================================================================
// Registry
// =============================================================================

/// All series of a run, keyed by tag. The lock is only taken to look a series up; callers keep
/// the returned handle for the hot path.
#[derive(Default)]
pub struct Metrics {
    series: Mutex<BTreeMap<String, Arc<ScenarioMetrics>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The series for `tag`, created on first use.
    pub async fn series(&self, tag: &str) -> Result<Arc<ScenarioMetrics>, MetricsError> {
        let mut series = self.series.lock().await;
        if let Some(existing) = series.get(tag) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(ScenarioMetrics::new(tag)?);
        series.insert(tag.to_string(), Arc::clone(&created));
        Ok(created)
    }

    pub async fn snapshots(&self) -> Vec<ScenarioSnapshot> {
        let series: Vec<Arc<ScenarioMetrics>> =
            self.series.lock().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(series.len());
        for s in series {
            snapshots.push(s.snapshot().await);
        }
        snapshots
    }
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub accepted: u64,
    pub rejected: u64,
    pub server_error: u64,
    pub other: u64,
    /// Subset of `other` where no complete response was received.
    pub transport_errors: u64,
}

impl Counts {
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected + self.server_error + self.other
    }

    /// Fraction of iterations that failed. Rate-limited responses are expected and do not count.
    pub fn error_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => (self.server_error + self.other) as f64 / total as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time copy of one series, used for the summary and threshold evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSnapshot {
    pub tag: String,
    pub total: u64,
    #[serde(flatten)]
    pub counts: Counts,
    pub error_rate: f64,
    pub latency: LatencySummary,
    #[serde(skip)]
    histogram: Histogram<u64>,
}

fn micros_to_ms(micros: f64) -> f64 {
    micros / 1000.0
}

impl ScenarioSnapshot {
    fn new(tag: String, counts: Counts, histogram: Histogram<u64>) -> Self {
        let latency = if histogram.is_empty() {
            LatencySummary::default()
        } else {
            LatencySummary {
                min_ms: micros_to_ms(histogram.min() as f64),
                mean_ms: micros_to_ms(histogram.mean()),
                p50_ms: micros_to_ms(histogram.value_at_quantile(0.50) as f64),
                p90_ms: micros_to_ms(histogram.value_at_quantile(0.90) as f64),
                p95_ms: micros_to_ms(histogram.value_at_quantile(0.95) as f64),
                p99_ms: micros_to_ms(histogram.value_at_quantile(0.99) as f64),
                max_ms: micros_to_ms(histogram.max() as f64),
            }
        };
        Self {
            tag,
            total: counts.total(),
            counts,
            error_rate: counts.error_rate(),
            latency,
            histogram,
        }
    }

    /// An empty snapshot for a tag that never recorded anything.
    pub fn empty(tag: &str) -> Result<Self, MetricsError> {
        Ok(Self::new(
            tag.to_string(),
            Counts::default(),
            Histogram::new_with_bounds(1, MAX_TRACKED_MICROS, 3)?,
        ))
    }

    /// Latency at `percentile` (0-100) in milliseconds, 0 when nothing was recorded.
    pub fn percentile_ms(&self, percentile: f64) -> f64 {
        if self.histogram.is_empty() {
            return 0.0;
        }
        micros_to_ms(self.histogram.value_at_percentile(percentile) as f64)
    }
}

pub fn print_summary(snapshots: &[ScenarioSnapshot]) {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║                      RUN SUMMARY                           ║");
    info!("╚════════════════════════════════════════════════════════════╝");

    for snapshot in snapshots {
        let counts = &snapshot.counts;
        info!("");
        info!("[{}] Responses:", snapshot.tag);
        info!("  Total:            {}", snapshot.total);
        info!("  Accepted (200):   {}", counts.accepted);
        info!("  Rejected (429):   {}", counts.rejected);
        info!("  Server errors:    {}", counts.server_error);
        info!(
            "  Other:            {} ({} transport errors)",
            counts.other, counts.transport_errors
        );
        info!("  Error rate:       {:.4}", snapshot.error_rate);

        info!("[{}] Latency (ms):", snapshot.tag);
        if snapshot.total > 0 {
            let latency = &snapshot.latency;
            info!("  Min:    {:.2}", latency.min_ms);
            info!("  Mean:   {:.2}", latency.mean_ms);
            info!("  p50:    {:.2}", latency.p50_ms);
            info!("  p90:    {:.2}", latency.p90_ms);
            info!("  p95:    {:.2}", latency.p95_ms);
            info!("  p99:    {:.2}", latency.p99_ms);
            info!("  Max:    {:.2}", latency.max_ms);
        } else {
            info!("  No data");
        }
    }

    info!("");
    info!("═══════════════════════════════════════════════════════════");
}
