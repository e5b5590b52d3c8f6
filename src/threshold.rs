//! Pass/fail criteria evaluated against the run's aggregated metrics.
//!
//! Expressions follow the `<metric><op><bound>` shape:
//!
//! | metric     | observes                                     |
//! |------------|----------------------------------------------|
//! | `p(N)`     | latency at percentile N, in milliseconds     |
//! | `avg`      | mean latency, in milliseconds                |
//! | `max`      | maximum latency, in milliseconds             |
//! | `count`    | number of rate-limited responses             |
//! | `rate`     | error rate, a fraction between 0 and 1       |
//!
//! The operator is `<` or `<=`.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Mode, Workload};
use crate::error::{ConfigError, MetricsError};
use crate::metrics::ScenarioSnapshot;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdMetric {
    Percentile(f64),
    AvgLatency,
    MaxLatency,
    RejectedCount,
    ErrorRate,
}

impl fmt::Display for ThresholdMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdMetric::Percentile(p) => write!(f, "p({p})"),
            ThresholdMetric::AvgLatency => write!(f, "avg"),
            ThresholdMetric::MaxLatency => write!(f, "max"),
            ThresholdMetric::RejectedCount => write!(f, "count"),
            ThresholdMetric::ErrorRate => write!(f, "rate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub metric: ThresholdMetric,
    pub bound: f64,
    /// `<=` rather than `<`
    pub inclusive: bool,
}

impl Threshold {
    const fn strict(metric: ThresholdMetric, bound: f64) -> Self {
        Self {
            metric,
            bound,
            inclusive: false,
        }
    }

    /// Criteria used when none are configured.
    pub fn defaults(mode: Mode, workload: Workload) -> Vec<Threshold> {
        let mut thresholds = match mode {
            Mode::Load => vec![
                Threshold::strict(ThresholdMetric::Percentile(95.0), 500.0),
                Threshold::strict(ThresholdMetric::ErrorRate, 0.02),
            ],
            Mode::Stress => vec![
                Threshold::strict(ThresholdMetric::Percentile(95.0), 1000.0),
                Threshold::strict(ThresholdMetric::ErrorRate, 0.05),
            ],
        };
        if workload == Workload::RateLimit {
            thresholds.push(Threshold::strict(ThresholdMetric::RejectedCount, 1000.0));
        }
        thresholds
    }

    /// The value this threshold compares against its bound.
    pub fn observe(&self, snapshot: &ScenarioSnapshot) -> f64 {
        match self.metric {
            ThresholdMetric::Percentile(p) => snapshot.percentile_ms(p),
            ThresholdMetric::AvgLatency => snapshot.latency.mean_ms,
            ThresholdMetric::MaxLatency => snapshot.latency.max_ms,
            ThresholdMetric::RejectedCount => snapshot.counts.rejected as f64,
            ThresholdMetric::ErrorRate => snapshot.error_rate,
        }
    }

    pub fn holds_for(&self, observed: f64) -> bool {
        if self.inclusive {
            observed <= self.bound
        } else {
            observed < self.bound
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.inclusive { "<=" } else { "<" };
        write!(f, "{}{op}{}", self.metric, self.bound)
    }
}

impl Serialize for Threshold {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn invalid(expr: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidThreshold {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

impl FromStr for Threshold {
    type Err = ConfigError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
        let Some((metric, rest)) = compact.split_once('<') else {
            return Err(invalid(expr, "expected `<` or `<=`"));
        };
        let (inclusive, bound) = match rest.strip_prefix('=') {
            Some(bound) => (true, bound),
            None => (false, rest),
        };

        let bound: f64 = bound
            .parse()
            .map_err(|_| invalid(expr, format!("bound {bound:?} is not a number")))?;
        if !bound.is_finite() || bound < 0.0 {
            return Err(invalid(expr, "bound must be a non-negative number"));
        }

        let metric = match metric.to_ascii_lowercase().as_str() {
            "avg" => ThresholdMetric::AvgLatency,
            "max" => ThresholdMetric::MaxLatency,
            "count" => ThresholdMetric::RejectedCount,
            "rate" => ThresholdMetric::ErrorRate,
            other => {
                let percentile = other
                    .strip_prefix("p(")
                    .and_then(|p| p.strip_suffix(')'))
                    .ok_or_else(|| invalid(expr, format!("unknown metric {metric:?}")))?;
                let percentile: f64 = percentile
                    .parse()
                    .map_err(|_| invalid(expr, "percentile is not a number"))?;
                if !(percentile > 0.0 && percentile <= 100.0) {
                    return Err(invalid(expr, "percentile must be in (0, 100]"));
                }
                ThresholdMetric::Percentile(percentile)
            }
        };

        Ok(Threshold {
            metric,
            bound,
            inclusive,
        })
    }
}

// =============================================================================
// Verdict
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdOutcome {
    pub tag: String,
    pub threshold: Threshold,
    pub observed: f64,
    pub passed: bool,
}

/// Result of checking every threshold. A tag that recorded nothing passes only if it never
/// started an iteration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Verdict {
    pub outcomes: Vec<ThresholdOutcome>,
}

impl Verdict {
    /// Check `thresholds` against the snapshot for `tag`, if one exists. `started` is the number
    /// of iterations the scheduler launched under that tag.
    pub fn evaluate(
        tag: &str,
        thresholds: &[Threshold],
        snapshots: &[ScenarioSnapshot],
        started: u64,
    ) -> Result<Self, MetricsError> {
        let empty;
        let snapshot = match snapshots.iter().find(|s| s.tag == tag) {
            Some(snapshot) => snapshot,
            None => {
                empty = ScenarioSnapshot::empty(tag)?;
                &empty
            }
        };

        if snapshot.total == 0 && started > 0 {
            warn!("[{tag}] {started} iterations started but none was classified");
        }
        let outcomes = thresholds
            .iter()
            .map(|threshold| {
                let observed = threshold.observe(snapshot);
                let passed = match snapshot.total {
                    0 => started == 0,
                    _ => threshold.holds_for(observed),
                };
                ThresholdOutcome {
                    tag: tag.to_string(),
                    threshold: *threshold,
                    observed,
                    passed,
                }
            })
            .collect();
        Ok(Self { outcomes })
    }

    /// Outcomes of several tags in one verdict.
    pub fn merge(verdicts: impl IntoIterator<Item = Verdict>) -> Self {
        Self {
            outcomes: verdicts.into_iter().flat_map(|v| v.outcomes).collect(),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn log(&self) {
        for outcome in &self.outcomes {
            if outcome.passed {
                info!(
                    "✓ [{}] {} (observed {:.4})",
                    outcome.tag, outcome.threshold, outcome.observed
                );
            } else {
                warn!(
                    "✗ [{}] {} (observed {:.4})",
                    outcome.tag, outcome.threshold, outcome.observed
                );
            }
        }
    }
}
