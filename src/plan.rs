use std::time::Duration;

use serde::Serialize;

use crate::config::{ExecutorModel, Mode, Ramp, RunConfig, StressParams, StressStyle};
use crate::error::ConfigError;

/// One segment of a run: reach `target` (clients or arrivals per time unit) over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScenarioStage {
    pub target: u32,
    #[serde(with = "millis")]
    pub duration: Duration,
}

impl ScenarioStage {
    pub fn new(target: u32, duration: Duration) -> Self {
        Self { target, duration }
    }
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// A stage sequence plus the value it starts from. Stages run strictly in order; they may go up
/// or down.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageProfile {
    pub start: u32,
    pub stages: Vec<ScenarioStage>,
    pub ramp: Ramp,
}

impl StageProfile {
    pub fn new(start: u32, stages: Vec<ScenarioStage>, ramp: Ramp) -> Result<Self, ConfigError> {
        Self::checked(start, stages, ramp, "stage")
    }

    fn checked(
        start: u32,
        stages: Vec<ScenarioStage>,
        ramp: Ramp,
        model: &'static str,
    ) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptyStages { model });
        }
        Ok(Self {
            start,
            stages,
            ramp,
        })
    }

    pub fn total_duration(&self) -> Duration {
        self.stages
            .iter()
            .fold(Duration::ZERO, |total, s| total.saturating_add(s.duration))
    }

    /// Highest value the profile ever asks for.
    pub fn peak(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start, u32::max)
    }

    /// Index of the stage running at `elapsed`, `None` once every stage is over.
    pub fn stage_index(&self, elapsed: Duration) -> Option<usize> {
        let mut offset = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            offset = offset.saturating_add(stage.duration);
            if elapsed < offset {
                return Some(index);
            }
        }
        None
    }

    /// Target value at `elapsed`. Linear ramps interpolate from the previous stage's target;
    /// step ramps jump to the stage target at its start.
    pub fn value_at(&self, elapsed: Duration) -> f64 {
        let mut offset = Duration::ZERO;
        let mut previous = self.start as f64;
        for stage in &self.stages {
            let target = stage.target as f64;
            let end = offset.saturating_add(stage.duration);
            if elapsed < end {
                return match self.ramp {
                    Ramp::Step => target,
                    Ramp::Linear => {
                        let fraction =
                            (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64();
                        previous + (target - previous) * fraction
                    }
                };
            }
            offset = end;
            previous = target;
        }
        previous
    }

    /// Area under the profile between 0 and `elapsed`, in value-seconds. For an arrival rate per
    /// second this is the number of arrivals due so far.
    pub fn integral(&self, elapsed: Duration) -> f64 {
        let mut offset = Duration::ZERO;
        let mut previous = self.start as f64;
        let mut area = 0.0;
        for stage in &self.stages {
            let target = stage.target as f64;
            let length = stage.duration.as_secs_f64();
            let within = elapsed.saturating_sub(offset).min(stage.duration).as_secs_f64();
            if within > 0.0 {
                area += match self.ramp {
                    Ramp::Step => target * within,
                    Ramp::Linear => {
                        previous * within + (target - previous) * within * within / (2.0 * length)
                    }
                };
            }
            let end = offset.saturating_add(stage.duration);
            if elapsed < end {
                return area;
            }
            offset = end;
            previous = target;
        }
        area
    }
}

/// The two scheduling models, sharing the same executor and aggregator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SchedulingPlan {
    /// A bounded set of persistent clients; the profile is the number active at each instant.
    Population {
        profile: StageProfile,
        max_clients: u32,
    },
    /// New iterations start at the profile's rate per `time_unit`, served by a bounded pool.
    ArrivalRate {
        profile: StageProfile,
        #[serde(with = "millis")]
        time_unit: Duration,
        pre_allocated: u32,
        max_pool: u32,
    },
}

impl SchedulingPlan {
    pub fn from_config(config: &RunConfig) -> Result<Self, ConfigError> {
        match (config.executor, config.mode) {
            (ExecutorModel::Vus, Mode::Load) => {
                let stages = vec![
                    ScenarioStage::new(config.target_vus, config.load.up),
                    ScenarioStage::new(config.target_vus, config.load.hold),
                    ScenarioStage::new(0, config.load.down),
                ];
                let profile = StageProfile::checked(1, stages, config.ramp, "population")?;
                Ok(SchedulingPlan::Population {
                    max_clients: profile.peak(),
                    profile,
                })
            }
            (ExecutorModel::Vus, Mode::Stress) => {
                let stress = &config.stress;
                let stages = stress_stages(stress, stress.start_vus, stress.max_vus);
                let profile =
                    StageProfile::checked(stress.start_vus, stages, config.ramp, "population")?;
                Ok(SchedulingPlan::Population {
                    max_clients: profile.peak(),
                    profile,
                })
            }
            (ExecutorModel::Rps, Mode::Load) => {
                let stages = vec![ScenarioStage::new(config.rps, config.duration)];
                let profile =
                    StageProfile::checked(config.rps, stages, config.ramp, "arrival-rate")?;
                Ok(Self::arrival_rate(profile, config))
            }
            (ExecutorModel::Rps, Mode::Stress) => {
                let stress = &config.stress;
                let stages = stress_stages(stress, stress.start_rate, stress.max_rate);
                let profile =
                    StageProfile::checked(stress.start_rate, stages, config.ramp, "arrival-rate")?;
                Ok(Self::arrival_rate(profile, config))
            }
        }
    }

    fn arrival_rate(profile: StageProfile, config: &RunConfig) -> Self {
        SchedulingPlan::ArrivalRate {
            profile,
            time_unit: Duration::from_secs(1),
            pre_allocated: config.preallocated_vus.min(config.max_vus),
            max_pool: config.max_vus,
        }
    }

    pub fn profile(&self) -> &StageProfile {
        match self {
            SchedulingPlan::Population { profile, .. } => profile,
            SchedulingPlan::ArrivalRate { profile, .. } => profile,
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.profile().total_duration()
    }

    pub fn model_name(&self) -> &'static str {
        match self {
            SchedulingPlan::Population { .. } => "population",
            SchedulingPlan::ArrivalRate { .. } => "arrival-rate",
        }
    }
}

/// Stress staircase between `start` and `max`. Explicit targets win over both generated styles.
pub fn stress_stages(stress: &StressParams, start: u32, max: u32) -> Vec<ScenarioStage> {
    let hold = stress.step_hold;
    if !stress.targets.is_empty() {
        return stress
            .targets
            .iter()
            .map(|&target| ScenarioStage::new(target, hold))
            .collect();
    }

    match stress.style {
        StressStyle::Auto => {
            let steps = stress.step_count.max(1);
            let increment = (max.saturating_sub(start) / steps).max(1);
            std::iter::once(start)
                .chain((1..=steps).map(|i| {
                    start.saturating_add(increment.saturating_mul(i)).min(max)
                }))
                .map(|target| ScenarioStage::new(target, hold))
                .collect()
        }
        StressStyle::Progressive => {
            let count = match stress.total {
                Some(total) => {
                    let count = total.as_millis() / hold.as_millis().max(1);
                    u32::try_from(count).unwrap_or(u32::MAX).max(1)
                }
                None => stress.step_count.saturating_add(1),
            };
            let increment = (max.saturating_sub(start) / count).max(1);
            (0..count)
                .map(|i| start.saturating_add(increment.saturating_mul(i)).min(max))
                .map(|target| ScenarioStage::new(target, hold))
                .collect()
        }
    }
}
