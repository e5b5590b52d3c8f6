use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{info, warn};

use crate::plan::{SchedulingPlan, StageProfile};

const POPULATION_TICK: Duration = Duration::from_millis(100);
const ARRIVAL_TICK: Duration = Duration::from_millis(10);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

// =============================================================================
// Hooks
// =============================================================================

/// Identity and iteration counter of one virtual client. Iterations of a client never overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualClient {
    pub id: u64,
    pub iteration: u64,
}

/// What a virtual client does on each iteration.
pub trait Behaviour: Send + Sync + 'static {
    fn iterate(&self, client: &mut VirtualClient) -> impl Future<Output = ()> + Send;

    /// Called once after the drain with the number of iterations cut off mid-flight.
    fn interrupted(&self, _count: u64) {}
}

/// External run-abort request. Cloned freely; any clone can trigger it.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        Self {
            sender: Arc::new(watch::channel(false).0),
        }
    }

    /// Stop issuing new iterations. In-flight ones still get the graceful-stop window.
    pub fn abort(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.sender.borrow()
    }

    fn listener(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

impl Counters {
    fn begin(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
    }

    fn end(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every stage ran to its end
    #[default]
    Completed,
    /// The global run-duration cap was hit first
    MaxDuration,
    Aborted,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub iterations_started: u64,
    pub iterations_completed: u64,
    /// Arrivals that found no idle client and a full pool
    pub dropped_iterations: u64,
    /// Iterations cut off when the graceful-stop window ran out
    pub interrupted_iterations: u64,
    pub peak_in_flight: u64,
    pub elapsed_ms: u64,
    pub stop_reason: StopReason,
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives a [`SchedulingPlan`] through `Idle -> Stage[0] -> ... -> Stage[n-1] -> Drained`.
///
/// Stage boundaries are purely time-triggered: an iteration in flight when a boundary passes
/// finishes under the old target.
pub struct Scheduler {
    plan: SchedulingPlan,
    graceful_stop: Duration,
    max_duration: Option<Duration>,
}

struct Progress {
    last_log: Instant,
    stage: Option<usize>,
}

impl Progress {
    fn new() -> Self {
        Self {
            last_log: Instant::now(),
            stage: None,
        }
    }

    fn update(&mut self, profile: &StageProfile, elapsed: Duration, counters: &Counters) {
        let stage = profile.stage_index(elapsed);
        if stage != self.stage {
            if let Some(index) = stage {
                let s = &profile.stages[index];
                info!(
                    "Stage {}/{}: target {} over {:?}",
                    index + 1,
                    profile.stages.len(),
                    s.target,
                    s.duration
                );
            }
            self.stage = stage;
        }

        if self.last_log.elapsed() >= PROGRESS_INTERVAL {
            info!(
                "Progress: elapsed={:.1}s, target={:.1}, in_flight={}, completed={}, dropped={}",
                elapsed.as_secs_f64(),
                profile.value_at(elapsed),
                counters.in_flight.load(Ordering::Relaxed),
                counters.completed.load(Ordering::Relaxed),
                counters.dropped.load(Ordering::Relaxed)
            );
            self.last_log = Instant::now();
        }
    }
}

impl Scheduler {
    pub fn new(plan: SchedulingPlan, graceful_stop: Duration, max_duration: Option<Duration>) -> Self {
        Self {
            plan,
            graceful_stop,
            max_duration,
        }
    }

    pub fn plan(&self) -> &SchedulingPlan {
        &self.plan
    }

    /// How long stages run before the scheduler drains, accounting for the duration cap.
    fn run_for(&self) -> (Duration, StopReason) {
        let total = self.plan.total_duration();
        match self.max_duration {
            Some(cap) if cap < total => (cap, StopReason::MaxDuration),
            _ => (total, StopReason::Completed),
        }
    }

    pub async fn run<B: Behaviour>(&self, behaviour: Arc<B>, abort: &AbortHandle) -> RunStats {
        let counters = Arc::new(Counters::default());
        let hook = Arc::clone(&behaviour);
        let start = Instant::now();

        let (tasks, stop_reason) = match &self.plan {
            SchedulingPlan::Population {
                profile,
                max_clients,
            } => {
                self.run_population(profile, *max_clients, behaviour, abort, &counters)
                    .await
            }
            SchedulingPlan::ArrivalRate {
                profile,
                time_unit,
                pre_allocated,
                max_pool,
            } => {
                let pool = Pool {
                    time_unit: *time_unit,
                    pre_allocated: *pre_allocated,
                    max_pool: *max_pool,
                };
                self.run_arrival_rate(profile, pool, behaviour, abort, &counters)
                    .await
            }
        };

        let interrupted = self.drain(tasks, &counters).await;
        if interrupted > 0 {
            hook.interrupted(interrupted);
        }

        RunStats {
            iterations_started: counters.started.load(Ordering::Relaxed),
            iterations_completed: counters.completed.load(Ordering::Relaxed),
            dropped_iterations: counters.dropped.load(Ordering::Relaxed),
            interrupted_iterations: interrupted,
            peak_in_flight: counters.peak_in_flight.load(Ordering::Relaxed),
            elapsed_ms: start.elapsed().as_millis() as u64,
            stop_reason,
        }
    }

    /// Wait up to the graceful-stop window for in-flight iterations, then cut off the rest.
    async fn drain(&self, mut tasks: JoinSet<()>, counters: &Counters) -> u64 {
        info!(
            "Draining: waiting for {} in-flight iterations (max {:?})",
            counters.in_flight.load(Ordering::Relaxed),
            self.graceful_stop
        );
        let drained = timeout(self.graceful_stop, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if drained {
            info!("All iterations completed before timeout");
            return 0;
        }

        let interrupted = counters.in_flight.load(Ordering::Relaxed);
        warn!("Graceful stop timeout reached, interrupting {interrupted} iterations");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        interrupted
    }

    // -------------------------------------------------------------------------
    // Population model
    // -------------------------------------------------------------------------

    async fn run_population<B: Behaviour>(
        &self,
        profile: &StageProfile,
        max_clients: u32,
        behaviour: Arc<B>,
        abort: &AbortHandle,
        counters: &Arc<Counters>,
    ) -> (JoinSet<()>, StopReason) {
        let (control_tx, control_rx) = watch::channel(Control::default());
        let mut tasks = JoinSet::new();
        for id in 0..max_clients {
            let behaviour = Arc::clone(&behaviour);
            let control = control_rx.clone();
            let counters = Arc::clone(counters);
            tasks.spawn(population_client(id, behaviour, control, counters));
        }
        info!("Population model: {max_clients} clients allocated");

        let (run_for, complete_reason) = self.run_for();
        let mut abort_rx = abort.listener();
        let mut ticker = interval(POPULATION_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut progress = Progress::new();
        let start = Instant::now();

        let reason = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = abort_rx.changed() => {}
            }
            if abort.is_aborted() {
                info!("Run aborted");
                break StopReason::Aborted;
            }
            let elapsed = start.elapsed();
            if elapsed >= run_for {
                break complete_reason;
            }

            let desired = (profile.value_at(elapsed).floor().max(0.0) as u32).min(max_clients);
            control_tx.send_if_modified(|control| {
                let changed = control.active != desired;
                control.active = desired;
                changed
            });
            progress.update(profile, elapsed, counters);
        };

        control_tx.send_replace(Control {
            active: 0,
            stopped: true,
        });
        (tasks, reason)
    }

    // -------------------------------------------------------------------------
    // Arrival-rate model
    // -------------------------------------------------------------------------

    async fn run_arrival_rate<B: Behaviour>(
        &self,
        profile: &StageProfile,
        pool: Pool,
        behaviour: Arc<B>,
        abort: &AbortHandle,
        counters: &Arc<Counters>,
    ) -> (JoinSet<()>, StopReason) {
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel::<VirtualClient>();
        for id in 0..pool.pre_allocated {
            let _ = idle_tx.send(VirtualClient {
                id: u64::from(id),
                iteration: 0,
            });
        }
        let mut allocated = pool.pre_allocated;
        info!(
            "Arrival-rate model: {} clients pre-allocated, pool capped at {}",
            pool.pre_allocated, pool.max_pool
        );

        let (run_for, complete_reason) = self.run_for();
        let unit = pool.time_unit.as_secs_f64();
        let mut abort_rx = abort.listener();
        let mut ticker = interval(ARRIVAL_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut progress = Progress::new();
        let mut tasks = JoinSet::new();
        let mut launched: u64 = 0;
        let start = Instant::now();

        let reason = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = abort_rx.changed() => {}
            }
            if abort.is_aborted() {
                info!("Run aborted");
                break StopReason::Aborted;
            }
            let elapsed = start.elapsed();
            if elapsed >= run_for {
                break complete_reason;
            }

            while tasks.try_join_next().is_some() {}

            let due = (profile.integral(elapsed) / unit).floor() as u64;
            while launched < due {
                launched += 1;
                let client = match idle_rx.try_recv() {
                    Ok(client) => client,
                    Err(_) if allocated < pool.max_pool => {
                        allocated += 1;
                        VirtualClient {
                            id: u64::from(allocated - 1),
                            iteration: 0,
                        }
                    }
                    Err(_) => {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };

                let behaviour = Arc::clone(&behaviour);
                let counters = Arc::clone(counters);
                let idle_tx = idle_tx.clone();
                tasks.spawn(async move {
                    let mut client = client;
                    counters.begin();
                    behaviour.iterate(&mut client).await;
                    counters.end();
                    client.iteration += 1;
                    let _ = idle_tx.send(client);
                });
            }
            progress.update(profile, elapsed, counters);
        };

        let dropped = counters.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!("{dropped} iterations dropped (pool of {allocated} clients could not keep up)");
        }
        (tasks, reason)
    }
}

#[derive(Debug, Clone, Copy)]
struct Pool {
    time_unit: Duration,
    pre_allocated: u32,
    max_pool: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Control {
    active: u32,
    stopped: bool,
}

/// A persistent client: loops its iteration while its id is below the active count.
async fn population_client<B: Behaviour>(
    id: u32,
    behaviour: Arc<B>,
    mut control: watch::Receiver<Control>,
    counters: Arc<Counters>,
) {
    let mut client = VirtualClient {
        id: u64::from(id),
        iteration: 0,
    };
    loop {
        let state = *control.borrow_and_update();
        if state.stopped {
            return;
        }
        if id < state.active {
            counters.begin();
            behaviour.iterate(&mut client).await;
            counters.end();
            client.iteration += 1;
        } else if control.changed().await.is_err() {
            return;
        }
    }
}
