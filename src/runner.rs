//! Background control loop.
//!
//! [`ExperimentRunner`] spawns a task that polls at a short fixed cadence and
//! calls [`Experiment::update`] whenever a measurement interval has elapsed.
//! With a time-acceleration factor `x`, one interval of `m` simulated minutes
//! takes `m * 60 / x` wall-clock seconds. The poll cadence keeps stop
//! requests responsive regardless of the interval length.

use crate::error::{AppResult, MorbidostatError};
use crate::experiment::{Experiment, ExperimentSnapshot, ExperimentStatus};
use crate::hardware::Device;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Upper bound of the poll cadence, in milliseconds.
pub const MAX_POLL_INTERVAL_MS: u64 = 100;

/// Advances simulated physics between updates.
pub trait SimulationHook: Send + Sync {
    /// Move the simulation forward by `minutes` of simulated time.
    fn advance(&self, minutes: f64);
}

/// Runner timing and channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Poll cadence of the control loop.
    pub poll_interval_ms: u64,
    /// How long `stop` waits for the loop to exit.
    pub stop_timeout_ms: u64,
    /// Buffered snapshots per subscriber.
    pub snapshot_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            stop_timeout_ms: 5000,
            snapshot_capacity: 64,
        }
    }
}

impl RunnerConfig {
    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if !(1..=MAX_POLL_INTERVAL_MS).contains(&self.poll_interval_ms) {
            return Err(MorbidostatError::Validation(format!(
                "poll_interval_ms must be in [1, {}], got {}",
                MAX_POLL_INTERVAL_MS, self.poll_interval_ms
            )));
        }
        if self.stop_timeout_ms == 0 {
            return Err(MorbidostatError::Validation(
                "stop_timeout_ms must be positive".to_string(),
            ));
        }
        if self.snapshot_capacity == 0 {
            return Err(MorbidostatError::Validation(
                "snapshot_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Drives an experiment from a background task.
pub struct ExperimentRunner {
    experiment: Arc<Mutex<Experiment>>,
    device: Arc<Device>,
    config: RunnerConfig,
    simulation: Option<Arc<dyn SimulationHook>>,
    time_acceleration: f64,
    snapshots: broadcast::Sender<ExperimentSnapshot>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ExperimentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentRunner")
            .field("config", &self.config)
            .field("time_acceleration", &self.time_acceleration)
            .field("running", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

impl ExperimentRunner {
    /// Wrap an experiment.
    pub fn new(experiment: Experiment, config: RunnerConfig) -> AppResult<Self> {
        config.validate()?;
        let device = Arc::clone(experiment.device());
        let (snapshots, _) = broadcast::channel(config.snapshot_capacity);
        Ok(Self {
            experiment: Arc::new(Mutex::new(experiment)),
            device,
            config,
            simulation: None,
            time_acceleration: 1.0,
            snapshots,
            shutdown: None,
            task: None,
        })
    }

    /// Advance a simulation before every update.
    pub fn with_simulation(mut self, simulation: Arc<dyn SimulationHook>) -> Self {
        self.simulation = Some(simulation);
        self
    }

    /// Run intervals faster than real time.
    pub fn with_time_acceleration(mut self, factor: f64) -> Self {
        self.time_acceleration = factor;
        self
    }

    /// Receive a snapshot after every update.
    pub fn subscribe(&self) -> broadcast::Receiver<ExperimentSnapshot> {
        self.snapshots.subscribe()
    }

    /// Shared handle to the experiment.
    pub fn experiment(&self) -> Arc<Mutex<Experiment>> {
        Arc::clone(&self.experiment)
    }

    /// The bench, for direct commands.
    pub fn device(&self) -> Arc<Device> {
        Arc::clone(&self.device)
    }

    /// Whether the control loop is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Current experiment snapshot.
    pub async fn snapshot(&self) -> ExperimentSnapshot {
        self.experiment.lock().await.snapshot()
    }

    /// Wall-clock time between updates.
    pub async fn update_period(&self) -> Duration {
        let minutes = self
            .experiment
            .lock()
            .await
            .config()
            .measurement_interval_minutes;
        Duration::try_from_secs_f64(minutes * 60.0 / self.time_acceleration)
            .unwrap_or(Duration::MAX)
    }

    /// Start the experiment and spawn the control loop.
    pub async fn start(&mut self) -> AppResult<()> {
        if self.is_running() {
            return Err(MorbidostatError::State(
                "Cannot start: runner is already running".to_string(),
            ));
        }
        if !(self.time_acceleration.is_finite() && self.time_acceleration > 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "time_acceleration must be positive, got {}",
                self.time_acceleration
            )));
        }

        let interval_minutes = {
            let mut experiment = self.experiment.lock().await;
            experiment.start().await?;
            let _ = self.snapshots.send(experiment.snapshot());
            experiment.config().measurement_interval_minutes
        };
        let period = Duration::try_from_secs_f64(interval_minutes * 60.0 / self.time_acceleration)
            .unwrap_or(Duration::MAX);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let control = ControlLoop {
            experiment: Arc::clone(&self.experiment),
            simulation: self.simulation.clone(),
            snapshots: self.snapshots.clone(),
            poll: Duration::from_millis(self.config.poll_interval_ms),
            period,
            interval_minutes,
        };
        self.task = Some(tokio::spawn(control.run(shutdown_rx)));
        self.shutdown = Some(shutdown_tx);

        info!(
            period_ms = period.as_millis() as u64,
            acceleration = self.time_acceleration,
            "Runner started"
        );
        Ok(())
    }

    /// Stop the loop, then stop the experiment.
    ///
    /// Waits up to `stop_timeout_ms` for the loop to exit and aborts it
    /// otherwise. The experiment is stopped either way.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(mut task) = self.task.take() {
            let timeout = Duration::from_millis(self.config.stop_timeout_ms);
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => debug!("Control loop exited"),
                Ok(Err(e)) => warn!(error = %e, "Control loop task failed"),
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.stop_timeout_ms,
                        "Control loop did not exit in time, aborting"
                    );
                    task.abort();
                }
            }
        }

        let mut experiment = self.experiment.lock().await;
        experiment.stop().await;
        let _ = self.snapshots.send(experiment.snapshot());
        info!(status = %experiment.status(), "Runner stopped");
    }

    /// Pause the experiment; the loop keeps polling.
    pub async fn pause(&self) -> AppResult<()> {
        self.experiment.lock().await.pause()
    }

    /// Resume a paused experiment.
    pub async fn resume(&self) -> AppResult<()> {
        self.experiment.lock().await.resume()
    }
}

impl Drop for ExperimentRunner {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct ControlLoop {
    experiment: Arc<Mutex<Experiment>>,
    simulation: Option<Arc<dyn SimulationHook>>,
    snapshots: broadcast::Sender<ExperimentSnapshot>,
    poll: Duration,
    period: Duration,
    interval_minutes: f64,
}

impl ControlLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_update = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Shutdown requested");
                        break;
                    }
                    continue;
                }
            }

            if last_update.elapsed() < self.period {
                continue;
            }
            last_update = Instant::now();

            if !self.tick().await {
                break;
            }
        }
    }

    /// One update; returns false once the loop should exit.
    async fn tick(&self) -> bool {
        let mut experiment = self.experiment.lock().await;
        match experiment.status() {
            ExperimentStatus::Running => {}
            ExperimentStatus::Paused | ExperimentStatus::Initialized => return true,
            ExperimentStatus::Stopped | ExperimentStatus::Error => return false,
        }

        if let Some(simulation) = &self.simulation {
            simulation.advance(self.interval_minutes);
        }

        let keep_going = match experiment.update().await {
            Ok(()) => !experiment.status().is_terminal(),
            Err(e) => {
                error!(error = %e, "Experiment update failed, stopping");
                experiment.stop().await;
                false
            }
        };
        let _ = self.snapshots.send(experiment.snapshot());
        keep_going
    }
}
