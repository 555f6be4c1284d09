//! Experiment lifecycle and orchestration.
//!
//! An [`Experiment`] owns one [`Culture`] per vial and a control protocol,
//! and drives the protocol over every vial on each update.
//!
//! # State Machine
//!
//! ```text
//! Initialized ──start──> Running ──stop / end condition──> Stopped
//!      │                  │   ▲
//!      │             pause│   │resume, start
//!      │                  ▼   │
//!      │                 Paused
//!      │                  │
//!      └───── failure ────┴──────> Error
//! ```
//!
//! `Stopped` and `Error` are terminal. Illegal transitions return a `State`
//! error and leave the experiment untouched.

use crate::clock::{Clock, SystemClock};
use crate::culture::{Culture, CultureConfig, CultureStatus};
use crate::error::{AppResult, MorbidostatError};
use crate::hardware::{Device, DeviceConfig};
use crate::protocol::{
    GrowthControlProtocol, MorbidostatConfig, MorbidostatProtocol, ProtocolRecord, ProtocolStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    /// Created, not started
    Initialized,
    /// Control loop active
    Running,
    /// Suspended; can be resumed
    Paused,
    /// Finished (terminal)
    Stopped,
    /// Failed (terminal)
    Error,
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentStatus::Initialized => write!(f, "initialized"),
            ExperimentStatus::Running => write!(f, "running"),
            ExperimentStatus::Paused => write!(f, "paused"),
            ExperimentStatus::Stopped => write!(f, "stopped"),
            ExperimentStatus::Error => write!(f, "error"),
        }
    }
}

impl ExperimentStatus {
    /// Whether `start` is legal.
    pub fn can_start(&self) -> bool {
        matches!(self, ExperimentStatus::Initialized | ExperimentStatus::Paused)
    }

    /// Whether `pause` is legal.
    pub fn can_pause(&self) -> bool {
        matches!(self, ExperimentStatus::Running)
    }

    /// Whether `resume` is legal.
    pub fn can_resume(&self) -> bool {
        matches!(self, ExperimentStatus::Paused)
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Stopped | ExperimentStatus::Error)
    }
}

/// Experiment parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Simulated or real minutes between updates.
    pub measurement_interval_minutes: f64,
    /// Stop once any vial reaches this many generations.
    pub max_generations: Option<f64>,
    /// Stop after this many hours.
    pub max_duration_hours: Option<f64>,
    /// Culture parameters shared by every vial.
    pub culture: CultureConfig,
    /// Bench parameters.
    pub device: DeviceConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            measurement_interval_minutes: 10.0,
            max_generations: None,
            max_duration_hours: None,
            culture: CultureConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.measurement_interval_minutes.is_finite() && self.measurement_interval_minutes > 0.0)
        {
            return Err(MorbidostatError::Validation(format!(
                "measurement_interval_minutes must be positive, got {}",
                self.measurement_interval_minutes
            )));
        }
        for (name, limit) in [
            ("max_generations", self.max_generations),
            ("max_duration_hours", self.max_duration_hours),
        ] {
            if let Some(v) = limit {
                if !(v.is_finite() && v > 0.0) {
                    return Err(MorbidostatError::Validation(format!(
                        "{} must be positive, got {}",
                        name, v
                    )));
                }
            }
        }
        self.culture.validate()?;
        self.device.validate()?;
        self.culture.check_device(&self.device)
    }
}

/// Status snapshot of a whole experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    /// Run identifier.
    pub run_id: Uuid,
    /// Experiment name.
    pub name: String,
    /// Lifecycle state.
    pub status: ExperimentStatus,
    /// Last recorded failure.
    pub error: Option<String>,
    /// When the experiment was (re)started.
    pub start_time: DateTime<Utc>,
    /// Hours since `start_time`.
    pub duration_hours: f64,
    /// Per-vial culture status.
    pub cultures: BTreeMap<u8, CultureStatus>,
}

/// Experiment state written to disk for restart support.
///
/// Restores an experiment shell (name, configuration, status), not a live
/// hardware session or the culture histories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedExperiment {
    /// Run identifier.
    pub run_id: Uuid,
    /// Experiment name.
    pub name: String,
    /// Experiment parameters.
    pub config: ExperimentConfig,
    /// Last known status.
    pub status: ExperimentStatus,
    /// Last recorded failure.
    pub error: Option<String>,
    /// Start time of the run.
    pub start_time: DateTime<Utc>,
    /// When the state was written.
    pub saved_at: DateTime<Utc>,
}

impl PersistedExperiment {
    /// Save as pretty-printed JSON, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, json)?;
        Ok(())
    }

    /// Load from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// One morbidostat run.
pub struct Experiment {
    run_id: Uuid,
    name: String,
    config: ExperimentConfig,
    device: Arc<Device>,
    cultures: BTreeMap<u8, Culture>,
    protocol: Box<dyn GrowthControlProtocol>,
    status: ExperimentStatus,
    error: Option<String>,
    start_time: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl Experiment {
    /// Start building an experiment on `device`.
    pub fn builder(device: Arc<Device>) -> ExperimentBuilder {
        ExperimentBuilder::new(device)
    }

    /// Rebuild an experiment shell from persisted state.
    ///
    /// A persisted `running` status comes back as `paused`: the shell has no
    /// live control loop until `start` or `resume` is called.
    pub fn from_persisted(
        device: Arc<Device>,
        persisted: PersistedExperiment,
        protocol: Box<dyn GrowthControlProtocol>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        let mut experiment = ExperimentBuilder::new(device)
            .name(persisted.name)
            .config(persisted.config)
            .protocol(protocol)
            .clock(clock)
            .build()?;
        experiment.run_id = persisted.run_id;
        experiment.start_time = persisted.start_time;
        experiment.error = persisted.error;
        experiment.status = match persisted.status {
            ExperimentStatus::Running => ExperimentStatus::Paused,
            other => other,
        };
        info!(
            name = %experiment.name,
            status = %experiment.status,
            "Experiment restored"
        );
        Ok(experiment)
    }

    /// Load persisted state from `path` and rebuild the shell.
    pub fn load_state<P: AsRef<Path>>(
        path: P,
        device: Arc<Device>,
        protocol: Box<dyn GrowthControlProtocol>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        let persisted = PersistedExperiment::load(path)?;
        Self::from_persisted(device, persisted, protocol, clock)
    }

    /// Run identifier.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Experiment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Experiment parameters.
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Lifecycle state.
    pub fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Last recorded failure.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The bench.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Start time of the run.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Cultures keyed by vial.
    pub fn cultures(&self) -> &BTreeMap<u8, Culture> {
        &self.cultures
    }

    /// Culture of one vial.
    pub fn culture(&self, vial: u8) -> Option<&Culture> {
        self.cultures.get(&vial)
    }

    /// Protocol summary.
    pub fn protocol_status(&self) -> ProtocolStatus {
        self.protocol.status()
    }

    /// Every protocol evaluation so far.
    pub fn protocol_history(&self) -> &[ProtocolRecord] {
        self.protocol.history()
    }

    /// Hours since the start time.
    pub fn duration_hours(&self) -> f64 {
        let elapsed = self.clock.now() - self.start_time;
        elapsed.num_milliseconds() as f64 / 3_600_000.0
    }

    fn fail(&mut self, err: &MorbidostatError) {
        self.status = ExperimentStatus::Error;
        self.error = Some(err.to_string());
    }

    /// Take a baseline measurement of every culture and begin running.
    pub async fn start(&mut self) -> AppResult<()> {
        if !self.status.can_start() {
            return Err(MorbidostatError::State(format!(
                "Cannot start: experiment is {}",
                self.status
            )));
        }

        for culture in self.cultures.values_mut() {
            if let Err(e) = culture.measure().await {
                error!(vial = culture.vial(), error = %e, "Baseline measurement failed");
                self.status = ExperimentStatus::Error;
                self.error = Some(e.to_string());
                return Err(e);
            }
        }

        self.status = ExperimentStatus::Running;
        self.start_time = self.clock.now();
        info!(name = %self.name, run_id = %self.run_id, vials = self.cultures.len(), "Experiment started");
        Ok(())
    }

    /// Suspend the control loop.
    pub fn pause(&mut self) -> AppResult<()> {
        if !self.status.can_pause() {
            return Err(MorbidostatError::State(format!(
                "Cannot pause: experiment is {}",
                self.status
            )));
        }
        self.status = ExperimentStatus::Paused;
        info!(name = %self.name, "Experiment paused");
        Ok(())
    }

    /// Resume a paused experiment.
    pub fn resume(&mut self) -> AppResult<()> {
        if !self.status.can_resume() {
            return Err(MorbidostatError::State(format!(
                "Cannot resume: experiment is {}",
                self.status
            )));
        }
        self.status = ExperimentStatus::Running;
        info!(name = %self.name, "Experiment resumed");
        Ok(())
    }

    /// Run the protocol on every culture, in vial order, then check end conditions.
    ///
    /// Does nothing unless running. A failure moves the experiment to `Error`
    /// and is returned.
    pub async fn update(&mut self) -> AppResult<()> {
        if self.status != ExperimentStatus::Running {
            return Ok(());
        }

        for culture in self.cultures.values_mut() {
            if let Err(e) = self.protocol.update(culture).await {
                error!(vial = culture.vial(), error = %e, "Experiment update failed");
                self.fail(&e);
                return Err(e);
            }
        }

        if let Some(reason) = self.end_condition() {
            info!(name = %self.name, reason = %reason, "End condition reached");
            self.stop().await;
        }
        Ok(())
    }

    fn end_condition(&self) -> Option<String> {
        if let Some(max) = self.config.max_generations {
            if let Some(culture) = self
                .cultures
                .values()
                .find(|c| c.current_generations() >= max)
            {
                return Some(format!(
                    "vial {} reached {:.2} generations",
                    culture.vial(),
                    culture.current_generations()
                ));
            }
        }
        if let Some(max) = self.config.max_duration_hours {
            let hours = self.duration_hours();
            if hours >= max {
                return Some(format!("ran for {:.2} hours", hours));
            }
        }
        None
    }

    /// Stop the experiment and drive the bench to its safe state.
    ///
    /// Always ends in `Stopped`, except that `Error` is kept. Emergency-stop
    /// failures are recorded in the error field, never returned.
    pub async fn stop(&mut self) {
        let report = self.device.emergency_stop().await;
        if !report.is_clean() {
            let message = format!("Emergency stop incomplete: {}", report.failures.join("; "));
            warn!(name = %self.name, %message);
            self.error = Some(match self.error.take() {
                Some(previous) => format!("{}; {}", previous, message),
                None => message,
            });
        }
        if self.status != ExperimentStatus::Error {
            self.status = ExperimentStatus::Stopped;
        }
        info!(name = %self.name, status = %self.status, "Experiment stopped");
    }

    /// Status snapshot.
    pub fn snapshot(&self) -> ExperimentSnapshot {
        ExperimentSnapshot {
            run_id: self.run_id,
            name: self.name.clone(),
            status: self.status,
            error: self.error.clone(),
            start_time: self.start_time,
            duration_hours: self.duration_hours(),
            cultures: self
                .cultures
                .iter()
                .map(|(vial, culture)| (*vial, culture.status()))
                .collect(),
        }
    }

    /// State to persist.
    pub fn to_persisted(&self) -> PersistedExperiment {
        PersistedExperiment {
            run_id: self.run_id,
            name: self.name.clone(),
            config: self.config.clone(),
            status: self.status,
            error: self.error.clone(),
            start_time: self.start_time,
            saved_at: self.clock.now(),
        }
    }

    /// Write the persisted state to `path`.
    pub fn save_state<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        self.to_persisted().save(path)
    }
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("run_id", &self.run_id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("cultures", &self.cultures.len())
            .field("protocol", &self.protocol.name())
            .finish()
    }
}

/// Builder for [`Experiment`].
pub struct ExperimentBuilder {
    device: Arc<Device>,
    name: Option<String>,
    config: Option<ExperimentConfig>,
    protocol: Option<Box<dyn GrowthControlProtocol>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ExperimentBuilder {
    fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            name: None,
            config: None,
            protocol: None,
            clock: None,
        }
    }

    /// Experiment name; defaults to the start timestamp.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Experiment parameters; defaults use the device's own configuration.
    pub fn config(mut self, config: ExperimentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Control protocol; defaults to a morbidostat with default parameters.
    pub fn protocol(mut self, protocol: Box<dyn GrowthControlProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Time source; defaults to the wall clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate and build.
    pub fn build(self) -> AppResult<Experiment> {
        let config = self.config.unwrap_or_else(|| ExperimentConfig {
            device: self.device.config().clone(),
            ..Default::default()
        });
        config.validate()?;
        if config.device.n_vials > self.device.n_vials() {
            return Err(MorbidostatError::Validation(format!(
                "Experiment uses {} vials but the device has {}",
                config.device.n_vials,
                self.device.n_vials()
            )));
        }

        let protocol = match self.protocol {
            Some(protocol) => protocol,
            None => Box::new(MorbidostatProtocol::new(MorbidostatConfig::default())?),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let now = clock.now();
        let name = self
            .name
            .unwrap_or_else(|| now.format("%Y%m%d_%H%M%S").to_string());

        let mut cultures = BTreeMap::new();
        for vial in 1..=config.device.n_vials {
            let culture = Culture::new(
                vial,
                Arc::clone(&self.device),
                config.culture.clone(),
                Arc::clone(&clock),
            )?;
            cultures.insert(vial, culture);
        }

        info!(name = %name, protocol = protocol.name(), vials = cultures.len(), "Experiment created");
        Ok(Experiment {
            run_id: Uuid::new_v4(),
            name,
            config,
            device: self.device,
            cultures,
            protocol,
            status: ExperimentStatus::Initialized,
            error: None,
            start_time: now,
            clock,
        })
    }
}
