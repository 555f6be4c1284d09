//! Safety-checked bioreactor device.
//!
//! `Device` owns the component set of one morbidostat bench and turns
//! vial-level intents (measure this vial, dilute that vial) into sequences of
//! component operations. It is the only code that mutates hardware state, and
//! therefore the single place where safety rules are enforced:
//!
//! - vial ids and volumes are validated before any component is touched
//! - every component call is bounded by a timeout, so a stuck component
//!   surfaces as a `Device` error instead of a hang
//! - the stirrer is always returned to `High` after a measurement
//! - the vial valve is always closed after a dilution, and any dilution
//!   failure drives the whole bench to the safe state first
//! - `emergency_stop` attempts every stop action and never fails

use crate::culture::VialMeasurements;
use crate::error::{AppResult, ComponentError, ComponentErrorKind, ComponentResult, MorbidostatError};
use crate::hardware::capabilities::{OdSensor, Pump, PumpRole, Stirrer, StirrerSpeed, Thermometer, Valves};
use crate::hardware::events::DeviceEvents;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Largest bench the controller supports.
pub const MAX_VIALS: u8 = 7;

/// Sentinel reported by [`VialStatus`] for a vial that could not be read.
pub const STATUS_SENTINEL: f64 = -1.0;

/// Static configuration of a bench.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of vials (1..=7).
    pub n_vials: u8,
    /// Largest volume a single dilution may exchange, in ml.
    pub max_volume_ml: f64,
    /// Smallest working volume of a vial, in ml.
    pub min_volume_ml: f64,
    /// Upper bound for a single component call, in milliseconds.
    pub operation_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            n_vials: MAX_VIALS,
            max_volume_ml: 30.0,
            min_volume_ml: 5.0,
            operation_timeout_ms: 5000,
        }
    }
}

impl DeviceConfig {
    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if self.n_vials == 0 || self.n_vials > MAX_VIALS {
            return Err(MorbidostatError::Validation(format!(
                "n_vials must be between 1 and {}, got {}",
                MAX_VIALS, self.n_vials
            )));
        }
        if !(self.max_volume_ml.is_finite() && self.max_volume_ml > 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "max_volume_ml must be positive, got {}",
                self.max_volume_ml
            )));
        }
        if !(self.min_volume_ml.is_finite() && self.min_volume_ml >= 0.0)
            || self.min_volume_ml > self.max_volume_ml
        {
            return Err(MorbidostatError::Validation(format!(
                "min_volume_ml must be within [0, {}], got {}",
                self.max_volume_ml, self.min_volume_ml
            )));
        }
        if self.operation_timeout_ms == 0 {
            return Err(MorbidostatError::Validation(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// The components a `Device` is built from.
pub struct DeviceComponents {
    /// Pumps keyed by role; media, drug and waste are all required.
    pub pumps: BTreeMap<PumpRole, Arc<dyn Pump>>,
    /// Vial valves.
    pub valves: Arc<dyn Valves>,
    /// Stirrer driver.
    pub stirrer: Arc<dyn Stirrer>,
    /// Optical density sensor.
    pub od_sensor: Arc<dyn OdSensor>,
    /// Thermometer.
    pub thermometer: Arc<dyn Thermometer>,
}

/// Best-effort status of one vial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VialStatus {
    /// Optical density, or the sentinel on failure.
    pub od: f64,
    /// Vial temperature in °C, or the sentinel on failure.
    pub temperature: f64,
    /// Stirrer speed, or the sentinel on failure.
    pub rpm: f64,
    /// Why the vial could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VialStatus {
    fn failed(error: String) -> Self {
        Self {
            od: STATUS_SENTINEL,
            temperature: STATUS_SENTINEL,
            rpm: STATUS_SENTINEL,
            error: Some(error),
        }
    }
}

impl From<VialMeasurements> for VialStatus {
    fn from(m: VialMeasurements) -> Self {
        Self {
            od: m.od(),
            temperature: m.temperature(),
            rpm: m.rpm().unwrap_or(0.0),
            error: None,
        }
    }
}

/// Activity of one pump.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PumpStatus {
    /// Whether the pump is dispensing.
    pub is_pumping: bool,
    /// Total volume dispensed.
    pub pumped_volume_ml: f64,
}

/// Outcome of an emergency stop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStopReport {
    /// One entry per stop action that failed.
    pub failures: Vec<String>,
}

impl EmergencyStopReport {
    /// Whether every stop action succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A morbidostat bench.
pub struct Device {
    config: DeviceConfig,
    pumps: BTreeMap<PumpRole, Arc<dyn Pump>>,
    valves: Arc<dyn Valves>,
    stirrer: Arc<dyn Stirrer>,
    od_sensor: Arc<dyn OdSensor>,
    thermometer: Arc<dyn Thermometer>,
    events: DeviceEvents,
}

impl Device {
    /// Assemble a device from its components.
    ///
    /// Fails with a validation error if the configuration is out of range or
    /// a required pump role is missing.
    pub fn new(
        config: DeviceConfig,
        components: DeviceComponents,
        events: DeviceEvents,
    ) -> AppResult<Self> {
        config.validate()?;
        for role in PumpRole::ALL {
            if !components.pumps.contains_key(&role) {
                return Err(MorbidostatError::Validation(format!(
                    "Missing required pump: {} ({})",
                    role,
                    role.id()
                )));
            }
        }

        info!(
            n_vials = config.n_vials,
            max_volume_ml = config.max_volume_ml,
            listeners = events.len(),
            "Device initialized"
        );

        Ok(Self {
            config,
            pumps: components.pumps,
            valves: components.valves,
            stirrer: components.stirrer,
            od_sensor: components.od_sensor,
            thermometer: components.thermometer,
            events,
        })
    }

    /// Static configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Number of vials.
    pub fn n_vials(&self) -> u8 {
        self.config.n_vials
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.config.operation_timeout_ms)
    }

    fn validate_vial(&self, vial: u8) -> AppResult<()> {
        if !(1..=self.config.n_vials).contains(&vial) {
            return Err(MorbidostatError::Validation(format!(
                "Invalid vial number {}. Must be between 1 and {}",
                vial, self.config.n_vials
            )));
        }
        Ok(())
    }

    fn validate_volume(&self, what: &str, volume_ml: f64) -> AppResult<()> {
        if !volume_ml.is_finite() || volume_ml < 0.0 {
            return Err(MorbidostatError::Validation(format!(
                "{} volume must be a non-negative number, got {}",
                what, volume_ml
            )));
        }
        if volume_ml > self.config.max_volume_ml {
            return Err(MorbidostatError::Validation(format!(
                "{} volume {} ml exceeds maximum {} ml",
                what, volume_ml, self.config.max_volume_ml
            )));
        }
        Ok(())
    }

    fn pump_for(&self, role: PumpRole) -> AppResult<&Arc<dyn Pump>> {
        self.pumps.get(&role).ok_or_else(|| {
            MorbidostatError::Validation(format!("No pump configured for role {}", role))
        })
    }

    /// Run a component future with an upper time bound.
    async fn bounded<T, F>(&self, component: &str, limit: Duration, fut: F) -> AppResult<T>
    where
        F: Future<Output = ComponentResult<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(MorbidostatError::from),
            Err(_) => Err(ComponentError::new(
                component,
                ComponentErrorKind::Timeout,
                format!("No response within {} ms", limit.as_millis()),
            )
            .into()),
        }
    }

    /// Measure one vial.
    ///
    /// The stirrer is slowed for the optical reading and set back to `High`
    /// afterwards, on the error path too.
    pub async fn measure_vial(&self, vial: u8) -> AppResult<VialMeasurements> {
        self.validate_vial(vial)?;

        let result = self.read_vial(vial).await;
        let restore = self
            .bounded(
                "stirrer",
                self.operation_timeout(),
                self.stirrer.set_speed(vial, StirrerSpeed::High),
            )
            .await;

        match (result, restore) {
            (Ok(measurements), Ok(())) => {
                debug!(
                    vial,
                    od = measurements.od(),
                    temperature = measurements.temperature(),
                    "Vial measured"
                );
                Ok(measurements)
            }
            (Ok(_), Err(e)) => Err(MorbidostatError::wrap_device("Measurement failed", e)),
            (Err(e), restore) => {
                if let Err(restore_err) = restore {
                    error!(vial, error = %restore_err, "Failed to restore stirrer speed");
                }
                Err(MorbidostatError::wrap_device("Measurement failed", e))
            }
        }
    }

    async fn read_vial(&self, vial: u8) -> AppResult<VialMeasurements> {
        let limit = self.operation_timeout();
        self.bounded("stirrer", limit, self.stirrer.set_speed(vial, StirrerSpeed::Low))
            .await?;
        let od = self
            .bounded("od_sensor", limit, self.od_sensor.measure_od(vial))
            .await?;
        let temperature = self
            .bounded("thermometer", limit, self.thermometer.measure_temperature())
            .await?;
        let rpm = self
            .bounded("stirrer", limit, self.stirrer.measure_rpm(vial))
            .await?;

        VialMeasurements::new(
            od.od,
            temperature.vials,
            Some(rpm),
            Some(od.signal_mv),
            od.blank_mv,
        )
        .map_err(|e| MorbidostatError::Device {
            message: format!("Implausible reading from vial {}: {}", vial, e),
            source: None,
        })
    }

    /// Read the blank (media only) signal of a vial.
    pub async fn measure_blank(&self, vial: u8) -> AppResult<f64> {
        self.validate_vial(vial)?;
        self.bounded(
            "od_sensor",
            self.operation_timeout(),
            self.od_sensor.measure_blank(vial),
        )
        .await
        .map_err(|e| MorbidostatError::wrap_device("Blank measurement failed", e))
    }

    /// Exchange liquid in one vial.
    ///
    /// Opens the vial valve, removes `media + drug` ml through the waste line,
    /// then adds media and drug in that order. The valve is closed on every
    /// exit path; any failure triggers an emergency stop before the error is
    /// returned.
    pub async fn make_dilution(
        &self,
        vial: u8,
        media_volume_ml: f64,
        drug_volume_ml: f64,
    ) -> AppResult<()> {
        self.validate_vial(vial)?;
        self.validate_volume("Media", media_volume_ml)?;
        self.validate_volume("Drug", drug_volume_ml)?;
        let total = media_volume_ml + drug_volume_ml;
        self.validate_volume("Total", total)?;

        info!(
            vial,
            media_ml = media_volume_ml,
            drug_ml = drug_volume_ml,
            "Starting dilution"
        );

        let result = self
            .exchange_liquid(vial, media_volume_ml, drug_volume_ml, total)
            .await;
        if let Err(e) = &result {
            error!(vial, error = %e, "Dilution failed, stopping all hardware");
            self.emergency_stop().await;
        }

        let closed = self.close_valve(vial).await;
        match (result, closed) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => {
                error!(vial, error = %e, "Valve did not close, stopping all hardware");
                self.emergency_stop().await;
                Err(MorbidostatError::wrap_device("Dilution failed", e))
            }
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    error!(vial, error = %close_err, "Failed to close valve after failed dilution");
                }
                Err(MorbidostatError::wrap_device("Dilution failed", e))
            }
        }
    }

    async fn exchange_liquid(
        &self,
        vial: u8,
        media_volume_ml: f64,
        drug_volume_ml: f64,
        total: f64,
    ) -> AppResult<()> {
        self.open_valve(vial).await?;
        if total > 0.0 {
            self.dispense(PumpRole::Waste, total).await?;
        }
        if media_volume_ml > 0.0 {
            self.dispense(PumpRole::Media, media_volume_ml).await?;
        }
        if drug_volume_ml > 0.0 {
            self.dispense(PumpRole::Drug, drug_volume_ml).await?;
        }
        Ok(())
    }

    async fn open_valve(&self, vial: u8) -> AppResult<()> {
        self.bounded("valves", self.operation_timeout(), self.valves.open(vial))
            .await?;
        self.events.valve_changed(vial, true);
        Ok(())
    }

    async fn close_valve(&self, vial: u8) -> AppResult<()> {
        self.bounded("valves", self.operation_timeout(), self.valves.close(vial))
            .await?;
        self.events.valve_changed(vial, false);
        Ok(())
    }

    async fn dispense(&self, role: PumpRole, volume_ml: f64) -> AppResult<()> {
        let pump = self.pump_for(role)?;
        let expected = Duration::try_from_secs_f64(volume_ml / pump.flow_rate_ml_per_s())
            .unwrap_or(Duration::MAX);
        let limit = self
            .operation_timeout()
            .saturating_add(expected.saturating_mul(2));

        let announce = !pump.is_pumping();
        if announce {
            self.events.pump_changed(role.id(), true);
        }
        let result = self
            .bounded(&format!("pump:{}", role), limit, pump.pump(volume_ml))
            .await;
        if let Err(e) = &result {
            let timed_out = e
                .component_error()
                .is_some_and(|cause| cause.kind == ComponentErrorKind::Timeout);
            if timed_out {
                // An abandoned dispense may leave the pump running
                if let Err(stop_err) = self
                    .bounded(&format!("pump:{}", role), self.operation_timeout(), pump.stop())
                    .await
                {
                    warn!(pump = %role, error = %stop_err, "Pump stop after timeout failed");
                }
            }
        }
        if announce {
            self.events.pump_changed(role.id(), false);
        }
        result
    }

    /// Run one pump directly.
    ///
    /// Invalid volumes are rejected without touching the pump.
    pub async fn pump(&self, role: PumpRole, volume_ml: f64) -> AppResult<()> {
        self.validate_volume("Pump", volume_ml)?;
        self.dispense(role, volume_ml).await
    }

    /// Open or close one valve directly.
    pub async fn set_valve(&self, vial: u8, open: bool) -> AppResult<()> {
        self.validate_vial(vial)?;
        if open {
            self.open_valve(vial).await
        } else {
            self.close_valve(vial).await
        }
    }

    /// Whether the valve of `vial` is open.
    pub fn valve_is_open(&self, vial: u8) -> AppResult<bool> {
        self.validate_vial(vial)?;
        Ok(self.valves.is_open(vial))
    }

    /// Activity of every pump.
    pub fn pump_status(&self) -> BTreeMap<PumpRole, PumpStatus> {
        self.pumps
            .iter()
            .map(|(role, pump)| {
                (
                    *role,
                    PumpStatus {
                        is_pumping: pump.is_pumping(),
                        pumped_volume_ml: pump.pumped_volume_ml(),
                    },
                )
            })
            .collect()
    }

    /// Drive the bench to its safe state.
    ///
    /// Stops every pump, every stirrer and closes every valve. Each action is
    /// attempted regardless of earlier failures; failures are logged and
    /// collected in the report.
    pub async fn emergency_stop(&self) -> EmergencyStopReport {
        warn!("Emergency stop");
        let limit = self.operation_timeout();
        let mut failures = Vec::new();

        let pump_stops = self.pumps.iter().map(|(role, pump)| async move {
            let was_pumping = pump.is_pumping();
            let result = self
                .bounded(&format!("pump:{}", role), limit, pump.stop())
                .await;
            (*role, was_pumping, result)
        });
        for (role, was_pumping, result) in join_all(pump_stops).await {
            match result {
                Ok(()) if was_pumping => self.events.pump_changed(role.id(), false),
                Ok(()) => {}
                Err(e) => {
                    error!(pump = %role, error = %e, "Failed to stop pump");
                    failures.push(format!("pump {}: {}", role, e));
                }
            }
        }

        if let Err(e) = self.bounded("stirrer", limit, self.stirrer.stop_all()).await {
            error!(error = %e, "Failed to stop stirrers");
            failures.push(format!("stirrer: {}", e));
        }

        let open_valves: Vec<u8> = (1..=self.config.n_vials)
            .filter(|vial| self.valves.is_open(*vial))
            .collect();
        match self.bounded("valves", limit, self.valves.close_all()).await {
            Ok(()) => {
                for vial in open_valves {
                    self.events.valve_changed(vial, false);
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to close valves");
                failures.push(format!("valves: {}", e));
            }
        }

        if failures.is_empty() {
            info!("Emergency stop completed");
        } else {
            error!(failures = failures.len(), "Emergency stop completed with failures");
        }
        EmergencyStopReport { failures }
    }

    /// Measure every vial, reporting failures per vial instead of aborting.
    pub async fn vial_status(&self) -> BTreeMap<u8, VialStatus> {
        let mut status = BTreeMap::new();
        for vial in 1..=self.config.n_vials {
            let entry = match self.measure_vial(vial).await {
                Ok(measurements) => VialStatus::from(measurements),
                Err(e) => {
                    warn!(vial, error = %e, "Vial status unavailable");
                    VialStatus::failed(e.to_string())
                }
            };
            status.insert(vial, entry);
        }
        status
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("pumps", &self.pumps.keys().collect::<Vec<_>>())
            .field("events", &self.events)
            .finish()
    }
}
