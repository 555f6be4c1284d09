//! Simulated morbidostat bench.
//!
//! Provides simulated implementations of every component capability, backed
//! by a [`SimulatedBench`] that evolves one growth model per vial. Used to
//! validate the control loop without hardware.
//!
//! # Example
//!
//! ```rust,ignore
//! let rig = SimulationBuilder::new(SimulationConfig::default())
//!     .mode(MockMode::Instant)
//!     .seed(7)
//!     .build()?;
//! let measurement = rig.device.measure_vial(1).await?;
//! rig.bench.advance_minutes(10.0);
//! ```

pub mod bench;
pub mod components;
pub mod errors;
pub mod growth_model;
pub mod mode;
pub mod rng;

pub use bench::SimulatedBench;
pub use components::{
    SimulatedOdSensor, SimulatedPump, SimulatedStirrer, SimulatedThermometer, SimulatedValves,
};
pub use errors::{ErrorConfig, ErrorScenario};
pub use growth_model::{GrowthModel, GrowthModelParameters};
pub use mode::MockMode;
pub use rng::MockRng;

use crate::clock::SimulatedClock;
use crate::error::{AppResult, MorbidostatError};
use crate::hardware::{Device, DeviceComponents, DeviceConfig, DeviceEvents, Pump, PumpRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Simulation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Growth model parameters shared by every vial.
    pub growth_model: GrowthModelParameters,
    /// Simulated minutes per wall-clock minute.
    pub time_acceleration: f64,
    /// RNG seed for reproducible noise.
    pub seed: Option<u64>,
    /// Flow rate of every pump, in ml/s.
    pub pump_flow_rate_ml_per_s: f64,
    /// Sleep for physical action times.
    pub realistic_timing: bool,
    /// Relative OD measurement noise.
    pub od_noise: f64,
    /// Drug concentration of the stock solution.
    pub drug_stock_concentration: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            growth_model: GrowthModelParameters::default(),
            time_acceleration: 1.0,
            seed: None,
            pump_flow_rate_ml_per_s: 1.0,
            realistic_timing: true,
            od_noise: 0.005,
            drug_stock_concentration: 100.0,
        }
    }
}

impl SimulationConfig {
    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        self.growth_model.validate()?;
        if !(self.time_acceleration.is_finite() && self.time_acceleration > 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "time_acceleration must be positive, got {}",
                self.time_acceleration
            )));
        }
        if !(self.pump_flow_rate_ml_per_s.is_finite() && self.pump_flow_rate_ml_per_s > 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "pump_flow_rate_ml_per_s must be positive, got {}",
                self.pump_flow_rate_ml_per_s
            )));
        }
        if !(0.0..1.0).contains(&self.od_noise) {
            return Err(MorbidostatError::Validation(format!(
                "od_noise must be in [0, 1), got {}",
                self.od_noise
            )));
        }
        if !(self.drug_stock_concentration.is_finite() && self.drug_stock_concentration >= 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "drug_stock_concentration must be non-negative, got {}",
                self.drug_stock_concentration
            )));
        }
        Ok(())
    }

    /// Timing mode implied by `realistic_timing`.
    pub fn mode(&self) -> MockMode {
        if self.realistic_timing {
            MockMode::Realistic
        } else {
            MockMode::Instant
        }
    }
}

/// Component of a simulated bench, used to target failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimComponent {
    /// One pump.
    Pump(PumpRole),
    /// The valve block.
    Valves,
    /// The stirrer driver.
    Stirrer,
    /// The OD sensor.
    OdSensor,
    /// The thermometer.
    Thermometer,
}

/// A fully wired simulated bench.
pub struct SimulatedRig {
    /// The device, as the controller sees it.
    pub device: Arc<Device>,
    /// Physical state behind the device.
    pub bench: Arc<SimulatedBench>,
    /// Clock advanced with the bench.
    pub clock: Arc<SimulatedClock>,
    /// Pumps, for inspecting dispensed volumes.
    pub pumps: BTreeMap<PumpRole, Arc<SimulatedPump>>,
    /// Stirrer driver, for inspecting presets.
    pub stirrer: Arc<SimulatedStirrer>,
}

/// Builder wiring simulated components into a `Device`.
pub struct SimulationBuilder {
    config: SimulationConfig,
    device_config: DeviceConfig,
    vial_volume_ml: f64,
    mode: MockMode,
    start_time: Option<DateTime<Utc>>,
    events: DeviceEvents,
    errors: HashMap<SimComponent, ErrorConfig>,
}

impl SimulationBuilder {
    /// Start from a simulation config; timing follows `realistic_timing`.
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            mode: config.mode(),
            config,
            device_config: DeviceConfig::default(),
            vial_volume_ml: 12.0,
            start_time: None,
            events: DeviceEvents::new(),
            errors: HashMap::new(),
        }
    }

    /// Device configuration.
    pub fn device_config(mut self, device_config: DeviceConfig) -> Self {
        self.device_config = device_config;
        self
    }

    /// Working volume of each vial, in ml.
    pub fn vial_volume_ml(mut self, volume_ml: f64) -> Self {
        self.vial_volume_ml = volume_ml;
        self
    }

    /// Override the timing mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Seed the component RNG.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Simulated start time.
    pub fn start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Device event listeners.
    pub fn events(mut self, events: DeviceEvents) -> Self {
        self.events = events;
        self
    }

    /// Inject failures into one component.
    pub fn with_errors(mut self, component: SimComponent, errors: ErrorConfig) -> Self {
        self.errors.insert(component, errors);
        self
    }

    fn errors_for(&self, component: SimComponent) -> ErrorConfig {
        self.errors.get(&component).cloned().unwrap_or_default()
    }

    /// Build the rig.
    pub fn build(self) -> AppResult<SimulatedRig> {
        self.config.validate()?;
        self.device_config.validate()?;
        if !(self.vial_volume_ml.is_finite() && self.vial_volume_ml > 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "vial_volume_ml must be positive, got {}",
                self.vial_volume_ml
            )));
        }

        let clock = Arc::new(match self.start_time {
            Some(start) => SimulatedClock::new(start),
            None => SimulatedClock::starting_now(),
        });
        let bench = Arc::new(SimulatedBench::new(
            self.device_config.n_vials,
            self.config.growth_model.clone(),
            self.vial_volume_ml,
            self.config.drug_stock_concentration,
            Arc::clone(&clock),
        ));
        let rng = Arc::new(MockRng::new(self.config.seed));

        let mut pumps = BTreeMap::new();
        let mut pump_traits: BTreeMap<PumpRole, Arc<dyn Pump>> = BTreeMap::new();
        for role in PumpRole::ALL {
            let pump = Arc::new(
                SimulatedPump::new(role, self.config.pump_flow_rate_ml_per_s, Arc::clone(&bench))
                    .with_mode(self.mode)
                    .with_errors(self.errors_for(SimComponent::Pump(role))),
            );
            pump_traits.insert(role, pump.clone() as Arc<dyn Pump>);
            pumps.insert(role, pump);
        }

        let stirrer = Arc::new(
            SimulatedStirrer::new(self.device_config.n_vials, Arc::clone(&rng))
                .with_mode(self.mode)
                .with_errors(self.errors_for(SimComponent::Stirrer)),
        );
        let components = DeviceComponents {
            pumps: pump_traits,
            valves: Arc::new(
                SimulatedValves::new(Arc::clone(&bench))
                    .with_mode(self.mode)
                    .with_errors(self.errors_for(SimComponent::Valves)),
            ),
            stirrer: stirrer.clone(),
            od_sensor: Arc::new(
                SimulatedOdSensor::new(Arc::clone(&bench), Arc::clone(&rng), self.config.od_noise)
                    .with_mode(self.mode)
                    .with_errors(self.errors_for(SimComponent::OdSensor)),
            ),
            thermometer: Arc::new(
                SimulatedThermometer::new(rng)
                    .with_errors(self.errors_for(SimComponent::Thermometer)),
            ),
        };

        let device = Arc::new(Device::new(self.device_config, components, self.events)?);
        tracing::info!(
            n_vials = device.n_vials(),
            mode = ?self.mode,
            seed = ?self.config.seed,
            "Simulated bench ready"
        );

        Ok(SimulatedRig {
            device,
            bench,
            clock,
            pumps,
            stirrer,
        })
    }
}
