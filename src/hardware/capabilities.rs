//! Bioreactor Component Capabilities
//!
//! This module defines one capability trait per physical component of the
//! morbidostat bench. `Device` depends only on these traits, so a real driver
//! and a simulated component are interchangeable:
//!
//! - `Pump`: dispenses a volume of liquid (media, drug or waste line)
//! - `Valves`: one valve per vial, routing the shared lines into that vial
//! - `Stirrer`: per-vial stirring speed and RPM readback
//! - `OdSensor`: optical density per vial
//! - `Thermometer`: vial and board temperatures
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Reports failures as a structured `ComponentError`
//! - Takes `&self`; implementations use interior mutability for state
//!
//! # Example
//!
//! ```rust,ignore
//! async fn top_up(pump: &dyn Pump, ml: f64) -> ComponentResult<()> {
//!     if pump.is_pumping() {
//!         return Ok(());
//!     }
//!     pump.pump(ml).await
//! }
//! ```

use crate::error::ComponentResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role of a pump on the bench. The discriminant is the pump id used in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpRole {
    /// Fresh media line.
    Media = 1,
    /// Drug stock line.
    Drug = 2,
    /// Waste extraction line.
    Waste = 4,
}

impl PumpRole {
    /// All roles a bench must provide.
    pub const ALL: [PumpRole; 3] = [PumpRole::Media, PumpRole::Drug, PumpRole::Waste];

    /// Numeric pump id.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Look up a role by pump id.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(PumpRole::Media),
            2 => Some(PumpRole::Drug),
            4 => Some(PumpRole::Waste),
            _ => None,
        }
    }
}

impl std::fmt::Display for PumpRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpRole::Media => write!(f, "media"),
            PumpRole::Drug => write!(f, "drug"),
            PumpRole::Waste => write!(f, "waste"),
        }
    }
}

/// Stirring speed presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StirrerSpeed {
    /// Motor off.
    Stopped,
    /// Slow stirring while the OD is read.
    Low,
    /// Normal culture stirring.
    High,
}

impl StirrerSpeed {
    /// PWM duty cycle for this preset.
    pub fn duty_cycle(self) -> f64 {
        match self {
            StirrerSpeed::Stopped => 0.0,
            StirrerSpeed::Low => 0.3,
            StirrerSpeed::High => 0.8,
        }
    }

    /// Nominal motor speed for this preset.
    pub fn nominal_rpm(self) -> f64 {
        match self {
            StirrerSpeed::Stopped => 0.0,
            StirrerSpeed::Low => 400.0,
            StirrerSpeed::High => 1200.0,
        }
    }
}

impl std::fmt::Display for StirrerSpeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StirrerSpeed::Stopped => write!(f, "stopped"),
            StirrerSpeed::Low => write!(f, "low"),
            StirrerSpeed::High => write!(f, "high"),
        }
    }
}

/// One optical density reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OdReading {
    /// Optical density (dimensionless).
    pub od: f64,
    /// Raw photodiode signal in millivolts.
    pub signal_mv: f64,
    /// Blank (media only) signal in millivolts, when the sensor knows it.
    pub blank_mv: Option<f64>,
}

/// Temperatures reported by the thermometer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    /// Temperature of the vial block in °C.
    pub vials: f64,
    /// Temperature of the control board in °C.
    pub board: f64,
}

/// Capability: Liquid Dispensing
///
/// # Contract
/// - `pump` blocks for the dispense time (volume / flow rate)
/// - A concurrent `pump` on the same pump fails immediately with `Busy`; calls
///   are never queued
/// - `stop` interrupts an in-flight dispense and must succeed when idle
#[async_trait]
pub trait Pump: Send + Sync {
    /// Dispense `volume_ml` millilitres.
    async fn pump(&self, volume_ml: f64) -> ComponentResult<()>;

    /// Stop pumping immediately.
    async fn stop(&self) -> ComponentResult<()>;

    /// Whether a dispense is in progress.
    fn is_pumping(&self) -> bool;

    /// Total volume dispensed since creation.
    fn pumped_volume_ml(&self) -> f64;

    /// Calibrated flow rate in ml/s.
    fn flow_rate_ml_per_s(&self) -> f64;
}

/// Capability: Vial Valves
///
/// Vial ids are 1-based.
#[async_trait]
pub trait Valves: Send + Sync {
    /// Open the valve of `vial`.
    async fn open(&self, vial: u8) -> ComponentResult<()>;

    /// Close the valve of `vial`.
    async fn close(&self, vial: u8) -> ComponentResult<()>;

    /// Close every valve.
    async fn close_all(&self) -> ComponentResult<()>;

    /// Whether the valve of `vial` is open.
    fn is_open(&self, vial: u8) -> bool;
}

/// Capability: Stirring
#[async_trait]
pub trait Stirrer: Send + Sync {
    /// Set the stirring preset of `vial`.
    async fn set_speed(&self, vial: u8, speed: StirrerSpeed) -> ComponentResult<()>;

    /// Measure the motor speed of `vial`.
    async fn measure_rpm(&self, vial: u8) -> ComponentResult<f64>;

    /// Stop every stirrer.
    async fn stop_all(&self) -> ComponentResult<()>;
}

/// Capability: Optical Density
#[async_trait]
pub trait OdSensor: Send + Sync {
    /// Read the optical density of `vial`.
    async fn measure_od(&self, vial: u8) -> ComponentResult<OdReading>;

    /// Read the blank (reference) signal of `vial` in millivolts.
    async fn measure_blank(&self, vial: u8) -> ComponentResult<f64>;
}

/// Capability: Temperature
#[async_trait]
pub trait Thermometer: Send + Sync {
    /// Read the vial block and board temperatures.
    async fn measure_temperature(&self) -> ComponentResult<TemperatureReading>;
}
