//! # Morbidostat Core Library
//!
//! Control software for a multi-vial morbidostat: a continuous-culture
//! bioreactor that keeps microbial populations under steadily increasing
//! antibiotic pressure to drive the evolution of drug resistance.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: capability traits for pumps, valves, stirrer, OD sensor and
//!   thermometer, plus the [`Device`] facade enforcing safety invariants
//!   (valve always closed after a dilution, emergency stop never fails).
//! - **`simulation`**: a simulated bench whose vials follow a pharmacodynamic
//!   growth model with evolving resistance, with failure injection.
//! - **`culture`**: per-vial measurement, drug concentration and generation
//!   history, growth-rate estimation and dilution.
//! - **`protocol`**: the morbidostat feedback rule and the turbidostat and
//!   chemostat variants.
//! - **`experiment`**: run lifecycle over all vials, snapshots and persistence.
//! - **`runner`**: the background control loop with optional time acceleration.
//! - **`config`**, **`logging`**, **`error`**, **`clock`**: ambient support.

pub mod clock;
pub mod config;
pub mod culture;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod protocol;
pub mod runner;
pub mod simulation;

pub use clock::{Clock, SimulatedClock, SystemClock};
pub use config::AppConfig;
pub use culture::{Culture, CultureConfig, CultureStatus, VialMeasurements};
pub use error::{AppResult, ComponentError, ComponentErrorKind, MorbidostatError};
pub use experiment::{Experiment, ExperimentConfig, ExperimentSnapshot, ExperimentStatus};
pub use hardware::{Device, DeviceConfig};
pub use protocol::{ControlAction, GrowthControlProtocol, MorbidostatConfig, MorbidostatProtocol};
pub use runner::{ExperimentRunner, RunnerConfig, SimulationHook};
pub use simulation::{SimulationBuilder, SimulationConfig};
