//! Application configuration using Figment
//!
//! Configuration is merged from, in increasing priority:
//! 1. built-in defaults (every section is `#[serde(default)]`)
//! 2. a TOML file
//! 3. environment variables prefixed with `MORBIDOSTAT_`, nested keys
//!    separated by `__`
//!
//! # Example
//! ```no_run
//! use morbidostat::config::AppConfig;
//!
//! // MORBIDOSTAT_EXPERIMENT__MEASUREMENT_INTERVAL_MINUTES=5 overrides the file
//! let config = AppConfig::load_from("config/morbidostat.toml")?;
//! config.validate()?;
//! # Ok::<(), morbidostat::MorbidostatError>(())
//! ```

use crate::error::{AppResult, MorbidostatError};
use crate::experiment::ExperimentConfig;
use crate::protocol::{
    ChemostatConfig, ChemostatProtocol, GrowthControlProtocol, MorbidostatConfig,
    MorbidostatProtocol, TurbidostatConfig, TurbidostatProtocol,
};
use crate::runner::RunnerConfig;
use crate::simulation::SimulationConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MORBIDOSTAT_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Experiment, culture and device settings
    pub experiment: ExperimentConfig,
    /// Control protocol selection and parameters
    pub protocol: ProtocolSettings,
    /// Simulated bench
    pub simulation: SimulationConfig,
    /// Control loop
    pub runner: RunnerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "morbidostat".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Which control protocol runs the experiment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Drug-feedback selection
    #[default]
    Morbidostat,
    /// Constant density
    Turbidostat,
    /// Constant dilution
    Chemostat,
}

/// Protocol selection plus parameters of every protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Active protocol
    pub kind: ProtocolKind,
    /// Morbidostat parameters
    pub morbidostat: MorbidostatConfig,
    /// Turbidostat parameters
    pub turbidostat: TurbidostatConfig,
    /// Chemostat parameters
    pub chemostat: ChemostatConfig,
}

impl ProtocolSettings {
    /// Instantiate the selected protocol.
    pub fn build(&self) -> AppResult<Box<dyn GrowthControlProtocol>> {
        Ok(match self.kind {
            ProtocolKind::Morbidostat => {
                Box::new(MorbidostatProtocol::new(self.morbidostat.clone())?)
            }
            ProtocolKind::Turbidostat => Box::new(TurbidostatProtocol::new(self.turbidostat.clone())),
            ProtocolKind::Chemostat => Box::new(ChemostatProtocol::new(self.chemostat.clone())),
        })
    }

    /// Highest drug concentration the selected protocol can request.
    fn max_requested_concentration(&self) -> f64 {
        match self.kind {
            ProtocolKind::Morbidostat => self.morbidostat.max_drug_concentration,
            ProtocolKind::Turbidostat => 0.0,
            ProtocolKind::Chemostat => self.chemostat.drug_concentration,
        }
    }
}

impl AppConfig {
    /// Load defaults overridden by environment variables only
    pub fn load() -> AppResult<Self> {
        Self::figment().extract().map_err(MorbidostatError::from)
    }

    /// Load configuration from a TOML file and environment variables
    ///
    /// A missing file falls back to the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(MorbidostatError::from)
    }

    fn figment() -> Figment {
        Figment::new().merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(MorbidostatError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        self.experiment.validate()?;
        self.protocol.morbidostat.validate()?;
        self.protocol.turbidostat.validate()?;
        self.protocol.chemostat.validate()?;
        self.simulation.validate()?;
        self.runner.validate()?;

        let culture_max = self.experiment.culture.max_drug_concentration;
        let requested = self.protocol.max_requested_concentration();
        if requested > culture_max {
            return Err(MorbidostatError::Validation(format!(
                "Protocol {:?} may request drug concentration {} above the culture maximum {}",
                self.protocol.kind, requested, culture_max
            )));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> AppResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
