//! Growth control protocols.
//!
//! A protocol runs once per vial per experiment update: it measures the
//! culture, decides on an action and executes it through the culture. The
//! morbidostat protocol holds growth rate near a target by raising the drug
//! concentration when the culture grows too fast and lowering it when growth
//! slows.
//!
//! # Decision table
//!
//! ```text
//! growth rate unavailable          -> no action
//! rate < min_growth_rate           -> rescue dilution to current / step
//! od < od_threshold                -> no action
//! |rate - target| <= tolerance     -> maintain (dilute at current concentration)
//! rate > target                    -> increase drug to min(max, current * step)
//! rate < target                    -> decrease drug to current / step
//! ```

use crate::culture::{validate_window, Culture};
use crate::error::{AppResult, MorbidostatError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Control action chosen for one vial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    /// Growth has collapsed; dilute with less drug.
    RescueDilution {
        /// Drug concentration after the dilution.
        target_concentration: f64,
    },
    /// Growth is on target; dilute at the current concentration.
    Maintain {
        /// Drug concentration after the dilution.
        target_concentration: f64,
    },
    /// Growing too fast; dilute with more drug.
    IncreaseDrug {
        /// Drug concentration after the dilution.
        target_concentration: f64,
    },
    /// Growing too slowly; dilute with less drug.
    DecreaseDrug {
        /// Drug concentration after the dilution.
        target_concentration: f64,
    },
}

impl ControlAction {
    /// Drug concentration the action dilutes to.
    pub fn target_concentration(&self) -> f64 {
        match *self {
            ControlAction::RescueDilution {
                target_concentration,
            }
            | ControlAction::Maintain {
                target_concentration,
            }
            | ControlAction::IncreaseDrug {
                target_concentration,
            }
            | ControlAction::DecreaseDrug {
                target_concentration,
            } => target_concentration,
        }
    }

    /// Short action name.
    pub fn name(&self) -> &'static str {
        match self {
            ControlAction::RescueDilution { .. } => "rescue_dilution",
            ControlAction::Maintain { .. } => "maintain",
            ControlAction::IncreaseDrug { .. } => "increase_drug",
            ControlAction::DecreaseDrug { .. } => "decrease_drug",
        }
    }
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} to {:.3}", self.name(), self.target_concentration())
    }
}

/// One protocol evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRecord {
    /// When the evaluation ran.
    pub timestamp: DateTime<Utc>,
    /// Vial evaluated.
    pub vial: u8,
    /// OD measured for the decision.
    pub od: f64,
    /// Growth rate used for the decision.
    pub growth_rate: Option<f64>,
    /// Drug concentration before the action.
    pub drug_concentration: f64,
    /// Action taken, if any.
    pub action: Option<ControlAction>,
}

/// Summary of a protocol's state.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolStatus {
    /// Protocol name.
    pub name: &'static str,
    /// Protocol parameters.
    pub config: serde_json::Value,
    /// Number of recorded evaluations.
    pub history_len: usize,
    /// Latest evaluation.
    pub latest: Option<ProtocolRecord>,
}

/// A per-vial control policy.
#[async_trait]
pub trait GrowthControlProtocol: Send + Sync {
    /// Protocol name.
    fn name(&self) -> &'static str;

    /// Measure `culture`, decide and execute one action.
    async fn update(&mut self, culture: &mut Culture) -> AppResult<ProtocolRecord>;

    /// Every evaluation so far, oldest first.
    fn history(&self) -> &[ProtocolRecord];

    /// Protocol parameters as JSON.
    fn config_json(&self) -> serde_json::Value;

    /// Status summary.
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus {
            name: self.name(),
            config: self.config_json(),
            history_len: self.history().len(),
            latest: self.history().last().cloned(),
        }
    }
}

/// Execute `action` on `culture` and append the resulting record.
async fn apply(
    history: &mut Vec<ProtocolRecord>,
    culture: &mut Culture,
    od: f64,
    growth_rate: Option<f64>,
    action: Option<ControlAction>,
) -> AppResult<ProtocolRecord> {
    let drug_concentration = culture.current_drug_concentration();
    if let Some(action) = action {
        info!(vial = culture.vial(), od, growth_rate = ?growth_rate, %action, "Protocol action");
        culture
            .make_dilution(Some(action.target_concentration()))
            .await?;
    }
    let record = ProtocolRecord {
        timestamp: culture.now(),
        vial: culture.vial(),
        od,
        growth_rate,
        drug_concentration,
        action,
    };
    history.push(record.clone());
    Ok(record)
}

// =============================================================================
// Morbidostat
// =============================================================================

/// Morbidostat parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MorbidostatConfig {
    /// OD below which the culture is left alone.
    pub od_threshold: f64,
    /// Growth rate to hold, per hour.
    pub target_growth_rate: f64,
    /// Accepted deviation from the target, per hour.
    pub growth_rate_tolerance: f64,
    /// Growth rate below which a rescue dilution is made.
    pub min_growth_rate: f64,
    /// Upper bound of the drug concentration.
    pub max_drug_concentration: f64,
    /// Multiplicative step for drug changes; must be greater than 1.
    pub drug_concentration_step: f64,
    /// Growth-rate window, in minutes.
    pub measurement_window_minutes: f64,
    /// Concentration used when increasing from zero drug.
    ///
    /// Zero keeps the purely multiplicative rule, under which a drug-free
    /// culture never receives drug.
    pub drug_seed_concentration: f64,
}

impl Default for MorbidostatConfig {
    fn default() -> Self {
        Self {
            od_threshold: 0.3,
            target_growth_rate: 0.15,
            growth_rate_tolerance: 0.05,
            min_growth_rate: -0.1,
            max_drug_concentration: 100.0,
            drug_concentration_step: 1.5,
            measurement_window_minutes: 30.0,
            drug_seed_concentration: 0.0,
        }
    }
}

impl MorbidostatConfig {
    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.od_threshold.is_finite() && self.od_threshold >= 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "od_threshold must be non-negative, got {}",
                self.od_threshold
            )));
        }
        if !(self.growth_rate_tolerance.is_finite() && self.growth_rate_tolerance >= 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "growth_rate_tolerance must be non-negative, got {}",
                self.growth_rate_tolerance
            )));
        }
        if !(self.target_growth_rate.is_finite() && self.min_growth_rate.is_finite()) {
            return Err(MorbidostatError::Validation(
                "target_growth_rate and min_growth_rate must be finite".to_string(),
            ));
        }
        if !(self.max_drug_concentration.is_finite() && self.max_drug_concentration > 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "max_drug_concentration must be positive, got {}",
                self.max_drug_concentration
            )));
        }
        if !(self.drug_concentration_step.is_finite() && self.drug_concentration_step > 1.0) {
            return Err(MorbidostatError::Validation(format!(
                "drug_concentration_step must be greater than 1, got {}",
                self.drug_concentration_step
            )));
        }
        validate_window("measurement_window_minutes", self.measurement_window_minutes)?;
        if !(0.0..=self.max_drug_concentration).contains(&self.drug_seed_concentration) {
            return Err(MorbidostatError::Validation(format!(
                "drug_seed_concentration must be within [0, {}], got {}",
                self.max_drug_concentration, self.drug_seed_concentration
            )));
        }
        Ok(())
    }
}

/// Feedback protocol holding growth rate near a target.
#[derive(Debug, Clone)]
pub struct MorbidostatProtocol {
    config: MorbidostatConfig,
    history: Vec<ProtocolRecord>,
}

impl MorbidostatProtocol {
    /// Create a protocol.
    pub fn new(config: MorbidostatConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            history: Vec::new(),
        })
    }

    /// Protocol parameters.
    pub fn config(&self) -> &MorbidostatConfig {
        &self.config
    }

    /// Decide the action for one vial.
    pub fn decide(&self, od: f64, growth_rate: Option<f64>, current: f64) -> Option<ControlAction> {
        let cfg = &self.config;
        let rate = growth_rate?;

        if rate < cfg.min_growth_rate {
            return Some(ControlAction::RescueDilution {
                target_concentration: (current / cfg.drug_concentration_step).max(0.0),
            });
        }
        if od < cfg.od_threshold {
            return None;
        }

        let growth_error = rate - cfg.target_growth_rate;
        if growth_error.abs() <= cfg.growth_rate_tolerance {
            Some(ControlAction::Maintain {
                target_concentration: current,
            })
        } else if growth_error > 0.0 {
            let raised = if current > 0.0 {
                current * cfg.drug_concentration_step
            } else {
                cfg.drug_seed_concentration
            };
            Some(ControlAction::IncreaseDrug {
                target_concentration: raised.min(cfg.max_drug_concentration),
            })
        } else {
            Some(ControlAction::DecreaseDrug {
                target_concentration: current / cfg.drug_concentration_step,
            })
        }
    }
}

#[async_trait]
impl GrowthControlProtocol for MorbidostatProtocol {
    fn name(&self) -> &'static str {
        "morbidostat"
    }

    async fn update(&mut self, culture: &mut Culture) -> AppResult<ProtocolRecord> {
        let measurement = culture.measure().await?;
        let growth_rate = culture.calculate_growth_rate(self.config.measurement_window_minutes);
        let action = self.decide(
            measurement.od(),
            growth_rate,
            culture.current_drug_concentration(),
        );
        apply(&mut self.history, culture, measurement.od(), growth_rate, action).await
    }

    fn history(&self) -> &[ProtocolRecord] {
        &self.history
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }
}

// =============================================================================
// Turbidostat
// =============================================================================

/// Turbidostat parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurbidostatConfig {
    /// OD at which the culture is diluted.
    pub od_threshold: f64,
    /// Growth-rate window, in minutes.
    pub measurement_window_minutes: f64,
}

impl Default for TurbidostatConfig {
    fn default() -> Self {
        Self {
            od_threshold: 0.3,
            measurement_window_minutes: 30.0,
        }
    }
}

impl TurbidostatConfig {
    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.od_threshold.is_finite() && self.od_threshold >= 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "od_threshold must be non-negative, got {}",
                self.od_threshold
            )));
        }
        validate_window("measurement_window_minutes", self.measurement_window_minutes)
    }
}

/// Holds OD below a threshold at a constant drug concentration.
#[derive(Debug, Clone, Default)]
pub struct TurbidostatProtocol {
    config: TurbidostatConfig,
    history: Vec<ProtocolRecord>,
}

impl TurbidostatProtocol {
    /// Create a protocol.
    pub fn new(config: TurbidostatConfig) -> Self {
        Self {
            config,
            history: Vec::new(),
        }
    }
}

#[async_trait]
impl GrowthControlProtocol for TurbidostatProtocol {
    fn name(&self) -> &'static str {
        "turbidostat"
    }

    async fn update(&mut self, culture: &mut Culture) -> AppResult<ProtocolRecord> {
        let measurement = culture.measure().await?;
        let growth_rate = culture.calculate_growth_rate(self.config.measurement_window_minutes);
        let action = (measurement.od() >= self.config.od_threshold).then(|| {
            ControlAction::Maintain {
                target_concentration: culture.current_drug_concentration(),
            }
        });
        apply(&mut self.history, culture, measurement.od(), growth_rate, action).await
    }

    fn history(&self) -> &[ProtocolRecord] {
        &self.history
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }
}

// =============================================================================
// Chemostat
// =============================================================================

/// Chemostat parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChemostatConfig {
    /// Drug concentration every dilution targets.
    pub drug_concentration: f64,
    /// Growth-rate window, in minutes.
    pub measurement_window_minutes: f64,
}

impl Default for ChemostatConfig {
    fn default() -> Self {
        Self {
            drug_concentration: 0.0,
            measurement_window_minutes: 30.0,
        }
    }
}

impl ChemostatConfig {
    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.drug_concentration.is_finite() && self.drug_concentration >= 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "drug_concentration must be non-negative, got {}",
                self.drug_concentration
            )));
        }
        validate_window("measurement_window_minutes", self.measurement_window_minutes)
    }
}

/// Dilutes every update at a fixed drug concentration.
#[derive(Debug, Clone, Default)]
pub struct ChemostatProtocol {
    config: ChemostatConfig,
    history: Vec<ProtocolRecord>,
}

impl ChemostatProtocol {
    /// Create a protocol.
    pub fn new(config: ChemostatConfig) -> Self {
        Self {
            config,
            history: Vec::new(),
        }
    }
}

#[async_trait]
impl GrowthControlProtocol for ChemostatProtocol {
    fn name(&self) -> &'static str {
        "chemostat"
    }

    async fn update(&mut self, culture: &mut Culture) -> AppResult<ProtocolRecord> {
        let measurement = culture.measure().await?;
        let growth_rate = culture.calculate_growth_rate(self.config.measurement_window_minutes);
        let action = Some(ControlAction::Maintain {
            target_concentration: self.config.drug_concentration,
        });
        apply(&mut self.history, culture, measurement.od(), growth_rate, action).await
    }

    fn history(&self) -> &[ProtocolRecord] {
        &self.history
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> MorbidostatProtocol {
        MorbidostatProtocol::new(MorbidostatConfig {
            od_threshold: 0.3,
            target_growth_rate: 0.15,
            growth_rate_tolerance: 0.05,
            min_growth_rate: -0.1,
            drug_concentration_step: 1.5,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_no_growth_rate_means_no_action() {
        assert_eq!(protocol().decide(0.5, None, 10.0), None);
    }

    #[test]
    fn test_below_threshold_no_action() {
        assert_eq!(protocol().decide(0.2, Some(0.3), 10.0), None);
    }

    #[test]
    fn test_on_target_maintains() {
        assert_eq!(
            protocol().decide(0.4, Some(0.15), 10.0),
            Some(ControlAction::Maintain {
                target_concentration: 10.0
            })
        );
        // Tolerance edge still maintains
        assert!(matches!(
            protocol().decide(0.4, Some(0.19), 10.0),
            Some(ControlAction::Maintain { .. })
        ));
    }

    #[test]
    fn test_fast_growth_increases_drug() {
        assert_eq!(
            protocol().decide(0.4, Some(0.30), 10.0),
            Some(ControlAction::IncreaseDrug {
                target_concentration: 15.0
            })
        );
    }

    #[test]
    fn test_increase_is_capped() {
        assert_eq!(
            protocol().decide(0.4, Some(0.30), 80.0),
            Some(ControlAction::IncreaseDrug {
                target_concentration: 100.0
            })
        );
    }

    #[test]
    fn test_increase_from_zero_uses_seed() {
        assert_eq!(
            protocol().decide(0.4, Some(0.30), 0.0),
            Some(ControlAction::IncreaseDrug {
                target_concentration: 0.0
            })
        );

        let seeded = MorbidostatProtocol::new(MorbidostatConfig {
            drug_seed_concentration: 1.0,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            seeded.decide(0.4, Some(0.30), 0.0),
            Some(ControlAction::IncreaseDrug {
                target_concentration: 1.0
            })
        );
    }

    #[test]
    fn test_slow_growth_decreases_drug() {
        assert_eq!(
            protocol().decide(0.4, Some(0.0), 15.0),
            Some(ControlAction::DecreaseDrug {
                target_concentration: 10.0
            })
        );
    }

    #[test]
    fn test_collapse_triggers_rescue() {
        assert_eq!(
            protocol().decide(0.4, Some(-0.15), 15.0),
            Some(ControlAction::RescueDilution {
                target_concentration: 10.0
            })
        );
        // Rescue applies even below the OD threshold
        assert!(matches!(
            protocol().decide(0.1, Some(-0.15), 15.0),
            Some(ControlAction::RescueDilution { .. })
        ));
    }

    #[test]
    fn test_config_validation() {
        let config = MorbidostatConfig {
            drug_concentration_step: 1.0,
            ..Default::default()
        };
        assert!(MorbidostatProtocol::new(config).is_err());

        let config = MorbidostatConfig {
            drug_seed_concentration: 500.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_action_display() {
        let action = ControlAction::IncreaseDrug {
            target_concentration: 15.0,
        };
        assert_eq!(action.to_string(), "increase_drug to 15.000");
        assert_eq!(action.target_concentration(), 15.0);
    }
}
