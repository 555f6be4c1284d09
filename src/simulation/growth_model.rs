//! Growth and resistance model of a simulated vial.
//!
//! Growth rate combines a logistic dose-response curve keyed on IC50 with
//! carrying-capacity suppression:
//!
//! ```text
//! k      = ln 9 / (IC50 - IC10)
//! effect = mu_min + mu_max / (1 + exp(-k (IC50 - c)))
//! rate   = effect * (1 - od / capacity)
//! ```
//!
//! Resistance evolves as `IC50 *= exp(adapt * dt)` where the adaptation rate is
//! a Gaussian in the distance between the drug concentration and IC50. Drug
//! close to IC50 selects hardest for resistance; far below or far above it
//! there is little selective pressure.

use crate::error::{AppResult, MorbidostatError};
use serde::{Deserialize, Serialize};

/// Growth model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthModelParameters {
    /// OD at inoculation.
    pub initial_od: f64,
    /// Drug-free doubling time in minutes.
    pub doubling_time_minutes: f64,
    /// OD at which growth stops.
    pub carrying_capacity: f64,
    /// Growth rate under full inhibition, per hour.
    pub min_growth_rate: f64,
    /// Initial IC50.
    pub ic50_initial: f64,
    /// IC10 as a fraction of IC50.
    pub ic10_ic50_ratio: f64,
    /// Peak adaptation rate, per hour.
    pub adaptation_rate_max: f64,
    /// Adaptation rate at IC10 relative to the peak at IC50.
    pub adaptation_rate_ic10_ic50_ratio: f64,
}

impl Default for GrowthModelParameters {
    fn default() -> Self {
        Self {
            initial_od: 0.05,
            doubling_time_minutes: 20.0,
            carrying_capacity: 0.9,
            min_growth_rate: -0.1,
            ic50_initial: 5.0,
            ic10_ic50_ratio: 0.5,
            adaptation_rate_max: 0.08,
            adaptation_rate_ic10_ic50_ratio: 0.8,
        }
    }
}

impl GrowthModelParameters {
    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        let positive = [
            ("initial_od", self.initial_od),
            ("doubling_time_minutes", self.doubling_time_minutes),
            ("carrying_capacity", self.carrying_capacity),
            ("ic50_initial", self.ic50_initial),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(MorbidostatError::Validation(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        let ratios = [
            ("ic10_ic50_ratio", self.ic10_ic50_ratio),
            (
                "adaptation_rate_ic10_ic50_ratio",
                self.adaptation_rate_ic10_ic50_ratio,
            ),
        ];
        for (name, value) in ratios {
            if !(value > 0.0 && value < 1.0) {
                return Err(MorbidostatError::Validation(format!(
                    "{} must be in (0, 1), got {}",
                    name, value
                )));
            }
        }
        if !(self.adaptation_rate_max.is_finite() && self.adaptation_rate_max >= 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "adaptation_rate_max must be non-negative, got {}",
                self.adaptation_rate_max
            )));
        }
        if !self.min_growth_rate.is_finite() {
            return Err(MorbidostatError::Validation(
                "min_growth_rate must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Drug-free maximum growth rate per hour.
    pub fn max_growth_rate(&self) -> f64 {
        std::f64::consts::LN_2 / (self.doubling_time_minutes / 60.0)
    }
}

/// State of one simulated culture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowthModel {
    params: GrowthModelParameters,
    od: f64,
    drug_concentration: f64,
    ic50: f64,
}

impl GrowthModel {
    /// Inoculate a drug-free culture.
    pub fn new(params: GrowthModelParameters) -> Self {
        Self {
            od: params.initial_od,
            drug_concentration: 0.0,
            ic50: params.ic50_initial,
            params,
        }
    }

    /// Current OD.
    pub fn od(&self) -> f64 {
        self.od
    }

    /// Current drug concentration.
    pub fn drug_concentration(&self) -> f64 {
        self.drug_concentration
    }

    /// Current resistance level.
    pub fn ic50(&self) -> f64 {
        self.ic50
    }

    /// Model parameters.
    pub fn params(&self) -> &GrowthModelParameters {
        &self.params
    }

    /// Overwrite the OD, e.g. to reproduce a scenario in a test.
    pub fn set_od(&mut self, od: f64) {
        self.od = od.max(0.0);
    }

    fn ic10(&self) -> f64 {
        self.ic50 * self.params.ic10_ic50_ratio
    }

    /// Growth rate per hour at the current state.
    pub fn growth_rate(&self) -> f64 {
        let ic10 = self.ic10();
        let k = 9.0_f64.ln() / (self.ic50 - ic10);
        let effect = self.params.min_growth_rate
            + self.params.max_growth_rate()
                / (1.0 + (-k * (self.ic50 - self.drug_concentration)).exp());
        effect * (1.0 - self.od / self.params.carrying_capacity)
    }

    /// IC50 adaptation rate per hour at the current drug concentration.
    pub fn adaptation_rate(&self) -> f64 {
        let spread = self.ic10() - self.ic50;
        let k = -self.params.adaptation_rate_ic10_ic50_ratio.ln() / (spread * spread);
        let distance = self.drug_concentration - self.ic50;
        self.params.adaptation_rate_max * (-k * distance * distance).exp()
    }

    /// Integrate forward by `timestep_minutes` with one exponential step.
    pub fn update(&mut self, timestep_minutes: f64) {
        let hours = timestep_minutes / 60.0;
        let rate = self.growth_rate();
        let adaptation = self.adaptation_rate();
        self.od *= (rate * hours).exp();
        self.ic50 *= (adaptation * hours).exp();
    }

    /// Dilute by `factor` and set the resulting drug concentration.
    pub fn dilute(&mut self, factor: f64, new_concentration: f64) -> AppResult<()> {
        if !(factor.is_finite() && factor >= 1.0) {
            return Err(MorbidostatError::Validation(format!(
                "Dilution factor must be at least 1, got {}",
                factor
            )));
        }
        if !(new_concentration.is_finite() && new_concentration >= 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "Drug concentration must be non-negative, got {}",
                new_concentration
            )));
        }
        self.od /= factor;
        self.drug_concentration = new_concentration;
        Ok(())
    }
}
