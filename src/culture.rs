//! Per-vial culture state.
//!
//! A [`Culture`] accumulates the time series of one vial: every measurement,
//! every drug concentration and the cumulative generation count. The histories
//! are append-only and their timestamps never decrease, so the current drug
//! concentration and generation count are always the last entries.

use crate::clock::Clock;
use crate::error::{AppResult, MorbidostatError};
use crate::hardware::{Device, DeviceConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Longest accepted growth-rate window: one year, in minutes.
pub const MAX_WINDOW_MINUTES: f64 = 525_600.0;

/// Check a growth-rate window length.
pub fn validate_window(name: &str, minutes: f64) -> AppResult<()> {
    if !(minutes.is_finite() && minutes > 0.0 && minutes <= MAX_WINDOW_MINUTES) {
        return Err(MorbidostatError::Validation(format!(
            "{} must be in (0, {}], got {}",
            name, MAX_WINDOW_MINUTES, minutes
        )));
    }
    Ok(())
}

/// One validated measurement of a vial.
///
/// Values outside physical bounds are rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VialMeasurements {
    od: f64,
    temperature: f64,
    rpm: Option<f64>,
    signal_mv: Option<f64>,
    blank_mv: Option<f64>,
}

impl VialMeasurements {
    /// Lowest accepted temperature in °C.
    pub const MIN_TEMPERATURE: f64 = 0.0;
    /// Highest accepted temperature in °C.
    pub const MAX_TEMPERATURE: f64 = 50.0;

    /// Build a measurement, checking every value.
    pub fn new(
        od: f64,
        temperature: f64,
        rpm: Option<f64>,
        signal_mv: Option<f64>,
        blank_mv: Option<f64>,
    ) -> AppResult<Self> {
        if !od.is_finite() || od < 0.0 {
            return Err(MorbidostatError::Validation(format!(
                "OD must be non-negative, got {}",
                od
            )));
        }
        if !(Self::MIN_TEMPERATURE..=Self::MAX_TEMPERATURE).contains(&temperature) {
            return Err(MorbidostatError::Validation(format!(
                "Temperature must be between {} and {} °C, got {}",
                Self::MIN_TEMPERATURE,
                Self::MAX_TEMPERATURE,
                temperature
            )));
        }
        for (name, value) in [("RPM", rpm), ("Signal", signal_mv), ("Blank", blank_mv)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(MorbidostatError::Validation(format!(
                        "{} must be non-negative, got {}",
                        name, v
                    )));
                }
            }
        }
        Ok(Self {
            od,
            temperature,
            rpm,
            signal_mv,
            blank_mv,
        })
    }

    /// Optical density.
    pub fn od(&self) -> f64 {
        self.od
    }

    /// Vial temperature in °C.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Stirrer speed.
    pub fn rpm(&self) -> Option<f64> {
        self.rpm
    }

    /// Raw photodiode signal in mV.
    pub fn signal_mv(&self) -> Option<f64> {
        self.signal_mv
    }

    /// Blank signal in mV.
    pub fn blank_mv(&self) -> Option<f64> {
        self.blank_mv
    }
}

/// Culture parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CultureConfig {
    /// Volume multiplier of one dilution; must be greater than 1.
    pub dilution_factor: f64,
    /// Highest drug concentration a dilution may target.
    pub max_drug_concentration: f64,
    /// Working volume used in dilution arithmetic, in ml.
    ///
    /// This is a fixed configured value, not read back from the bench.
    pub current_volume_ml: f64,
    /// Growth-rate window used for status snapshots, in minutes.
    pub status_window_minutes: f64,
}

impl Default for CultureConfig {
    fn default() -> Self {
        Self {
            dilution_factor: 1.6,
            max_drug_concentration: 100.0,
            current_volume_ml: 12.0,
            status_window_minutes: 30.0,
        }
    }
}

impl CultureConfig {
    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.dilution_factor.is_finite() && self.dilution_factor > 1.0) {
            return Err(MorbidostatError::Validation(format!(
                "dilution_factor must be greater than 1, got {}",
                self.dilution_factor
            )));
        }
        if !(self.max_drug_concentration.is_finite() && self.max_drug_concentration > 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "max_drug_concentration must be positive, got {}",
                self.max_drug_concentration
            )));
        }
        if !(self.current_volume_ml.is_finite() && self.current_volume_ml > 0.0) {
            return Err(MorbidostatError::Validation(format!(
                "current_volume_ml must be positive, got {}",
                self.current_volume_ml
            )));
        }
        validate_window("status_window_minutes", self.status_window_minutes)
    }

    /// Volume exchanged by one dilution.
    pub fn exchange_volume_ml(&self) -> f64 {
        self.current_volume_ml * (self.dilution_factor - 1.0)
    }

    /// Check that one dilution fits within a single device exchange.
    pub fn check_device(&self, device: &DeviceConfig) -> AppResult<()> {
        let exchange = self.exchange_volume_ml();
        if exchange > device.max_volume_ml {
            return Err(MorbidostatError::Validation(format!(
                "Exchange volume {} ml (current_volume_ml {} x (dilution_factor {} - 1)) exceeds device maximum {} ml",
                exchange, self.current_volume_ml, self.dilution_factor, device.max_volume_ml
            )));
        }
        Ok(())
    }

    /// Generations added by one dilution.
    pub fn generations_per_dilution(&self) -> f64 {
        self.dilution_factor.log2()
    }
}

/// One executed dilution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DilutionRecord {
    /// When the dilution finished.
    pub timestamp: DateTime<Utc>,
    /// Media added, in ml.
    pub media_volume_ml: f64,
    /// Drug stock added, in ml.
    pub drug_volume_ml: f64,
    /// Drug concentration after the dilution.
    pub target_concentration: f64,
}

/// Status snapshot of one culture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CultureStatus {
    /// Vial id.
    pub vial: u8,
    /// Latest optical density.
    pub od: Option<f64>,
    /// Current drug concentration.
    pub drug_concentration: f64,
    /// Cumulative generations.
    pub generations: f64,
    /// Growth rate over the status window, per hour.
    pub growth_rate: Option<f64>,
    /// Time of the latest measurement.
    pub last_measurement_time: Option<DateTime<Utc>>,
}

/// Time series of one vial.
pub struct Culture {
    vial: u8,
    config: CultureConfig,
    device: Arc<Device>,
    clock: Arc<dyn Clock>,
    measurements: Vec<(DateTime<Utc>, VialMeasurements)>,
    drug_concentrations: Vec<(DateTime<Utc>, f64)>,
    generations: Vec<(DateTime<Utc>, f64)>,
    dilutions: Vec<DilutionRecord>,
}

impl Culture {
    /// Create a culture for `vial`, starting drug-free at zero generations.
    pub fn new(
        vial: u8,
        device: Arc<Device>,
        config: CultureConfig,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        config.validate()?;
        config.check_device(device.config())?;
        if !(1..=device.n_vials()).contains(&vial) {
            return Err(MorbidostatError::Validation(format!(
                "Invalid vial number {}. Must be between 1 and {}",
                vial,
                device.n_vials()
            )));
        }
        let now = clock.now();
        Ok(Self {
            vial,
            config,
            device,
            clock,
            measurements: Vec::new(),
            drug_concentrations: vec![(now, 0.0)],
            generations: vec![(now, 0.0)],
            dilutions: Vec::new(),
        })
    }

    /// Vial id.
    pub fn vial(&self) -> u8 {
        self.vial
    }

    /// Culture parameters.
    pub fn config(&self) -> &CultureConfig {
        &self.config
    }

    /// Current time according to the culture's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Measurement history, oldest first.
    pub fn measurements(&self) -> &[(DateTime<Utc>, VialMeasurements)] {
        &self.measurements
    }

    /// Drug concentration history, oldest first.
    pub fn drug_concentration_history(&self) -> &[(DateTime<Utc>, f64)] {
        &self.drug_concentrations
    }

    /// Generation history, oldest first.
    pub fn generation_history(&self) -> &[(DateTime<Utc>, f64)] {
        &self.generations
    }

    /// Executed dilutions, oldest first.
    pub fn dilutions(&self) -> &[DilutionRecord] {
        &self.dilutions
    }

    /// Latest measurement.
    pub fn latest_measurement(&self) -> Option<&(DateTime<Utc>, VialMeasurements)> {
        self.measurements.last()
    }

    /// Latest optical density.
    pub fn current_od(&self) -> Option<f64> {
        self.measurements.last().map(|(_, m)| m.od())
    }

    /// Current drug concentration.
    pub fn current_drug_concentration(&self) -> f64 {
        self.drug_concentrations.last().map_or(0.0, |(_, c)| *c)
    }

    /// Cumulative generations.
    pub fn current_generations(&self) -> f64 {
        self.generations.last().map_or(0.0, |(_, g)| *g)
    }

    /// Timestamp for a new history entry, never earlier than the last one.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let last = [
            self.measurements.last().map(|(t, _)| *t),
            self.drug_concentrations.last().map(|(t, _)| *t),
            self.generations.last().map(|(t, _)| *t),
        ]
        .into_iter()
        .flatten()
        .max();
        match last {
            Some(last) if last > now => last,
            _ => now,
        }
    }

    /// Measure the vial and append the result to the history.
    pub async fn measure(&mut self) -> AppResult<VialMeasurements> {
        let measurements = self.device.measure_vial(self.vial).await?;
        let timestamp = self.next_timestamp();
        self.measurements.push((timestamp, measurements));
        debug!(vial = self.vial, od = measurements.od(), "Culture measured");
        Ok(measurements)
    }

    /// Growth rate per hour over the trailing window.
    ///
    /// Uses the oldest and newest measurement inside the window. Returns
    /// `None` with fewer than two points, zero elapsed time or a non-positive OD.
    pub fn calculate_growth_rate(&self, window_minutes: f64) -> Option<f64> {
        if window_minutes.is_nan() || window_minutes <= 0.0 {
            return None;
        }
        let now = self.clock.now();
        let window = chrono::Duration::microseconds((window_minutes * 60.0 * 1_000_000.0) as i64);
        // A window reaching past the representable range covers every point
        let cutoff = now.checked_sub_signed(window);

        let mut in_window = self
            .measurements
            .iter()
            .filter(|(t, _)| cutoff.map_or(true, |cutoff| *t >= cutoff));
        let (t1, first) = in_window.next()?;
        let (t2, last) = in_window.last()?;

        let dt_hours = (*t2 - *t1).num_microseconds()? as f64 / 3_600_000_000.0;
        if dt_hours <= 0.0 || first.od() <= 0.0 || last.od() <= 0.0 {
            return None;
        }
        Some((last.od().ln() - first.od().ln()) / dt_hours)
    }

    /// Dilute the culture.
    ///
    /// Without a target the current drug concentration is kept. The exchange
    /// volume is split into drug stock and media in proportion to
    /// `target / max_drug_concentration`.
    pub async fn make_dilution(
        &mut self,
        target_concentration: Option<f64>,
    ) -> AppResult<DilutionRecord> {
        let target = target_concentration.unwrap_or_else(|| self.current_drug_concentration());
        if !target.is_finite() || target < 0.0 {
            return Err(MorbidostatError::Validation(format!(
                "Target drug concentration must be non-negative, got {}",
                target
            )));
        }
        if target > self.config.max_drug_concentration {
            return Err(MorbidostatError::Validation(format!(
                "Target concentration {} exceeds maximum {}",
                target, self.config.max_drug_concentration
            )));
        }

        let added = self.config.exchange_volume_ml();
        let drug_volume = if target > 0.0 {
            added * target / self.config.max_drug_concentration
        } else {
            0.0
        };
        let media_volume = added - drug_volume;

        self.device
            .make_dilution(self.vial, media_volume, drug_volume)
            .await?;

        let timestamp = self.next_timestamp();
        let generations = self.current_generations() + self.config.generations_per_dilution();
        self.drug_concentrations.push((timestamp, target));
        self.generations.push((timestamp, generations));

        let record = DilutionRecord {
            timestamp,
            media_volume_ml: media_volume,
            drug_volume_ml: drug_volume,
            target_concentration: target,
        };
        self.dilutions.push(record);

        info!(
            vial = self.vial,
            media_ml = media_volume,
            drug_ml = drug_volume,
            drug_concentration = target,
            generations,
            "Culture diluted"
        );
        Ok(record)
    }

    /// Status snapshot.
    pub fn status(&self) -> CultureStatus {
        CultureStatus {
            vial: self.vial,
            od: self.current_od(),
            drug_concentration: self.current_drug_concentration(),
            generations: self.current_generations(),
            growth_rate: self.calculate_growth_rate(self.config.status_window_minutes),
            last_measurement_time: self.measurements.last().map(|(t, _)| *t),
        }
    }
}

impl std::fmt::Debug for Culture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Culture")
            .field("vial", &self.vial)
            .field("measurements", &self.measurements.len())
            .field("drug_concentration", &self.current_drug_concentration())
            .field("generations", &self.current_generations())
            .finish()
    }
}
