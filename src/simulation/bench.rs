//! Shared physical state of a simulated bench.
//!
//! The bench holds one [`GrowthModel`] per vial, the valve positions and the
//! liquid each open vial has received. Simulated components act on it, and the
//! runner advances it through [`SimulationHook`]. Nothing outside the
//! simulation reaches the growth models.
//!
//! Dilution uses an overflow model: a vial keeps its working volume `V`, so
//! adding `a` ml (of which `d` ml drug stock at concentration `s`) dilutes the
//! culture by `(V + a) / V` and sets the drug concentration to
//! `(c V + s d) / (V + a)`. The change is applied when the valve closes.

use crate::clock::{Clock, SimulatedClock};
use crate::hardware::PumpRole;
use crate::runner::SimulationHook;
use crate::simulation::growth_model::{GrowthModel, GrowthModelParameters};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
struct SimVial {
    model: GrowthModel,
    valve_open: bool,
    pending_media_ml: f64,
    pending_drug_ml: f64,
}

/// Physical state shared by all simulated components of one bench.
#[derive(Debug)]
pub struct SimulatedBench {
    vials: Mutex<BTreeMap<u8, SimVial>>,
    clock: Arc<SimulatedClock>,
    vial_volume_ml: f64,
    drug_stock_concentration: f64,
}

impl SimulatedBench {
    /// Create a bench with `n_vials` freshly inoculated vials.
    pub fn new(
        n_vials: u8,
        params: GrowthModelParameters,
        vial_volume_ml: f64,
        drug_stock_concentration: f64,
        clock: Arc<SimulatedClock>,
    ) -> Self {
        let vials = (1..=n_vials)
            .map(|vial| {
                (
                    vial,
                    SimVial {
                        model: GrowthModel::new(params.clone()),
                        valve_open: false,
                        pending_media_ml: 0.0,
                        pending_drug_ml: 0.0,
                    },
                )
            })
            .collect();
        Self {
            vials: Mutex::new(vials),
            clock,
            vial_volume_ml,
            drug_stock_concentration,
        }
    }

    /// Number of vials.
    pub fn n_vials(&self) -> u8 {
        self.vials.lock().len() as u8
    }

    /// The simulated clock advanced together with the models.
    pub fn clock(&self) -> Arc<SimulatedClock> {
        Arc::clone(&self.clock)
    }

    /// Current simulated time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// True OD of a vial, without sensor noise.
    pub fn od(&self, vial: u8) -> Option<f64> {
        self.vials.lock().get(&vial).map(|v| v.model.od())
    }

    /// Copy of a vial's growth model.
    pub fn model(&self, vial: u8) -> Option<GrowthModel> {
        self.vials.lock().get(&vial).map(|v| v.model.clone())
    }

    /// Overwrite a vial's OD.
    pub fn set_od(&self, vial: u8, od: f64) {
        if let Some(v) = self.vials.lock().get_mut(&vial) {
            v.model.set_od(od);
        }
    }

    pub(crate) fn contains(&self, vial: u8) -> bool {
        self.vials.lock().contains_key(&vial)
    }

    pub(crate) fn is_open(&self, vial: u8) -> bool {
        self.vials.lock().get(&vial).is_some_and(|v| v.valve_open)
    }

    pub(crate) fn open_valve(&self, vial: u8) {
        if let Some(v) = self.vials.lock().get_mut(&vial) {
            v.valve_open = true;
        }
    }

    /// Close a valve and apply the liquid added while it was open.
    pub(crate) fn close_valve(&self, vial: u8) {
        let mut vials = self.vials.lock();
        let Some(v) = vials.get_mut(&vial) else {
            return;
        };
        v.valve_open = false;

        let added = v.pending_media_ml + v.pending_drug_ml;
        if added <= 0.0 {
            return;
        }
        let volume = self.vial_volume_ml;
        let factor = (volume + added) / volume;
        let concentration = (v.model.drug_concentration() * volume
            + self.drug_stock_concentration * v.pending_drug_ml)
            / (volume + added);
        v.pending_media_ml = 0.0;
        v.pending_drug_ml = 0.0;

        match v.model.dilute(factor, concentration) {
            Ok(()) => debug!(vial, factor, concentration, "Simulated vial diluted"),
            Err(e) => warn!(vial, error = %e, "Simulated dilution rejected"),
        }
    }

    /// Route dispensed liquid into the open vials.
    ///
    /// Waste extraction does not change the culture in the overflow model.
    pub(crate) fn add_liquid(&self, role: PumpRole, volume_ml: f64) {
        if role == PumpRole::Waste || volume_ml <= 0.0 {
            return;
        }
        let mut vials = self.vials.lock();
        let open = vials.values().filter(|v| v.valve_open).count();
        if open == 0 {
            debug!(pump = %role, volume_ml, "Liquid dispensed with no valve open");
            return;
        }
        let share = volume_ml / open as f64;
        for v in vials.values_mut().filter(|v| v.valve_open) {
            match role {
                PumpRole::Media => v.pending_media_ml += share,
                PumpRole::Drug => v.pending_drug_ml += share,
                PumpRole::Waste => {}
            }
        }
    }

    /// Step every growth model and the clock forward.
    pub fn advance_minutes(&self, minutes: f64) {
        if minutes <= 0.0 {
            return;
        }
        for v in self.vials.lock().values_mut() {
            v.model.update(minutes);
        }
        self.clock.advance_minutes(minutes);
    }
}

impl SimulationHook for SimulatedBench {
    fn advance(&self, minutes: f64) {
        self.advance_minutes(minutes);
    }
}
