//! Simulated bench components.
//!
//! Each component implements one capability trait on top of a shared
//! [`SimulatedBench`], consults its [`ErrorConfig`] before acting and, in
//! [`MockMode::Realistic`], sleeps for the time the physical action takes.

use crate::error::{ComponentError, ComponentErrorKind, ComponentResult};
use crate::hardware::{
    OdReading, OdSensor, Pump, PumpRole, Stirrer, StirrerSpeed, TemperatureReading, Thermometer,
    Valves,
};
use crate::simulation::bench::SimulatedBench;
use crate::simulation::errors::ErrorConfig;
use crate::simulation::mode::MockMode;
use crate::simulation::rng::MockRng;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

/// Valve actuation time in realistic mode.
const VALVE_ACTUATION: Duration = Duration::from_millis(100);
/// Stirrer acceleration time in realistic mode.
const STIRRER_ACCELERATION: Duration = Duration::from_millis(100);
/// Laser warm-up plus sampling time of one OD reading.
const OD_READOUT: Duration = Duration::from_millis(70);
/// Longest sleep between stop-request checks while pumping.
const PUMP_POLL_SLICE: Duration = Duration::from_millis(20);

/// Blank photodiode signal in mV.
pub const BLANK_SIGNAL_MV: f64 = 40.0;
/// Vial block setpoint in °C.
pub const VIAL_TEMPERATURE: f64 = 37.0;
/// Control board temperature in °C.
pub const BOARD_TEMPERATURE: f64 = 35.0;

fn invalid_vial(component: &str, vial: u8, n_vials: u8) -> ComponentError {
    ComponentError::new(
        component,
        ComponentErrorKind::InvalidParameter,
        format!("Invalid vial {}. Must be between 1 and {}", vial, n_vials),
    )
}

/// Hang forever when `operation` is scripted to stall.
async fn maybe_stall(errors: &ErrorConfig, operation: &'static str) {
    if errors.stalls(operation) {
        std::future::pending::<()>().await;
    }
}

// =============================================================================
// Pump
// =============================================================================

/// Simulated peristaltic pump.
///
/// A second `pump` call while one is running fails with `Busy`.
pub struct SimulatedPump {
    role: PumpRole,
    name: String,
    flow_rate_ml_per_s: f64,
    mode: MockMode,
    errors: ErrorConfig,
    bench: Arc<SimulatedBench>,
    lock: tokio::sync::Mutex<()>,
    is_pumping: AtomicBool,
    stop_requested: AtomicBool,
    pumped_volume_ml: Mutex<f64>,
}

impl SimulatedPump {
    /// Create a pump for `role`.
    pub fn new(role: PumpRole, flow_rate_ml_per_s: f64, bench: Arc<SimulatedBench>) -> Self {
        Self {
            role,
            name: format!("pump:{}", role),
            flow_rate_ml_per_s,
            mode: MockMode::default(),
            errors: ErrorConfig::none(),
            bench,
            lock: tokio::sync::Mutex::new(()),
            is_pumping: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            pumped_volume_ml: Mutex::new(0.0),
        }
    }

    /// Set the timing mode.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the failure injection.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Pump role.
    pub fn role(&self) -> PumpRole {
        self.role
    }

    /// Dispense, returning the volume actually delivered and whether it was cut short.
    async fn run(&self, volume_ml: f64) -> (f64, bool) {
        if !self.mode.is_realistic() {
            return (volume_ml, false);
        }
        let total = Duration::try_from_secs_f64(volume_ml / self.flow_rate_ml_per_s)
            .unwrap_or(Duration::ZERO);
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if self.stop_requested.load(Ordering::SeqCst) {
                let fraction = (elapsed.as_secs_f64() / total.as_secs_f64()).min(1.0);
                return (volume_ml * fraction, true);
            }
            let remaining = total.saturating_sub(elapsed);
            if remaining.is_zero() {
                return (volume_ml, false);
            }
            sleep(remaining.min(PUMP_POLL_SLICE)).await;
        }
    }
}

/// Clears the pumping flag when a dispense ends, including when it is cancelled.
struct PumpingFlag<'a>(&'a AtomicBool);

impl<'a> PumpingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for PumpingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Pump for SimulatedPump {
    async fn pump(&self, volume_ml: f64) -> ComponentResult<()> {
        let _guard = self.lock.try_lock().map_err(|_| {
            ComponentError::new(&self.name, ComponentErrorKind::Busy, "Pump already in use")
        })?;
        if !volume_ml.is_finite() || volume_ml < 0.0 {
            return Err(ComponentError::new(
                &self.name,
                ComponentErrorKind::InvalidParameter,
                format!("Invalid volume {}", volume_ml),
            ));
        }
        self.errors.check_operation(&self.name, "pump")?;

        self.stop_requested.store(false, Ordering::SeqCst);
        let pumping = PumpingFlag::raise(&self.is_pumping);
        maybe_stall(&self.errors, "pump").await;

        tracing::debug!(pump = %self.role, volume_ml, "Pumping");
        let (delivered, aborted) = self.run(volume_ml).await;
        drop(pumping);

        *self.pumped_volume_ml.lock() += delivered;
        self.bench.add_liquid(self.role, delivered);

        if aborted {
            return Err(ComponentError::new(
                &self.name,
                ComponentErrorKind::Aborted,
                format!("Stopped after {:.2} of {:.2} ml", delivered, volume_ml),
            ));
        }
        Ok(())
    }

    async fn stop(&self) -> ComponentResult<()> {
        self.errors.check_operation(&self.name, "stop")?;
        maybe_stall(&self.errors, "stop").await;
        self.stop_requested.store(true, Ordering::SeqCst);
        self.is_pumping.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_pumping(&self) -> bool {
        self.is_pumping.load(Ordering::SeqCst)
    }

    fn pumped_volume_ml(&self) -> f64 {
        *self.pumped_volume_ml.lock()
    }

    fn flow_rate_ml_per_s(&self) -> f64 {
        self.flow_rate_ml_per_s
    }
}

// =============================================================================
// Valves
// =============================================================================

/// Simulated vial valve block.
pub struct SimulatedValves {
    mode: MockMode,
    errors: ErrorConfig,
    bench: Arc<SimulatedBench>,
}

impl SimulatedValves {
    /// Create the valve block of `bench`.
    pub fn new(bench: Arc<SimulatedBench>) -> Self {
        Self {
            mode: MockMode::default(),
            errors: ErrorConfig::none(),
            bench,
        }
    }

    /// Set the timing mode.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the failure injection.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    fn check_vial(&self, vial: u8) -> ComponentResult<()> {
        if !self.bench.contains(vial) {
            return Err(invalid_vial("valves", vial, self.bench.n_vials()));
        }
        Ok(())
    }

    async fn actuate(&self) {
        if self.mode.is_realistic() {
            sleep(VALVE_ACTUATION).await;
        }
    }
}

#[async_trait]
impl Valves for SimulatedValves {
    async fn open(&self, vial: u8) -> ComponentResult<()> {
        self.check_vial(vial)?;
        self.errors.check_operation("valves", "open")?;
        maybe_stall(&self.errors, "open").await;
        self.actuate().await;
        self.bench.open_valve(vial);
        Ok(())
    }

    async fn close(&self, vial: u8) -> ComponentResult<()> {
        self.check_vial(vial)?;
        self.errors.check_operation("valves", "close")?;
        maybe_stall(&self.errors, "close").await;
        self.actuate().await;
        self.bench.close_valve(vial);
        Ok(())
    }

    async fn close_all(&self) -> ComponentResult<()> {
        self.errors.check_operation("valves", "close_all")?;
        maybe_stall(&self.errors, "close_all").await;
        self.actuate().await;
        for vial in 1..=self.bench.n_vials() {
            self.bench.close_valve(vial);
        }
        Ok(())
    }

    fn is_open(&self, vial: u8) -> bool {
        self.bench.is_open(vial)
    }
}

// =============================================================================
// Stirrer
// =============================================================================

/// Simulated stirrer driver with one motor per vial.
pub struct SimulatedStirrer {
    mode: MockMode,
    errors: ErrorConfig,
    rng: Arc<MockRng>,
    speeds: Mutex<Vec<StirrerSpeed>>,
}

impl SimulatedStirrer {
    /// Create a stirrer driver for `n_vials` motors, all stopped.
    pub fn new(n_vials: u8, rng: Arc<MockRng>) -> Self {
        Self {
            mode: MockMode::default(),
            errors: ErrorConfig::none(),
            rng,
            speeds: Mutex::new(vec![StirrerSpeed::Stopped; n_vials as usize]),
        }
    }

    /// Set the timing mode.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the failure injection.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Current preset of `vial`.
    pub fn speed(&self, vial: u8) -> Option<StirrerSpeed> {
        let index = usize::from(vial).checked_sub(1)?;
        self.speeds.lock().get(index).copied()
    }

    fn index(&self, vial: u8) -> ComponentResult<usize> {
        let n = self.speeds.lock().len();
        match usize::from(vial) {
            v if (1..=n).contains(&v) => Ok(v - 1),
            _ => Err(invalid_vial("stirrer", vial, n as u8)),
        }
    }
}

#[async_trait]
impl Stirrer for SimulatedStirrer {
    async fn set_speed(&self, vial: u8, speed: StirrerSpeed) -> ComponentResult<()> {
        let index = self.index(vial)?;
        self.errors.check_operation("stirrer", "set_speed")?;
        maybe_stall(&self.errors, "set_speed").await;
        self.speeds.lock()[index] = speed;
        if self.mode.is_realistic() {
            sleep(STIRRER_ACCELERATION).await;
        }
        Ok(())
    }

    async fn measure_rpm(&self, vial: u8) -> ComponentResult<f64> {
        let index = self.index(vial)?;
        self.errors.check_operation("stirrer", "measure_rpm")?;
        maybe_stall(&self.errors, "measure_rpm").await;
        let speed = self.speeds.lock()[index];
        Ok(speed.nominal_rpm() * self.rng.jitter(0.05))
    }

    async fn stop_all(&self) -> ComponentResult<()> {
        self.errors.check_operation("stirrer", "stop_all")?;
        maybe_stall(&self.errors, "stop_all").await;
        self.speeds
            .lock()
            .iter_mut()
            .for_each(|s| *s = StirrerSpeed::Stopped);
        Ok(())
    }
}

// =============================================================================
// OD sensor
// =============================================================================

/// Simulated photodiode OD sensor reading the bench's growth models.
pub struct SimulatedOdSensor {
    mode: MockMode,
    errors: ErrorConfig,
    rng: Arc<MockRng>,
    bench: Arc<SimulatedBench>,
    od_noise: f64,
}

impl SimulatedOdSensor {
    /// Create a sensor with relative OD noise `od_noise`.
    pub fn new(bench: Arc<SimulatedBench>, rng: Arc<MockRng>, od_noise: f64) -> Self {
        Self {
            mode: MockMode::default(),
            errors: ErrorConfig::none(),
            rng,
            bench,
            od_noise,
        }
    }

    /// Set the timing mode.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the failure injection.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }
}

#[async_trait]
impl OdSensor for SimulatedOdSensor {
    async fn measure_od(&self, vial: u8) -> ComponentResult<OdReading> {
        let true_od = self
            .bench
            .od(vial)
            .ok_or_else(|| invalid_vial("od_sensor", vial, self.bench.n_vials()))?;
        self.errors.check_operation("od_sensor", "measure_od")?;
        maybe_stall(&self.errors, "measure_od").await;
        if self.mode.is_realistic() {
            sleep(OD_READOUT).await;
        }
        let od = (true_od * self.rng.jitter(self.od_noise)).max(0.0);
        let signal_mv = BLANK_SIGNAL_MV * (-od).exp() * self.rng.jitter(0.02);
        Ok(OdReading {
            od,
            signal_mv,
            blank_mv: Some(BLANK_SIGNAL_MV),
        })
    }

    async fn measure_blank(&self, vial: u8) -> ComponentResult<f64> {
        if !self.bench.contains(vial) {
            return Err(invalid_vial("od_sensor", vial, self.bench.n_vials()));
        }
        self.errors.check_operation("od_sensor", "measure_blank")?;
        maybe_stall(&self.errors, "measure_blank").await;
        if self.mode.is_realistic() {
            sleep(OD_READOUT).await;
        }
        Ok(BLANK_SIGNAL_MV * self.rng.jitter(0.02))
    }
}

// =============================================================================
// Thermometer
// =============================================================================

/// Simulated thermometer around the incubator setpoint.
pub struct SimulatedThermometer {
    errors: ErrorConfig,
    rng: Arc<MockRng>,
}

impl SimulatedThermometer {
    /// Create a thermometer.
    pub fn new(rng: Arc<MockRng>) -> Self {
        Self {
            errors: ErrorConfig::none(),
            rng,
        }
    }

    /// Set the failure injection.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }
}

#[async_trait]
impl Thermometer for SimulatedThermometer {
    async fn measure_temperature(&self) -> ComponentResult<TemperatureReading> {
        self.errors.check_operation("thermometer", "measure_temperature")?;
        maybe_stall(&self.errors, "measure_temperature").await;
        Ok(TemperatureReading {
            vials: VIAL_TEMPERATURE + self.rng.spread(0.5),
            board: BOARD_TEMPERATURE + self.rng.spread(0.2),
        })
    }
}
