//! Failure injection for simulated components.
//!
//! Every simulated component consults its `ErrorConfig` before acting, which
//! lets tests drive `Device` through pump faults, lost links and stuck valves.

use super::rng::MockRng;
use crate::error::{ComponentError, ComponentErrorKind, ComponentResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Failure injection configuration for one component
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0); `"*"` matches every operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Scripted failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// Scenario bookkeeping
    state: Arc<Mutex<ErrorState>>,
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Succeed `count` times, then fail every call of `operation`
    FailAfterN {
        /// Operation name, e.g. `"pump"` or `"close"`
        operation: &'static str,
        /// Successful calls before failures start
        count: u32,
    },
    /// Report a timeout on every call of `operation`
    Timeout {
        /// Operation name
        operation: &'static str,
    },
    /// Lose the link on the first call; every later call fails too
    CommunicationLoss,
    /// Latch a hardware fault on the first call
    HardwareFault {
        /// Fault code reported in the message
        code: u32,
    },
    /// Never complete `operation`
    Stall {
        /// Operation name
        operation: &'static str,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
    hardware_fault: Option<u32>,
}

impl ErrorConfig {
    /// No injected failures
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random failures on every operation
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// A single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Fail every call of `operation`
    pub fn always_fail(operation: &'static str) -> Self {
        Self::scenario(ErrorScenario::FailAfterN {
            operation,
            count: 0,
        })
    }

    /// Per-operation failure rates
    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Whether `operation` is scripted to hang.
    pub fn stalls(&self, operation: &'static str) -> bool {
        self.scenarios
            .iter()
            .any(|s| matches!(s, ErrorScenario::Stall { operation: op } if *op == operation))
    }

    /// Decide whether `operation` fails, returning the error to report.
    pub fn check_operation(
        &self,
        component: &str,
        operation: &'static str,
    ) -> ComponentResult<()> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(ComponentError::new(
                component,
                ComponentErrorKind::Communication,
                "Communication lost",
            ));
        }

        if let Some(code) = state.hardware_fault {
            return Err(ComponentError::new(
                component,
                ComponentErrorKind::Hardware,
                format!("Hardware fault: {}", code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(ComponentError::new(
                            component,
                            ComponentErrorKind::Hardware,
                            format!("Injected '{}' failure after {} operations", operation, count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(ComponentError::new(
                        component,
                        ComponentErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(ComponentError::new(
                        component,
                        ComponentErrorKind::Communication,
                        "Communication lost",
                    ));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault = Some(*code);
                    return Err(ComponentError::new(
                        component,
                        ComponentErrorKind::Hardware,
                        format!("Hardware fault: {}", code),
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.rng.should_fail(rate) {
            return Err(ComponentError::new(
                component,
                ComponentErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// Clear counters and latched faults
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
