//! Timing modes for simulated components.
//!
//! - **Instant**: no delays, for unit tests and accelerated runs
//! - **Realistic**: pumps take `volume / flow_rate`, valves take their actuation time

/// Timing mode of a simulated component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero delays, deterministic
    #[default]
    Instant,
    /// Bench-like timing
    Realistic,
}

impl MockMode {
    /// Whether operations should sleep for their physical duration.
    pub fn is_realistic(self) -> bool {
        matches!(self, MockMode::Realistic)
    }
}
