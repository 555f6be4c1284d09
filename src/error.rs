//! Error types for the morbidostat controller.
//!
//! Two layers of errors exist:
//!
//! - **`ComponentError`**: a structured failure reported by a single hardware
//!   (or simulated) component such as a pump or the OD sensor. It carries the
//!   component name and a [`ComponentErrorKind`] so callers can distinguish a
//!   busy pump from a timeout or a hardware fault.
//! - **`MorbidostatError`**: the application-level taxonomy surfaced to callers
//!   of `Device`, `Culture`, `Experiment` and the runner.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: the caller asked for something impossible (vial id out of
//!   range, negative or oversized volume, drug target above the maximum). Never
//!   retried, raised before any hardware is touched.
//! - **`Device`**: a component failed while executing an operation. Raised
//!   mid-dilution it is always preceded by an emergency stop.
//! - **`State`**: an illegal experiment lifecycle transition. No state is mutated.
//! - **`Config`**, **`Io`**, **`Serialization`**: configuration loading and
//!   experiment state persistence.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, MorbidostatError>;

/// Convenience alias for results returned by capability traits.
pub type ComponentResult<T> = std::result::Result<T, ComponentError>;

/// Category of a component failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentErrorKind {
    /// The component is already executing an operation (pump try-lock failed).
    Busy,
    /// The component reported a fault.
    Hardware,
    /// The operation did not complete in time.
    Timeout,
    /// The link to the component was lost.
    Communication,
    /// The component rejected an argument (e.g. unknown vial).
    InvalidParameter,
    /// The operation was interrupted by a stop request.
    Aborted,
}

impl std::fmt::Display for ComponentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ComponentErrorKind::Busy => "busy",
            ComponentErrorKind::Hardware => "hardware",
            ComponentErrorKind::Timeout => "timeout",
            ComponentErrorKind::Communication => "communication",
            ComponentErrorKind::InvalidParameter => "invalid_parameter",
            ComponentErrorKind::Aborted => "aborted",
        };
        write!(f, "{}", label)
    }
}

/// Failure reported by a single component.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Component '{component}' {kind} error: {message}")]
pub struct ComponentError {
    /// Component name, e.g. `"pump:media"` or `"od_sensor"`.
    pub component: String,
    /// Failure category.
    pub kind: ComponentErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl ComponentError {
    /// Create a new component error.
    pub fn new(
        component: impl Into<String>,
        kind: ComponentErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            kind,
            message: message.into(),
        }
    }

    /// Whether the component refused the call because it was already in use.
    pub fn is_busy(&self) -> bool {
        self.kind == ComponentErrorKind::Busy
    }
}

/// Application error taxonomy.
#[derive(Error, Debug)]
pub enum MorbidostatError {
    /// Caller or configuration mistake; never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Hardware or simulated component failure.
    #[error("Device error: {message}")]
    Device {
        /// What the device was doing when it failed.
        message: String,
        /// Underlying component failure, if one caused this error.
        #[source]
        source: Option<ComponentError>,
    },

    /// Illegal experiment lifecycle transition.
    #[error("Invalid state transition: {0}")]
    State(String),

    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be rendered as TOML.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::ser::Error),
}

impl MorbidostatError {
    /// Build a device error with an underlying component cause.
    pub fn device(message: impl Into<String>, source: ComponentError) -> Self {
        MorbidostatError::Device {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Wrap an error as a device error, keeping the component cause if there is one.
    ///
    /// Validation and state errors pass through untouched so callers still see
    /// their original category.
    pub fn wrap_device(context: &str, err: MorbidostatError) -> Self {
        match err {
            MorbidostatError::Device { message, source } => MorbidostatError::Device {
                message: format!("{}: {}", context, message),
                source,
            },
            other @ (MorbidostatError::Validation(_) | MorbidostatError::State(_)) => other,
            other => MorbidostatError::Device {
                message: format!("{}: {}", context, other),
                source: None,
            },
        }
    }

    /// Whether this is a validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, MorbidostatError::Validation(_))
    }

    /// Whether this is a device failure.
    pub fn is_device(&self) -> bool {
        matches!(self, MorbidostatError::Device { .. })
    }

    /// Whether this is an illegal state transition.
    pub fn is_state(&self) -> bool {
        matches!(self, MorbidostatError::State(_))
    }

    /// Whether this device failure was caused by a busy component.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            MorbidostatError::Device {
                source: Some(source),
                ..
            } if source.is_busy()
        )
    }

    /// The component failure behind a device error, if any.
    pub fn component_error(&self) -> Option<&ComponentError> {
        match self {
            MorbidostatError::Device { source, .. } => source.as_ref(),
            _ => None,
        }
    }
}

impl From<ComponentError> for MorbidostatError {
    fn from(err: ComponentError) -> Self {
        match err.kind {
            ComponentErrorKind::InvalidParameter => MorbidostatError::Validation(err.to_string()),
            _ => MorbidostatError::Device {
                message: err.to_string(),
                source: Some(err),
            },
        }
    }
}
