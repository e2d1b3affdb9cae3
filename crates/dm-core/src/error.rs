//! Error taxonomy for the fleet.
//!
//! Every error that can cross a process boundary maps to a stable wire
//! `kind` string carried in RPC replies. Validation errors (`kind()` for
//! which [`DmError::is_validation`] returns true) are reported to the caller
//! and leave device state untouched; hardware faults mark the device
//! unhealthy; configuration and initialization errors are fatal at startup.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type DmResult<T> = std::result::Result<T, DmError>;

#[derive(Error, Debug)]
pub enum DmError {
    /// Malformed or semantically invalid deployment configuration.
    /// Fatal at startup, never recovered.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Hardware or vendor runtime could not be reached.
    /// Fatal for the affected device server only.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A referenced calibration artifact is missing or malformed.
    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    /// Shape vector length does not match the device's actuator count.
    #[error("shape has {got} elements, device drives {expected} actuators")]
    ShapeDimensionMismatch { expected: usize, got: usize },

    /// A command element exceeds the device's physical actuation limits.
    #[error("command {value} at actuator {actuator} outside stroke range [{min}, {max}]")]
    OutOfRange {
        actuator: usize,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Requested flat tag is not configured for this device.
    #[error("unknown flat tag '{0}'")]
    UnknownFlatTag(String),

    /// Another actuation command is in flight and the binding's busy
    /// policy is `reject`.
    #[error("device is busy with another actuation command")]
    DeviceBusy,

    /// Actuation or readback attempted before `initialize`.
    #[error("device has not been initialized")]
    NotInitialized,

    /// Descriptor carries a model tag outside the closed set.
    #[error("unknown device model '{0}'")]
    UnknownDeviceModel(String),

    /// Request named a server binding the deployment does not define.
    #[error("no server named '{0}' is configured")]
    UnknownServer(String),

    /// A spawned device server never opened its endpoint.
    #[error("server '{name}' did not become reachable within {timeout:?}")]
    SpawnTimeout { name: String, timeout: Duration },

    /// A device server exited without a preceding stop request.
    #[error("server '{0}' exited unexpectedly")]
    ProcessCrashed(String),

    /// Request line could not be parsed into a known command.
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecoverable internal fault surfaced as a structured reply.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DmError {
    /// Stable identifier carried in the `error.kind` field of RPC replies.
    pub fn kind(&self) -> &'static str {
        match self {
            DmError::Configuration(_) => "ConfigurationError",
            DmError::DeviceUnavailable(_) => "DeviceUnavailable",
            DmError::InvalidCalibration(_) => "InvalidCalibration",
            DmError::ShapeDimensionMismatch { .. } => "ShapeDimensionMismatch",
            DmError::OutOfRange { .. } => "OutOfRange",
            DmError::UnknownFlatTag(_) => "UnknownFlatTag",
            DmError::DeviceBusy => "DeviceBusy",
            DmError::NotInitialized => "NotInitialized",
            DmError::UnknownDeviceModel(_) => "UnknownDeviceModel",
            DmError::UnknownServer(_) => "UnknownServer",
            DmError::SpawnTimeout { .. } => "SpawnTimeout",
            DmError::ProcessCrashed(_) => "ProcessCrashed",
            DmError::BadRequest(_) => "BadRequest",
            DmError::Io(_) => "Io",
            DmError::Internal(_) => "Internal",
        }
    }

    /// True for command-validation and contention errors that are reported
    /// to the caller without touching device health.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DmError::ShapeDimensionMismatch { .. }
                | DmError::OutOfRange { .. }
                | DmError::UnknownFlatTag(_)
                | DmError::DeviceBusy
                | DmError::NotInitialized
                | DmError::BadRequest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        let err = DmError::ShapeDimensionMismatch {
            expected: 97,
            got: 12,
        };
        assert_eq!(err.kind(), "ShapeDimensionMismatch");
        assert_eq!(DmError::DeviceBusy.kind(), "DeviceBusy");
        assert_eq!(
            DmError::UnknownFlatTag("warm".into()).kind(),
            "UnknownFlatTag"
        );
    }

    #[test]
    fn dimension_mismatch_display() {
        let err = DmError::ShapeDimensionMismatch {
            expected: 140,
            got: 97,
        };
        assert_eq!(
            err.to_string(),
            "shape has 97 elements, device drives 140 actuators"
        );
    }

    #[test]
    fn validation_errors_do_not_touch_health() {
        assert!(DmError::DeviceBusy.is_validation());
        assert!(DmError::UnknownFlatTag("x".into()).is_validation());
        assert!(!DmError::DeviceUnavailable("gone".into()).is_validation());
        assert!(!DmError::Internal("boom".into()).is_validation());
    }
}
