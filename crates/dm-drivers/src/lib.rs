//! Device drivers for the wavefront-shaping hardware fleet.
//!
//! Every physical family is driven through the same capability contract,
//! [`DeformableMirror`]: initialize, apply a shape vector, read the
//! commanded shape back, apply a named flat, shut down. Drivers differ only
//! in how they satisfy it: the simulated mirror keeps an in-memory vector,
//! while the hardware drivers add session setup, calibration handling, and
//! device-specific coordinate mapping.
//!
//! Vendor SDKs are reached through narrow session traits owned by each
//! driver module (`AsdkSession`, `BmcSession`, `GcsLink`, `BlinkSession`).
//! The PI tip-tilt link is a real TCP implementation of the GCS text
//! protocol; the other production sessions report `DeviceUnavailable` until
//! native bindings are provided behind the trait.

pub mod alpao;
pub mod bmc;
pub mod factory;
pub mod flats;
pub mod meadowlark;
pub mod pi_tip_tilt;
pub mod simulated;

use async_trait::async_trait;
use dm_core::{DmError, DmResult};

pub use factory::{build_driver, KNOWN_MODELS};
pub use flats::{FlatLibrary, ZERO_FLAT_TAG};

/// Physical actuation limits of a device, uniform across its actuators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeLimits {
    pub min: f64,
    pub max: f64,
}

impl StrokeLimits {
    pub fn symmetric(stroke: f64) -> Self {
        StrokeLimits {
            min: -stroke,
            max: stroke,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Check a command vector against an actuator count and stroke limits.
///
/// Shared by the controller's fail-fast path and the drivers themselves.
pub fn validate_shape(expected: usize, limits: StrokeLimits, shape: &[f64]) -> DmResult<()> {
    if shape.len() != expected {
        return Err(DmError::ShapeDimensionMismatch {
            expected,
            got: shape.len(),
        });
    }
    for (actuator, &value) in shape.iter().enumerate() {
        if !value.is_finite() || !limits.contains(value) {
            return Err(DmError::OutOfRange {
                actuator,
                value,
                min: limits.min,
                max: limits.max,
            });
        }
    }
    Ok(())
}

/// Uniform actuation contract over the five hardware families.
///
/// Reads (`shape`) never fail once the device is initialized; `shutdown`
/// is idempotent and tolerates being called with a command abandoned
/// mid-flight.
#[async_trait]
pub trait DeformableMirror: Send + Sync {
    /// Model tag this driver was built from.
    fn model(&self) -> &'static str;

    fn serial_number(&self) -> &str;

    fn actuator_count(&self) -> usize;

    fn stroke_limits(&self) -> StrokeLimits;

    fn is_initialized(&self) -> bool;

    /// Establish the hardware session. Fails with `DeviceUnavailable` when
    /// the hardware or vendor runtime cannot be reached and
    /// `InvalidCalibration` when a referenced calibration artifact is
    /// missing or malformed.
    async fn initialize(&self) -> DmResult<()>;

    /// Drive the actuators to `shape`. The vector length must equal
    /// [`Self::actuator_count`] and every element must lie within
    /// [`Self::stroke_limits`].
    async fn apply_shape(&self, shape: &[f64]) -> DmResult<()>;

    /// Last commanded shape.
    async fn shape(&self) -> DmResult<Vec<f64>>;

    /// Drive the actuators to the named flat position and return the
    /// vector that was applied.
    async fn apply_flat(&self, tag: &str) -> DmResult<Vec<f64>>;

    /// Release the hardware session. Idempotent.
    async fn shutdown(&self) -> DmResult<()>;
}
