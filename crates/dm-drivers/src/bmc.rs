//! Boston Micromachines multi-DM driver.
//!
//! MEMS actuators respond nonlinearly to drive voltage, so commands are
//! expressed as physical deflections in meters and converted to voltages
//! through a per-actuator linearization: each actuator carries a sampled
//! voltage/deflection calibration curve, inverted by piecewise-linear
//! interpolation and clipped at the calibrated stroke.
//!
//! The electronics are reached through the [`BmcSession`] trait;
//! [`NativeBmc`] reports `DeviceUnavailable` until native bindings are
//! provided behind it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use dm_core::{DmError, DmResult};

use crate::flats::FlatLibrary;
use crate::{DeformableMirror, StrokeLimits};

/// Model-specific descriptor keys for `bmcMultiDM`.
#[derive(Debug, Clone, Deserialize)]
pub struct BmcConfig {
    /// Per-actuator voltage/deflection calibration tables.
    pub calibration_filename: PathBuf,
}

/// The slice of the BMC driver runtime this driver uses.
#[async_trait]
pub trait BmcSession: Send + Sync {
    async fn connect(&self) -> DmResult<()>;

    /// Send one full voltage vector, in calibration units.
    async fn send_voltages(&self, voltages: &[f64]) -> DmResult<()>;

    /// Release the hardware. Idempotent.
    async fn release(&self) -> DmResult<()>;
}

/// Production session placeholder for the vendor runtime.
pub struct NativeBmc {
    serial_number: String,
}

impl NativeBmc {
    pub fn new(serial_number: String) -> Self {
        NativeBmc { serial_number }
    }
}

#[async_trait]
impl BmcSession for NativeBmc {
    async fn connect(&self) -> DmResult<()> {
        Err(DmError::DeviceUnavailable(format!(
            "BMC runtime for '{}' requires native bindings behind BmcSession",
            self.serial_number
        )))
    }

    async fn send_voltages(&self, _voltages: &[f64]) -> DmResult<()> {
        Err(DmError::NotInitialized)
    }

    async fn release(&self) -> DmResult<()> {
        Ok(())
    }
}

// =============================================================================
// Command linearization
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
struct RawCurve {
    cmd: Vec<f64>,
    deflection: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCalibration {
    actuators: Vec<u32>,
    #[serde(rename = "curve")]
    curves: Vec<RawCurve>,
}

/// Per-actuator voltage↔deflection mapping.
#[derive(Debug, Clone)]
pub struct MemsLinearization {
    actuators: Vec<u32>,
    curves: Vec<RawCurve>,
    stroke: StrokeLimits,
}

impl MemsLinearization {
    /// Load calibration tables from a TOML file:
    ///
    /// ```toml
    /// actuators = [0, 1, 2]
    /// [[curve]]
    /// cmd = [0.0, 0.5, 1.0]
    /// deflection = [0.0e-6, 0.8e-6, 1.5e-6]
    /// ```
    ///
    /// Each curve must be sampled on strictly increasing voltages with
    /// strictly increasing deflections, so the inverse is well defined.
    pub fn load(path: &Path) -> DmResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DmError::InvalidCalibration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let raw: RawCalibration = toml::from_str(&content).map_err(|e| {
            DmError::InvalidCalibration(format!("{}: {}", path.display(), e))
        })?;
        Self::from_tables(raw).map_err(|e| match e {
            DmError::InvalidCalibration(msg) => {
                DmError::InvalidCalibration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    fn from_tables(raw: RawCalibration) -> DmResult<Self> {
        if raw.curves.len() != raw.actuators.len() {
            return Err(DmError::InvalidCalibration(format!(
                "{} actuators but {} calibration curves",
                raw.actuators.len(),
                raw.curves.len()
            )));
        }
        for (idx, curve) in raw.curves.iter().enumerate() {
            if curve.cmd.len() != curve.deflection.len() || curve.cmd.len() < 2 {
                return Err(DmError::InvalidCalibration(format!(
                    "actuator {}: curve needs at least 2 matched samples",
                    raw.actuators[idx]
                )));
            }
            let increasing = |v: &[f64]| v.windows(2).all(|w| w[1] > w[0]);
            if !increasing(&curve.cmd) || !increasing(&curve.deflection) {
                return Err(DmError::InvalidCalibration(format!(
                    "actuator {}: samples must be strictly increasing",
                    raw.actuators[idx]
                )));
            }
        }
        // Stroke usable by every actuator: the intersection of the
        // calibrated deflection ranges.
        let min = raw
            .curves
            .iter()
            .map(|c| c.deflection[0])
            .fold(f64::NEG_INFINITY, f64::max);
        let max = raw
            .curves
            .iter()
            .map(|c| *c.deflection.last().unwrap_or(&0.0))
            .fold(f64::INFINITY, f64::min);
        if min >= max {
            return Err(DmError::InvalidCalibration(
                "calibrated deflection ranges do not overlap".into(),
            ));
        }
        Ok(MemsLinearization {
            actuators: raw.actuators,
            curves: raw.curves,
            stroke: StrokeLimits { min, max },
        })
    }

    pub fn n_actuators(&self) -> usize {
        self.actuators.len()
    }

    pub fn stroke(&self) -> StrokeLimits {
        self.stroke
    }

    /// Deflections (m) to voltage commands, clipped at the calibrated
    /// boundaries of each actuator.
    pub fn deflection_to_voltage(&self, positions: &[f64]) -> DmResult<Vec<f64>> {
        if positions.len() != self.n_actuators() {
            return Err(DmError::ShapeDimensionMismatch {
                expected: self.n_actuators(),
                got: positions.len(),
            });
        }
        Ok(positions
            .iter()
            .zip(&self.curves)
            .map(|(&pos, curve)| interpolate(&curve.deflection, &curve.cmd, pos))
            .collect())
    }

    /// Voltage commands back to expected deflections (m).
    pub fn voltage_to_deflection(&self, voltages: &[f64]) -> DmResult<Vec<f64>> {
        if voltages.len() != self.n_actuators() {
            return Err(DmError::ShapeDimensionMismatch {
                expected: self.n_actuators(),
                got: voltages.len(),
            });
        }
        Ok(voltages
            .iter()
            .zip(&self.curves)
            .map(|(&volt, curve)| interpolate(&curve.cmd, &curve.deflection, volt))
            .collect())
    }
}

/// Piecewise-linear interpolation of `ys` over strictly increasing `xs`,
/// clipped at the boundary values.
fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[xs.len() - 1] {
        return ys[ys.len() - 1];
    }
    let hi = xs.partition_point(|&sample| sample < x);
    let lo = hi - 1;
    let span = xs[hi] - xs[lo];
    let frac = (x - xs[lo]) / span;
    ys[lo] + frac * (ys[hi] - ys[lo])
}

// =============================================================================
// Driver
// =============================================================================

#[derive(Debug)]
struct BmcState {
    shape: Vec<f64>,
    initialized: bool,
}

pub struct BmcMultiDm {
    serial_number: String,
    linearization: MemsLinearization,
    flats: FlatLibrary,
    session: Arc<dyn BmcSession>,
    state: RwLock<BmcState>,
}

impl BmcMultiDm {
    pub fn new(
        serial_number: String,
        linearization: MemsLinearization,
        flats: FlatLibrary,
        session: Arc<dyn BmcSession>,
    ) -> Self {
        let n = linearization.n_actuators();
        BmcMultiDm {
            serial_number,
            linearization,
            flats,
            session,
            state: RwLock::new(BmcState {
                shape: vec![0.0; n],
                initialized: false,
            }),
        }
    }
}

#[async_trait]
impl DeformableMirror for BmcMultiDm {
    fn model(&self) -> &'static str {
        "bmcMultiDM"
    }

    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    fn actuator_count(&self) -> usize {
        self.linearization.n_actuators()
    }

    fn stroke_limits(&self) -> StrokeLimits {
        self.linearization.stroke()
    }

    fn is_initialized(&self) -> bool {
        self.state
            .try_read()
            .map(|s| s.initialized)
            .unwrap_or(false)
    }

    async fn initialize(&self) -> DmResult<()> {
        self.session.connect().await?;
        let mut state = self.state.write().await;
        state.shape = vec![0.0; self.actuator_count()];
        state.initialized = true;
        tracing::info!(
            serial = %self.serial_number,
            n_actuators = self.actuator_count(),
            "BMC multi-DM session open"
        );
        Ok(())
    }

    async fn apply_shape(&self, shape: &[f64]) -> DmResult<()> {
        crate::validate_shape(self.actuator_count(), self.stroke_limits(), shape)?;
        let voltages = self.linearization.deflection_to_voltage(shape)?;
        let mut state = self.state.write().await;
        if !state.initialized {
            return Err(DmError::NotInitialized);
        }
        self.session.send_voltages(&voltages).await?;
        state.shape.copy_from_slice(shape);
        Ok(())
    }

    async fn shape(&self) -> DmResult<Vec<f64>> {
        let state = self.state.read().await;
        if !state.initialized {
            return Err(DmError::NotInitialized);
        }
        Ok(state.shape.clone())
    }

    async fn apply_flat(&self, tag: &str) -> DmResult<Vec<f64>> {
        let flat = self.flats.resolve(tag)?;
        self.apply_shape(&flat).await?;
        Ok(flat.to_vec())
    }

    async fn shutdown(&self) -> DmResult<()> {
        let mut state = self.state.write().await;
        if state.initialized {
            state.initialized = false;
            self.session.release().await?;
        }
        Ok(())
    }
}
