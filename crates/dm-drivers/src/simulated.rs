//! Simulated deformable mirror.
//!
//! Keeps the commanded vector in memory and always succeeds. Used for
//! development, integration tests, and as the reference behavior for the
//! shared contract.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use dm_core::{DmError, DmResult};

use crate::flats::FlatLibrary;
use crate::{validate_shape, DeformableMirror, StrokeLimits};

/// Model-specific descriptor keys for `simulatedDM`.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedConfig {
    #[serde(default = "default_actuators")]
    pub n_actuators: usize,

    /// Symmetric stroke limit; commands live in `[-stroke, stroke]`.
    #[serde(default = "default_stroke")]
    pub stroke: f64,
}

fn default_actuators() -> usize {
    97
}

fn default_stroke() -> f64 {
    1.0
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            n_actuators: default_actuators(),
            stroke: default_stroke(),
        }
    }
}

#[derive(Debug)]
struct SimState {
    shape: Vec<f64>,
    initialized: bool,
}

pub struct SimulatedDm {
    serial_number: String,
    config: SimulatedConfig,
    flats: FlatLibrary,
    state: RwLock<SimState>,
}

impl SimulatedDm {
    pub fn new(serial_number: String, config: SimulatedConfig, flats: FlatLibrary) -> Self {
        let n = config.n_actuators;
        SimulatedDm {
            serial_number,
            config,
            flats,
            state: RwLock::new(SimState {
                shape: vec![0.0; n],
                initialized: false,
            }),
        }
    }
}

#[async_trait]
impl DeformableMirror for SimulatedDm {
    fn model(&self) -> &'static str {
        "simulatedDM"
    }

    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    fn actuator_count(&self) -> usize {
        self.config.n_actuators
    }

    fn stroke_limits(&self) -> StrokeLimits {
        StrokeLimits::symmetric(self.config.stroke)
    }

    fn is_initialized(&self) -> bool {
        // Cheap read; only the test paths call this from sync contexts.
        self.state
            .try_read()
            .map(|s| s.initialized)
            .unwrap_or(false)
    }

    async fn initialize(&self) -> DmResult<()> {
        let mut state = self.state.write().await;
        state.shape = vec![0.0; self.config.n_actuators];
        state.initialized = true;
        tracing::info!(
            serial = %self.serial_number,
            n_actuators = self.config.n_actuators,
            "simulated mirror ready"
        );
        Ok(())
    }

    async fn apply_shape(&self, shape: &[f64]) -> DmResult<()> {
        validate_shape(self.config.n_actuators, self.stroke_limits(), shape)?;
        let mut state = self.state.write().await;
        if !state.initialized {
            return Err(DmError::NotInitialized);
        }
        state.shape.copy_from_slice(shape);
        tracing::debug!(serial = %self.serial_number, "applied shape");
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
        state.initialized = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ZERO_FLAT_TAG;

    fn mirror(n: usize) -> SimulatedDm {
        let config = SimulatedConfig {
            n_actuators: n,
            stroke: 1.0,
        };
        SimulatedDm::new("SIM-01".into(), config, FlatLibrary::with_zero(n))
    }

    #[tokio::test]
    async fn shape_round_trips() {
        let dm = mirror(4);
        dm.initialize().await.unwrap();
        let command = vec![0.1, -0.2, 0.3, -0.4];
        dm.apply_shape(&command).await.unwrap();
        assert_eq!(dm.shape().await.unwrap(), command);
    }

    #[tokio::test]
    async fn reads_fail_before_initialize() {
        let dm = mirror(4);
        let err = dm.shape().await.unwrap_err();
        assert_eq!(err.kind(), "NotInitialized");
        let err = dm.apply_shape(&[0.0; 4]).await.unwrap_err();
        assert_eq!(err.kind(), "NotInitialized");
    }

    #[tokio::test]
    async fn rejection_leaves_shape_unchanged() {
        let dm = mirror(4);
        dm.initialize().await.unwrap();
        dm.apply_shape(&[0.5; 4]).await.unwrap();

        let err = dm.apply_shape(&[0.0; 3]).await.unwrap_err();
        assert_eq!(err.kind(), "ShapeDimensionMismatch");
        let err = dm.apply_shape(&[0.0, 0.0, 0.0, 7.0]).await.unwrap_err();
        assert_eq!(err.kind(), "OutOfRange");

        assert_eq!(dm.shape().await.unwrap(), vec![0.5; 4]);
    }

    #[tokio::test]
    async fn zero_flat_applies() {
        let dm = mirror(3);
        dm.initialize().await.unwrap();
        dm.apply_shape(&[0.2, 0.2, 0.2]).await.unwrap();
        let applied = dm.apply_flat(ZERO_FLAT_TAG).await.unwrap();
        assert_eq!(applied, vec![0.0; 3]);
        assert_eq!(dm.shape().await.unwrap(), vec![0.0; 3]);
    }

    #[tokio::test]
    async fn unknown_flat_tag_fails() {
        let dm = mirror(3);
        dm.initialize().await.unwrap();
        let err = dm.apply_flat("warm").await.unwrap_err();
        assert_eq!(err.kind(), "UnknownFlatTag");
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dm = mirror(3);
        dm.initialize().await.unwrap();
        dm.shutdown().await.unwrap();
        dm.shutdown().await.unwrap();
        assert!(!dm.is_initialized());
    }
}
