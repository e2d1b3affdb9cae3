//! Alpao deformable mirror driver.
//!
//! Alpao DMs are driven through the vendor ASDK with normalized actuator
//! commands in `[-1, 1]`. The SDK surface this driver needs is the
//! [`AsdkSession`] trait; [`NativeAsdk`] verifies the ASDK runtime location
//! from the descriptor and reports `DeviceUnavailable` until native
//! bindings are provided behind the trait.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use dm_core::{DmError, DmResult};

use crate::flats::FlatLibrary;
use crate::{validate_shape, DeformableMirror, StrokeLimits};

/// Model-specific descriptor keys for `alpaoDM`.
#[derive(Debug, Clone, Deserialize)]
pub struct AlpaoConfig {
    /// Directory holding the vendor ASDK runtime.
    pub lib_folder: PathBuf,

    pub n_actuators: usize,
}

/// The slice of the Alpao ASDK this driver uses.
#[async_trait]
pub trait AsdkSession: Send + Sync {
    /// Open the SDK session for the configured serial number.
    async fn connect(&self) -> DmResult<()>;

    /// Send one full normalized command vector.
    async fn send(&self, command: &[f64]) -> DmResult<()>;

    /// Release the SDK session. Idempotent.
    async fn release(&self) -> DmResult<()>;
}

/// Production session: locates the ASDK runtime named in the descriptor.
pub struct NativeAsdk {
    lib_folder: PathBuf,
    serial_number: String,
}

impl NativeAsdk {
    pub fn new(lib_folder: PathBuf, serial_number: String) -> Self {
        NativeAsdk {
            lib_folder,
            serial_number,
        }
    }
}

#[async_trait]
impl AsdkSession for NativeAsdk {
    async fn connect(&self) -> DmResult<()> {
        if !self.lib_folder.is_dir() {
            return Err(DmError::DeviceUnavailable(format!(
                "ASDK runtime folder not found: {}",
                self.lib_folder.display()
            )));
        }
        Err(DmError::DeviceUnavailable(format!(
            "ASDK runtime at {} for '{}' requires native bindings behind AsdkSession",
            self.lib_folder.display(),
            self.serial_number
        )))
    }

    async fn send(&self, _command: &[f64]) -> DmResult<()> {
        Err(DmError::NotInitialized)
    }

    async fn release(&self) -> DmResult<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct AlpaoState {
    shape: Vec<f64>,
    initialized: bool,
}

pub struct AlpaoDm {
    serial_number: String,
    config: AlpaoConfig,
    flats: FlatLibrary,
    session: Arc<dyn AsdkSession>,
    state: RwLock<AlpaoState>,
}

impl AlpaoDm {
    pub fn new(
        serial_number: String,
        config: AlpaoConfig,
        flats: FlatLibrary,
        session: Arc<dyn AsdkSession>,
    ) -> Self {
        let n = config.n_actuators;
        AlpaoDm {
            serial_number,
            config,
            flats,
            session,
            state: RwLock::new(AlpaoState {
                shape: vec![0.0; n],
                initialized: false,
            }),
        }
    }
}

#[async_trait]
impl DeformableMirror for AlpaoDm {
    fn model(&self) -> &'static str {
        "alpaoDM"
    }

    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    fn actuator_count(&self) -> usize {
        self.config.n_actuators
    }

    fn stroke_limits(&self) -> StrokeLimits {
        // ASDK takes normalized commands.
        StrokeLimits::symmetric(1.0)
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
        state.shape = vec![0.0; self.config.n_actuators];
        state.initialized = true;
        tracing::info!(serial = %self.serial_number, "ASDK session open");
        Ok(())
    }

    async fn apply_shape(&self, shape: &[f64]) -> DmResult<()> {
        validate_shape(self.config.n_actuators, self.stroke_limits(), shape)?;
        let mut state = self.state.write().await;
        if !state.initialized {
            return Err(DmError::NotInitialized);
        }
        self.session.send(shape).await?;
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
