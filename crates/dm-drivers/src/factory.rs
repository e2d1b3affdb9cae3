//! Closed model-tag dispatch.
//!
//! A device server selects its driver exactly once, at startup, from the
//! descriptor's model tag. The set of tags is closed; anything else is
//! `UnknownDeviceModel` and fatal.

use std::path::Path;
use std::sync::Arc;

use dm_core::config::DeviceDescriptor;
use dm_core::{DmError, DmResult};

use crate::alpao::{AlpaoConfig, AlpaoDm, NativeAsdk};
use crate::bmc::{BmcConfig, BmcMultiDm, MemsLinearization, NativeBmc};
use crate::flats::FlatLibrary;
use crate::meadowlark::{MeadowlarkConfig, MeadowlarkSlm, NativeBlink};
use crate::pi_tip_tilt::{PiConfig, PiTipTilt, TcpGcs, TIP_TILT_AXES};
use crate::simulated::{SimulatedConfig, SimulatedDm};
use crate::DeformableMirror;

/// The model tags this build can drive.
pub const KNOWN_MODELS: [&str; 5] = [
    "simulatedDM",
    "alpaoDM",
    "bmcMultiDM",
    "piTipTilt",
    "meadowlarkSLM",
];

/// Build the driver for a descriptor.
///
/// Relative calibration and flat file paths are resolved against
/// `calibration_root`. Configuration problems surface as
/// `ConfigurationError` (missing model keys) or `InvalidCalibration`
/// (unreadable calibration artifacts); both are fatal at server startup.
pub fn build_driver(
    descriptor: &DeviceDescriptor,
    calibration_root: Option<&Path>,
) -> DmResult<Box<dyn DeformableMirror>> {
    match descriptor.model.as_str() {
        "simulatedDM" => {
            let config: SimulatedConfig = descriptor.model_params()?;
            let flats =
                FlatLibrary::for_descriptor(descriptor, config.n_actuators, calibration_root)?;
            Ok(Box::new(SimulatedDm::new(
                descriptor.serial_number.clone(),
                config,
                flats,
            )))
        }
        "alpaoDM" => {
            let config: AlpaoConfig = descriptor.model_params()?;
            let flats =
                FlatLibrary::for_descriptor(descriptor, config.n_actuators, calibration_root)?;
            let session = Arc::new(NativeAsdk::new(
                config.lib_folder.clone(),
                descriptor.serial_number.clone(),
            ));
            Ok(Box::new(AlpaoDm::new(
                descriptor.serial_number.clone(),
                config,
                flats,
                session,
            )))
        }
        "bmcMultiDM" => {
            let config: BmcConfig = descriptor.model_params()?;
            let calibration_path = resolve(&config.calibration_filename, calibration_root);
            let linearization = MemsLinearization::load(&calibration_path)?;
            let flats = FlatLibrary::for_descriptor(
                descriptor,
                linearization.n_actuators(),
                calibration_root,
            )?;
            let session = Arc::new(NativeBmc::new(descriptor.serial_number.clone()));
            Ok(Box::new(BmcMultiDm::new(
                descriptor.serial_number.clone(),
                linearization,
                flats,
                session,
            )))
        }
        "piTipTilt" => {
            let config: PiConfig = descriptor.model_params()?;
            let flats = FlatLibrary::for_descriptor(descriptor, TIP_TILT_AXES, calibration_root)?;
            let link = Arc::new(TcpGcs::new(&config.ip_address, config.port));
            Ok(Box::new(PiTipTilt::new(
                descriptor.serial_number.clone(),
                config,
                flats,
                link,
            )))
        }
        "meadowlarkSLM" => {
            let config: MeadowlarkConfig = descriptor.model_params()?;
            let session = Arc::new(NativeBlink::new(descriptor.serial_number.clone()));
            Ok(Box::new(MeadowlarkSlm::new(
                descriptor,
                config,
                calibration_root,
                session,
            )?))
        }
        other => Err(DmError::UnknownDeviceModel(other.to_string())),
    }
}

fn resolve(path: &Path, calibration_root: Option<&Path>) -> std::path::PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match calibration_root {
        Some(root) => root.join(path),
        None => path.to_path_buf(),
    }
}
