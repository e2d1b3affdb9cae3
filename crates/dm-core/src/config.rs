//! Deployment configuration model and loader.
//!
//! A deployment is described by one TOML document: a `[global]` identity
//! section, one `[devices.<name>]` table per physical unit, an ordered
//! `[[servers]]` array binding devices to network endpoints, and a
//! `[monitor]` section for the process monitor. Values can be overridden
//! through `DM_FLEET_`-prefixed environment variables.
//!
//! Model-specific descriptor keys are not interpreted here; they are kept as
//! a raw TOML table and handed to the driver selected by the `model` tag.
//! Unrecognized keys are ignored, missing required keys surface when the
//! driver parses its parameter table.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{DmError, DmResult};

/// Environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "DM_FLEET_";

/// Application identity strings used for default path resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Directory against which relative calibration and flat file paths
    /// are resolved. Defaults to the process working directory.
    #[serde(default)]
    pub calibration_root: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            calibration_root: None,
        }
    }
}

fn default_app_name() -> String {
    "dm-fleet".to_string()
}

/// Identity and connection facts for one physical unit.
///
/// Immutable once loaded; read-only to all runtime components.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceDescriptor {
    /// Table key under `[devices]`; filled in after deserialization.
    #[serde(skip)]
    pub name: String,

    /// Model tag selecting the driver. The closed set of known tags lives
    /// with the drivers; an unknown tag is fatal at device-server startup.
    pub model: String,

    #[serde(default)]
    pub serial_number: String,

    /// Flat position applied right after the server initializes the device.
    #[serde(default)]
    pub default_flat_tag: Option<String>,

    /// Named flat-position vectors, tag to calibration file.
    #[serde(default)]
    pub flats: BTreeMap<String, PathBuf>,

    /// Remaining model-specific keys, interpreted by the selected driver.
    #[serde(flatten)]
    pub params: toml::Table,
}

impl DeviceDescriptor {
    /// Deserialize the model-specific parameter table into a driver's
    /// config struct. Missing required keys become a configuration error
    /// naming the device.
    pub fn model_params<T: serde::de::DeserializeOwned>(&self) -> DmResult<T> {
        toml::Value::Table(self.params.clone())
            .try_into()
            .map_err(|e| {
                DmError::Configuration(format!(
                    "device '{}' ({}): {}",
                    self.name, self.model, e
                ))
            })
    }
}

/// How a mirror controller treats a second concurrent actuation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Queue behind the in-flight command.
    #[default]
    Queue,
    /// Fail immediately with `DeviceBusy`.
    Reject,
}

/// One device server's identity: which mirror it drives and where it binds.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerBinding {
    pub name: String,

    /// Key of the device descriptor this server drives.
    pub mirror: String,

    pub host: String,
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub busy_policy: BusyPolicy,
}

impl ServerBinding {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The process monitor's own binding and spawn policy.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub host: String,
    pub port: u16,

    /// Minimum delay between sequential launches. Throttles simultaneous
    /// hardware initialization on shared buses.
    #[serde(with = "humantime_serde", default = "default_spawn_delay")]
    pub spawn_delay: Duration,

    /// How long a freshly spawned server gets to open its endpoint.
    #[serde(with = "humantime_serde", default = "default_spawn_timeout")]
    pub spawn_timeout: Duration,

    /// Grace period between the shutdown RPC and forced termination.
    #[serde(with = "humantime_serde", default = "default_stop_grace")]
    pub stop_grace: Duration,

    /// Cadence of the background liveness check.
    #[serde(with = "humantime_serde", default = "default_liveness_interval")]
    pub liveness_interval: Duration,

    /// Where the `dm-server` executable lives. When unset the monitor looks
    /// next to its own executable.
    #[serde(default)]
    pub binaries_installation_directory: Option<PathBuf>,
}

impl MonitorConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_spawn_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_spawn_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_liveness_interval() -> Duration {
    Duration::from_secs(2)
}

/// The whole deployment document.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub devices: BTreeMap<String, DeviceDescriptor>,

    /// Declaration order is significant: `startAll` launches in this order.
    #[serde(default)]
    pub servers: Vec<ServerBinding>,

    pub monitor: MonitorConfig,
}

impl FleetConfig {
    /// Load and validate a deployment from a TOML file, with environment
    /// overrides applied on top.
    pub fn load(path: &Path) -> DmResult<Self> {
        if !path.exists() {
            return Err(DmError::Configuration(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        tracing::debug!(path = %path.display(), "loading deployment configuration");
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let config: FleetConfig = figment
            .extract()
            .map_err(|e| DmError::Configuration(e.to_string()))?;
        let config = config.finish()?;
        tracing::info!(
            devices = config.devices.len(),
            servers = config.servers.len(),
            "deployment configuration loaded"
        );
        Ok(config)
    }

    /// Parse a deployment from a TOML string (tests, embedded fixtures).
    pub fn from_toml_str(content: &str) -> DmResult<Self> {
        let config: FleetConfig =
            toml::from_str(content).map_err(|e| DmError::Configuration(e.to_string()))?;
        config.finish()
    }

    fn finish(mut self) -> DmResult<Self> {
        for (name, descriptor) in &mut self.devices {
            descriptor.name = name.clone();
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> DmResult<()> {
        let mut names = BTreeSet::new();
        let mut ports: BTreeMap<u16, &str> = BTreeMap::new();
        ports.insert(self.monitor.port, "monitor");

        for binding in &self.servers {
            if !names.insert(binding.name.as_str()) {
                return Err(DmError::Configuration(format!(
                    "duplicate server name '{}'",
                    binding.name
                )));
            }
            if let Some(holder) = ports.insert(binding.port, binding.name.as_str()) {
                return Err(DmError::Configuration(format!(
                    "port {} is bound by both '{}' and '{}'",
                    binding.port, holder, binding.name
                )));
            }
            if !self.devices.contains_key(&binding.mirror) {
                return Err(DmError::Configuration(format!(
                    "server '{}' references unknown device '{}'",
                    binding.name, binding.mirror
                )));
            }
        }
        Ok(())
    }

    /// Look up a server binding by name.
    pub fn binding(&self, name: &str) -> DmResult<&ServerBinding> {
        self.servers
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| DmError::UnknownServer(name.to_string()))
    }

    /// The descriptor a binding drives. Validation guarantees presence for
    /// loaded configs.
    pub fn descriptor_for(&self, binding: &ServerBinding) -> DmResult<&DeviceDescriptor> {
        self.devices.get(&binding.mirror).ok_or_else(|| {
            DmError::Configuration(format!(
                "server '{}' references unknown device '{}'",
                binding.name, binding.mirror
            ))
        })
    }

    /// Resolve a calibration or flat file path against the configured root.
    pub fn resolve_calibration_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.global.calibration_root {
            Some(root) => root.join(path),
            None => path.to_path_buf(),
        }
    }
}
