//! Physik Instrumente piezo tip-tilt stage driver.
//!
//! The stage is a two-axis device commanded with open-loop amplitudes over
//! the PI GCS text protocol. Initialization stops any running modulation
//! and disables the closed control loop, then every shape command sets both
//! axes (`SVA`) and reads back through `SVA?`.
//!
//! The wire link is the [`GcsLink`] trait; [`TcpGcs`] is the production
//! implementation over the controller's TCP port.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};

use dm_core::{DmError, DmResult};

use crate::flats::FlatLibrary;
use crate::{validate_shape, DeformableMirror, StrokeLimits};

/// Tip and tilt.
pub const TIP_TILT_AXES: usize = 2;

/// Model-specific descriptor keys for `piTipTilt`.
#[derive(Debug, Clone, Deserialize)]
pub struct PiConfig {
    pub ip_address: String,

    #[serde(default = "default_gcs_port")]
    pub port: u16,

    /// Open-loop amplitude range accepted by the controller.
    #[serde(default = "default_command_min")]
    pub command_min: f64,
    #[serde(default = "default_command_max")]
    pub command_max: f64,
}

fn default_gcs_port() -> u16 {
    // GCS controllers listen on 50000 by convention.
    50000
}

fn default_command_min() -> f64 {
    0.0
}

fn default_command_max() -> f64 {
    100.0
}

/// One GCS conversation: send command lines, read single-line replies.
#[async_trait]
pub trait GcsLink: Send + Sync {
    async fn connect(&self) -> DmResult<()>;

    /// Send a command that produces no reply.
    async fn command(&self, line: &str) -> DmResult<()>;

    /// Send a query and read one reply line.
    async fn query(&self, line: &str) -> DmResult<String>;

    /// Drop the connection. Idempotent.
    async fn close(&self) -> DmResult<()>;
}

/// GCS over the controller's TCP port.
pub struct TcpGcs {
    addr: String,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl TcpGcs {
    pub fn new(ip_address: &str, port: u16) -> Self {
        TcpGcs {
            addr: format!("{ip_address}:{port}"),
            stream: Mutex::new(None),
        }
    }
}

#[async_trait]
impl GcsLink for TcpGcs {
    async fn connect(&self) -> DmResult<()> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            DmError::DeviceUnavailable(format!("GCS controller at {}: {}", self.addr, e))
        })?;
        *self.stream.lock().await = Some(BufReader::new(stream));
        Ok(())
    }

    async fn command(&self, line: &str) -> DmResult<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(DmError::NotInitialized)?;
        stream
            .get_mut()
            .write_all(format!("{line}\n").as_bytes())
            .await?;
        Ok(())
    }

    async fn query(&self, line: &str) -> DmResult<String> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(DmError::NotInitialized)?;
        stream
            .get_mut()
            .write_all(format!("{line}\n").as_bytes())
            .await?;
        let mut reply = String::new();
        let n = stream.read_line(&mut reply).await?;
        if n == 0 {
            return Err(DmError::DeviceUnavailable(format!(
                "GCS controller at {} closed the connection",
                self.addr
            )));
        }
        Ok(reply.trim().to_string())
    }

    async fn close(&self) -> DmResult<()> {
        self.stream.lock().await.take();
        Ok(())
    }
}

#[derive(Debug)]
struct PiState {
    shape: Vec<f64>,
    initialized: bool,
}

pub struct PiTipTilt {
    serial_number: String,
    config: PiConfig,
    flats: FlatLibrary,
    link: Arc<dyn GcsLink>,
    state: RwLock<PiState>,
}

impl PiTipTilt {
    pub fn new(
        serial_number: String,
        config: PiConfig,
        flats: FlatLibrary,
        link: Arc<dyn GcsLink>,
    ) -> Self {
        PiTipTilt {
            serial_number,
            config,
            flats,
            link,
            state: RwLock::new(PiState {
                shape: vec![0.0; TIP_TILT_AXES],
                initialized: false,
            }),
        }
    }

    /// Send a command and confirm the controller accepted it.
    async fn send_checked(&self, line: &str) -> DmResult<()> {
        self.link.command(line).await?;
        let err = self.link.query("ERR?").await?;
        if err.trim() != "0" {
            return Err(DmError::DeviceUnavailable(format!(
                "GCS error {} after '{}'",
                err.trim(),
                line
            )));
        }
        Ok(())
    }

    /// Parse a `SVA?` reply; controllers answer either `1=12.5` or `12.5`.
    fn parse_amplitude(reply: &str) -> DmResult<f64> {
        let value = reply.rsplit('=').next().unwrap_or(reply).trim();
        value.parse().map_err(|_| {
            DmError::DeviceUnavailable(format!("unparseable GCS amplitude reply '{reply}'"))
        })
    }
}

#[async_trait]
impl DeformableMirror for PiTipTilt {
    fn model(&self) -> &'static str {
        "piTipTilt"
    }

    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    fn actuator_count(&self) -> usize {
        TIP_TILT_AXES
    }

    fn stroke_limits(&self) -> StrokeLimits {
        StrokeLimits {
            min: self.config.command_min,
            max: self.config.command_max,
        }
    }

    fn is_initialized(&self) -> bool {
        self.state
            .try_read()
            .map(|s| s.initialized)
            .unwrap_or(false)
    }

    async fn initialize(&self) -> DmResult<()> {
        self.link.connect().await?;
        let idn = self.link.query("*IDN?").await?;
        tracing::info!(serial = %self.serial_number, controller = %idn, "GCS link up");

        // Open-loop operation: stop modulation, disable the servo loop.
        for axis in 1..=TIP_TILT_AXES {
            self.send_checked(&format!("MOD {axis} 0")).await?;
            self.send_checked(&format!("SVO {axis} 0")).await?;
        }

        let mut state = self.state.write().await;
        state.shape = vec![0.0; TIP_TILT_AXES];
        state.initialized = true;
        Ok(())
    }

    async fn apply_shape(&self, shape: &[f64]) -> DmResult<()> {
        validate_shape(TIP_TILT_AXES, self.stroke_limits(), shape)?;
        let mut state = self.state.write().await;
        if !state.initialized {
            return Err(DmError::NotInitialized);
        }
        for (axis, value) in shape.iter().enumerate() {
            self.send_checked(&format!("SVA {} {}", axis + 1, value))
                .await?;
        }
        state.shape.copy_from_slice(shape);
        Ok(())
    }

    async fn shape(&self) -> DmResult<Vec<f64>> {
        let state = self.state.read().await;
        if !state.initialized {
            return Err(DmError::NotInitialized);
        }
        let mut shape = Vec::with_capacity(TIP_TILT_AXES);
        for axis in 1..=TIP_TILT_AXES {
            let reply = self.link.query(&format!("SVA? {axis}")).await?;
            shape.push(Self::parse_amplitude(&reply)?);
        }
        Ok(shape)
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
            self.link.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Scripted GCS controller: records commands, answers queries.
    struct FakeGcs {
        sent: Mutex<Vec<String>>,
        amplitudes: Mutex<HashMap<usize, f64>>,
    }

    impl FakeGcs {
        fn new() -> Self {
            FakeGcs {
                sent: Mutex::new(Vec::new()),
                amplitudes: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl GcsLink for FakeGcs {
        async fn connect(&self) -> DmResult<()> {
            Ok(())
        }

        async fn command(&self, line: &str) -> DmResult<()> {
            if let Some(rest) = line.strip_prefix("SVA ") {
                let mut parts = rest.split_whitespace();
                let axis: usize = parts.next().unwrap_or("0").parse().unwrap_or(0);
                let value: f64 = parts.next().unwrap_or("0").parse().unwrap_or(0.0);
                self.amplitudes.lock().await.insert(axis, value);
            }
            self.sent.lock().await.push(line.to_string());
            Ok(())
        }

        async fn query(&self, line: &str) -> DmResult<String> {
            if line == "ERR?" {
                return Ok("0".to_string());
            }
            if line == "*IDN?" {
                return Ok("PI S-330 fake".to_string());
            }
            if let Some(axis) = line.strip_prefix("SVA? ") {
                let axis: usize = axis.trim().parse().unwrap_or(0);
                let value = self
                    .amplitudes
                    .lock()
                    .await
                    .get(&axis)
                    .copied()
                    .unwrap_or(0.0);
                return Ok(format!("{axis}={value}"));
            }
            Ok(String::new())
        }

        async fn close(&self) -> DmResult<()> {
            Ok(())
        }
    }

    fn stage(link: Arc<FakeGcs>) -> PiTipTilt {
        let config = PiConfig {
            ip_address: "192.168.1.40".into(),
            port: default_gcs_port(),
            command_min: 0.0,
            command_max: 100.0,
        };
        PiTipTilt::new(
            "S330-8431".into(),
            config,
            FlatLibrary::with_zero(TIP_TILT_AXES),
            link,
        )
    }

    #[tokio::test]
    async fn initialize_goes_open_loop() {
        let link = Arc::new(FakeGcs::new());
        let tt = stage(link.clone());
        tt.initialize().await.unwrap();
        let sent = link.sent.lock().await.clone();
        assert!(sent.contains(&"MOD 1 0".to_string()));
        assert!(sent.contains(&"SVO 2 0".to_string()));
    }

    #[tokio::test]
    async fn shape_round_trips_through_gcs() {
        let link = Arc::new(FakeGcs::new());
        let tt = stage(link);
        tt.initialize().await.unwrap();
        tt.apply_shape(&[12.5, 48.0]).await.unwrap();
        assert_eq!(tt.shape().await.unwrap(), vec![12.5, 48.0]);
    }

    #[tokio::test]
    async fn tip_tilt_takes_exactly_two_axes() {
        let tt = stage(Arc::new(FakeGcs::new()));
        tt.initialize().await.unwrap();
        let err = tt.apply_shape(&[10.0]).await.unwrap_err();
        assert_eq!(err.kind(), "ShapeDimensionMismatch");
        let err = tt.apply_shape(&[10.0, 20.0, 30.0]).await.unwrap_err();
        assert_eq!(err.kind(), "ShapeDimensionMismatch");
    }

    #[tokio::test]
    async fn amplitude_range_is_enforced() {
        let tt = stage(Arc::new(FakeGcs::new()));
        tt.initialize().await.unwrap();
        let err = tt.apply_shape(&[10.0, 150.0]).await.unwrap_err();
        assert_eq!(err.kind(), "OutOfRange");
    }

    #[test]
    fn amplitude_replies_parse_both_forms() {
        assert_eq!(PiTipTilt::parse_amplitude("1=12.5").unwrap(), 12.5);
        assert_eq!(PiTipTilt::parse_amplitude("48").unwrap(), 48.0);
        assert!(PiTipTilt::parse_amplitude("garbage").is_err());
    }
}
