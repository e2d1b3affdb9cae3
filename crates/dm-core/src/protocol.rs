//! Wire protocol for both RPC surfaces.
//!
//! Both the per-device servers and the process monitor speak newline-
//! delimited JSON over TCP: one request object per line, one reply object
//! per line. The two surfaces share the reply envelope but deliberately
//! share no command set, so lifecycle control can never be confused with
//! hardware actuation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::{DmError, DmResult};

// =============================================================================
// Requests
// =============================================================================

/// Commands accepted by a device server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum MirrorRequest {
    Ping,
    GetStatus,
    GetShape,
    SetShape {
        shape: Vec<f64>,
    },
    /// Apply a named flat position; `tag` defaults to the descriptor's
    /// `default_flat_tag`.
    ApplyFlat {
        #[serde(default)]
        tag: Option<String>,
    },
    /// Prefix-keyed snapshot of identity and counters.
    GetSnapshot {
        #[serde(default)]
        prefix: Option<String>,
    },
    Shutdown,
}

/// Commands accepted by the process monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum MonitorRequest {
    StartAll,
    StopAll,
    KillAll,
    Start { name: String },
    Stop { name: String },
    Status,
}

// =============================================================================
// Reply envelope
// =============================================================================

/// Error body carried in failed replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

impl From<&DmError> for WireError {
    fn from(e: &DmError) -> Self {
        WireError {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// The uniform `{ok, data?, error?}` reply envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    pub fn ok_empty() -> Self {
        Reply {
            ok: true,
            data: None,
            error: None,
        }
    }

    pub fn ok<T: Serialize>(data: T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Reply {
                ok: true,
                data: Some(value),
                error: None,
            },
            Err(e) => Reply::err(&DmError::Internal(format!(
                "failed to encode reply payload: {e}"
            ))),
        }
    }

    pub fn err(e: &DmError) -> Self {
        Reply {
            ok: false,
            data: None,
            error: Some(WireError::from(e)),
        }
    }

    /// Kind string of a failed reply, if any.
    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }
}

// =============================================================================
// Shared payloads
// =============================================================================

/// Cached runtime status of one mirror, served without touching the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorStatus {
    pub name: String,
    pub model: String,
    pub serial_number: String,
    pub n_actuators: usize,
    pub healthy: bool,
    pub flat_tag: Option<String>,
    pub command_counter: u64,
    pub last_command_at: Option<DateTime<Utc>>,
}

/// Observed state of one supervised server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Crashed => "crashed",
        };
        write!(f, "{label}")
    }
}

/// `status()` reply of the process monitor.
pub type FleetStatus = BTreeMap<String, ProcessState>;

// =============================================================================
// Codec
// =============================================================================

/// Encode a message as one protocol line (no trailing newline).
pub fn encode<T: Serialize>(msg: &T) -> DmResult<String> {
    serde_json::to_string(msg).map_err(|e| DmError::Internal(format!("encode: {e}")))
}

/// Decode one protocol line.
pub fn decode<T: DeserializeOwned>(line: &str) -> DmResult<T> {
    serde_json::from_str(line.trim()).map_err(|e| DmError::BadRequest(e.to_string()))
}

/// Write one message and terminating newline.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> DmResult<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let mut line = encode(msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// One-shot client call: connect, send a single request, read one reply.
///
/// Used by the monitor to issue `shutdown` to its servers and by tests.
pub async fn call<T: Serialize>(addr: &str, request: &T) -> DmResult<Reply> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    write_message(&mut write_half, request).await?;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(DmError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before reply",
        )));
    }
    decode(&line)
}
