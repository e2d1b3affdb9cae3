//! Administrative RPC endpoint of the process monitor.
//!
//! Same ndjson framing as the device servers, but a disjoint command set:
//! lifecycle only, never actuation.

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use dm_core::protocol::{decode, write_message, MonitorRequest, Reply};
use dm_core::DmResult;

use crate::supervisor::Supervisor;

/// Serve administrative commands until Ctrl-C, then stop every server.
pub async fn run(listener: TcpListener, supervisor: Arc<Supervisor>) -> DmResult<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping all device servers");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "admin client connected");
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, supervisor).await {
                        warn!(%peer, error = %e, "admin connection ended with error");
                    }
                });
            }
        }
    }

    supervisor.stop_all().await;
    Ok(())
}

async fn handle_connection(stream: TcpStream, supervisor: Arc<Supervisor>) -> DmResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let reply = match decode::<MonitorRequest>(&line) {
            Ok(request) => dispatch(&supervisor, request).await,
            Err(e) => Reply::err(&e),
        };
        write_message(&mut write_half, &reply).await?;
    }
}

async fn dispatch(supervisor: &Supervisor, request: MonitorRequest) -> Reply {
    match request {
        MonitorRequest::StartAll => Reply::ok(supervisor.start_all().await),
        MonitorRequest::StopAll => Reply::ok(supervisor.stop_all().await),
        MonitorRequest::KillAll => Reply::ok(supervisor.kill_all().await),
        MonitorRequest::Start { name } => match supervisor.start(&name).await {
            Ok(state) => Reply::ok(json!({ "name": name, "state": state })),
            Err(e) => Reply::err(&e),
        },
        MonitorRequest::Stop { name } => match supervisor.stop(&name).await {
            Ok(state) => Reply::ok(json!({ "name": name, "state": state })),
            Err(e) => Reply::err(&e),
        },
        MonitorRequest::Status => Reply::ok(supervisor.status().await),
    }
}
