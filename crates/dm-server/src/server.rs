//! TCP request/response loop for one device server.
//!
//! Connections are handled concurrently; each carries a sequence of
//! newline-delimited JSON requests. Actuation commands funnel into the
//! single [`MirrorController`], which serializes hardware access, so
//! concurrent clients can never interleave partial writes.

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use dm_core::protocol::{decode, write_message, MirrorRequest, Reply};
use dm_core::DmResult;

use crate::controller::MirrorController;

/// Serve the controller until a `shutdown` command or Ctrl-C arrives, then
/// release the driver. Returning `Ok` means a clean exit (process code 0).
pub async fn run(listener: TcpListener, controller: Arc<MirrorController>) -> DmResult<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "client connected");
                let controller = controller.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, controller, shutdown_tx).await {
                        warn!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
        }
    }

    if let Err(e) = controller.shutdown().await {
        // The process still exits cleanly; the hardware may already be gone.
        error!(error = %e, "driver shutdown failed");
    }
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    controller: Arc<MirrorController>,
    shutdown_tx: watch::Sender<bool>,
) -> DmResult<()> {
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

        let (reply, shutdown) = match decode::<MirrorRequest>(&line) {
            Ok(request) => dispatch(&controller, request).await,
            Err(e) => (Reply::err(&e), false),
        };
        write_message(&mut write_half, &reply).await?;

        if shutdown {
            info!("shutdown command accepted");
            let _ = shutdown_tx.send(true);
            return Ok(());
        }
    }
}

/// Map one request onto the controller. The bool asks the accept loop to
/// stop after the reply is on the wire.
async fn dispatch(controller: &MirrorController, request: MirrorRequest) -> (Reply, bool) {
    match request {
        MirrorRequest::Ping => (Reply::ok_empty(), false),
        MirrorRequest::GetStatus => (Reply::ok(controller.status().await), false),
        MirrorRequest::GetShape => {
            let shape = controller.shape().await;
            (Reply::ok(json!({ "shape": shape })), false)
        }
        MirrorRequest::SetShape { shape } => match controller.set_shape(&shape).await {
            Ok(()) => (Reply::ok_empty(), false),
            Err(e) => (Reply::err(&e), false),
        },
        MirrorRequest::ApplyFlat { tag } => match controller.apply_flat(tag.as_deref()).await {
            Ok(applied) => (Reply::ok(json!({ "tag": applied })), false),
            Err(e) => (Reply::err(&e), false),
        },
        MirrorRequest::GetSnapshot { prefix } => {
            (Reply::ok(controller.snapshot(prefix.as_deref()).await), false)
        }
        MirrorRequest::Shutdown => (Reply::ok_empty(), true),
    }
}
