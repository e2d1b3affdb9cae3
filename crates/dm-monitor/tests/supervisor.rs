//! Supervisor tests against real OS processes.
//!
//! Scripted `/bin/sh` children stand in for device servers; endpoint
//! readiness is observed the same way production does, by connecting to
//! the binding's TCP port.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::process::{Child, Command};

use dm_core::config::{FleetConfig, ServerBinding};
use dm_core::protocol::{call, MonitorRequest, ProcessState};
use dm_core::DmResult;
use dm_monitor::{server, ServerLauncher, Supervisor};

/// Launches a shell script instead of the dm-server binary and records
/// when each launch happened.
struct ScriptLauncher {
    script: String,
    spawn_times: Mutex<Vec<Instant>>,
}

impl ScriptLauncher {
    fn new(script: &str) -> Self {
        ScriptLauncher {
            script: script.to_string(),
            spawn_times: Mutex::new(Vec::new()),
        }
    }

    fn spawn_count(&self) -> usize {
        self.spawn_times.lock().unwrap().len()
    }
}

impl ServerLauncher for ScriptLauncher {
    fn spawn(&self, _binding: &ServerBinding, _config_path: &Path) -> DmResult<Child> {
        self.spawn_times.lock().unwrap().push(Instant::now());
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Deployment with one binding per port, tuned for fast tests.
fn fleet_with_ports(ports: &[u16]) -> FleetConfig {
    let mut doc = String::from(
        "[global]\napp_name = \"dm-fleet\"\n\n",
    );
    for (idx, port) in ports.iter().enumerate() {
        doc.push_str(&format!(
            "[devices.sim{n}]\nmodel = \"simulatedDM\"\nserial_number = \"SIM-{n}\"\n\n\
             [[servers]]\nname = \"dm{n}\"\nmirror = \"sim{n}\"\nhost = \"127.0.0.1\"\nport = {port}\n\n",
            n = idx + 1,
        ));
    }
    doc.push_str(
        "[monitor]\nhost = \"127.0.0.1\"\nport = 16900\n\
         spawn_delay = \"150ms\"\nspawn_timeout = \"500ms\"\n\
         stop_grace = \"200ms\"\nliveness_interval = \"100ms\"\n",
    );
    FleetConfig::from_toml_str(&doc).unwrap()
}

/// Shareable handle so tests can assert on launches after handing the
/// launcher to the supervisor.
#[derive(Clone)]
struct SharedLauncher(Arc<ScriptLauncher>);

impl ServerLauncher for SharedLauncher {
    fn spawn(&self, binding: &ServerBinding, config_path: &Path) -> DmResult<Child> {
        self.0.spawn(binding, config_path)
    }
}

fn supervisor_with(fleet: &FleetConfig, launcher: ScriptLauncher) -> (Supervisor, Arc<ScriptLauncher>) {
    let launcher = Arc::new(launcher);
    let supervisor = Supervisor::with_launcher(
        fleet,
        PathBuf::from("/tmp/fleet-under-test.toml"),
        Box::new(SharedLauncher(launcher.clone())),
    );
    (supervisor, launcher)
}

/// Reserve a free port, optionally keeping a listener on it so readiness
/// probes succeed.
async fn reserve_port(keep_open: bool) -> (u16, Option<TcpListener>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    if keep_open {
        (port, Some(listener))
    } else {
        drop(listener);
        (port, None)
    }
}

#[tokio::test]
async fn status_starts_all_stopped() {
    let fleet = fleet_with_ports(&[17001, 17002]);
    let supervisor = Supervisor::with_launcher(
        &fleet,
        PathBuf::from("/tmp/unused.toml"),
        Box::new(ScriptLauncher::new("sleep 30")),
    );
    let status = supervisor.status().await;
    assert_eq!(status["dm1"], ProcessState::Stopped);
    assert_eq!(status["dm2"], ProcessState::Stopped);
}

#[tokio::test]
async fn start_observes_endpoint_readiness() {
    let (port, _listener) = reserve_port(true).await;
    let fleet = fleet_with_ports(&[port]);
    let (supervisor, launcher) = supervisor_with(&fleet, ScriptLauncher::new("sleep 30"));

    let state = supervisor.start("dm1").await.unwrap();
    assert_eq!(state, ProcessState::Running);
    assert_eq!(supervisor.status().await["dm1"], ProcessState::Running);

    // Starting a running server is a no-op.
    let state = supervisor.start("dm1").await.unwrap();
    assert_eq!(state, ProcessState::Running);
    assert_eq!(launcher.spawn_count(), 1);

    supervisor.kill_all().await;
    assert_eq!(supervisor.status().await["dm1"], ProcessState::Stopped);
}

#[tokio::test]
async fn unreachable_endpoint_is_a_spawn_timeout() {
    let (port, _) = reserve_port(false).await;
    let fleet = fleet_with_ports(&[port]);
    let (supervisor, _launcher) = supervisor_with(&fleet, ScriptLauncher::new("sleep 30"));

    let err = supervisor.start("dm1").await.unwrap_err();
    assert_eq!(err.kind(), "SpawnTimeout");
    assert_eq!(supervisor.status().await["dm1"], ProcessState::Crashed);
}

#[tokio::test]
async fn dead_process_is_recorded_crashed_and_not_restarted() {
    let (port, _listener) = reserve_port(true).await;
    let fleet = fleet_with_ports(&[port]);
    // The child exits immediately; the held listener satisfies readiness.
    let (supervisor, launcher) = supervisor_with(&fleet, ScriptLauncher::new("exit 0"));

    supervisor.start("dm1").await.unwrap();
    assert_eq!(supervisor.status().await["dm1"], ProcessState::Running);

    tokio::time::sleep(Duration::from_millis(50)).await;
    supervisor.check_liveness().await;
    assert_eq!(supervisor.status().await["dm1"], ProcessState::Crashed);

    // Further sweeps leave it crashed; nothing is respawned.
    supervisor.check_liveness().await;
    supervisor.check_liveness().await;
    assert_eq!(supervisor.status().await["dm1"], ProcessState::Crashed);
    assert_eq!(launcher.spawn_count(), 1);
    assert_eq!(supervisor.restart_count("dm1").await.unwrap(), 0);
}

#[tokio::test]
async fn stop_escalates_to_kill_after_the_grace_period() {
    let (port, _listener) = reserve_port(true).await;
    let fleet = fleet_with_ports(&[port]);
    // `sleep 30` never answers the shutdown RPC and never exits on its own.
    let (supervisor, _launcher) = supervisor_with(&fleet, ScriptLauncher::new("sleep 30"));

    supervisor.start("dm1").await.unwrap();
    let started = Instant::now();
    let state = supervisor.stop("dm1").await.unwrap();
    assert_eq!(state, ProcessState::Stopped);
    // Graceful wait expired before the kill.
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(supervisor.status().await["dm1"], ProcessState::Stopped);
}

#[tokio::test]
async fn start_all_spaces_launches_by_the_spawn_delay() {
    let (port_a, _la) = reserve_port(true).await;
    let (port_b, _lb) = reserve_port(true).await;
    let fleet = fleet_with_ports(&[port_a, port_b]);
    let (supervisor, launcher) = supervisor_with(&fleet, ScriptLauncher::new("sleep 30"));

    let status = supervisor.start_all().await;
    assert_eq!(status["dm1"], ProcessState::Running);
    assert_eq!(status["dm2"], ProcessState::Running);

    let times = launcher.spawn_times.lock().unwrap().clone();
    assert_eq!(times.len(), 2);
    assert!(
        times[1].duration_since(times[0]) >= Duration::from_millis(150),
        "launches not spaced: {:?}",
        times[1].duration_since(times[0])
    );

    supervisor.kill_all().await;
}

#[tokio::test]
async fn unknown_binding_names_are_rejected() {
    let fleet = fleet_with_ports(&[17050]);
    let supervisor = Supervisor::with_launcher(
        &fleet,
        PathBuf::from("/tmp/unused.toml"),
        Box::new(ScriptLauncher::new("sleep 30")),
    );
    let err = supervisor.start("dm9").await.unwrap_err();
    assert_eq!(err.kind(), "UnknownServer");
    let err = supervisor.stop("dm9").await.unwrap_err();
    assert_eq!(err.kind(), "UnknownServer");
}

#[tokio::test]
async fn admin_rpc_reports_status_and_errors() {
    let fleet = fleet_with_ports(&[17060]);
    let supervisor = Arc::new(Supervisor::with_launcher(
        &fleet,
        PathBuf::from("/tmp/unused.toml"),
        Box::new(ScriptLauncher::new("sleep 30")),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server::run(listener, supervisor));

    let reply = call(&addr, &MonitorRequest::Status).await.unwrap();
    assert!(reply.ok);
    assert_eq!(reply.data.unwrap()["dm1"], "stopped");

    let reply = call(
        &addr,
        &MonitorRequest::Start {
            name: "dm9".into(),
        },
    )
    .await
    .unwrap();
    assert!(!reply.ok);
    assert_eq!(reply.error_kind(), Some("UnknownServer"));
}
