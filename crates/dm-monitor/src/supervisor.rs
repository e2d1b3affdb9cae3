//! Lifecycle supervision of the device server processes.
//!
//! Each configured binding gets one [`SupervisedProcess`] record walking
//! the state machine `Stopped → Starting → Running → (Stopping → Stopped)
//! | Crashed`. The record map is guarded by one mutex held only across
//! state transitions, never across a spawn, wait, or readiness probe.
//!
//! A process found dead without a preceding stop request is recorded
//! `Crashed` and is never restarted automatically; unstable hardware gets
//! an operator decision, not a retry loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, info, warn};

use dm_core::config::{FleetConfig, MonitorConfig, ServerBinding};
use dm_core::protocol::{call, FleetStatus, MirrorRequest, ProcessState};
use dm_core::{DmError, DmResult};

/// What the operator last asked of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DesiredState {
    Running,
    Stopped,
}

/// Runtime record of one spawned device server.
struct SupervisedProcess {
    binding: ServerBinding,
    child: Option<Child>,
    desired: DesiredState,
    observed: ProcessState,
    restart_count: u32,
}

/// How the supervisor turns a binding into a running OS process.
///
/// The production launcher execs the `dm-server` binary; tests substitute
/// scripted processes.
pub trait ServerLauncher: Send + Sync {
    fn spawn(&self, binding: &ServerBinding, config_path: &Path) -> DmResult<Child>;
}

/// Spawns `dm-server --config <path> --server <name>`.
pub struct ExecLauncher {
    server_exe: PathBuf,
}

impl ExecLauncher {
    pub fn new(install_dir: Option<&Path>) -> Self {
        ExecLauncher {
            server_exe: locate_server_executable(install_dir),
        }
    }
}

/// The executable comes from the configured installation directory, or
/// else from the directory holding the monitor binary itself.
fn locate_server_executable(install_dir: Option<&Path>) -> PathBuf {
    let name = format!("dm-server{}", std::env::consts::EXE_SUFFIX);
    if let Some(dir) = install_dir {
        return dir.join(name);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

impl ServerLauncher for ExecLauncher {
    fn spawn(&self, binding: &ServerBinding, config_path: &Path) -> DmResult<Child> {
        info!(
            server = %binding.name,
            exe = %self.server_exe.display(),
            "launching device server"
        );
        let child = Command::new(&self.server_exe)
            .arg("--config")
            .arg(config_path)
            .arg("--server")
            .arg(&binding.name)
            .stdin(std::process::Stdio::null())
            .spawn()?;
        Ok(child)
    }
}

pub struct Supervisor {
    config_path: PathBuf,
    monitor: MonitorConfig,
    launcher: Box<dyn ServerLauncher>,
    procs: Mutex<Vec<SupervisedProcess>>,
}

impl Supervisor {
    pub fn new(fleet: &FleetConfig, config_path: PathBuf) -> Self {
        let launcher = Box::new(ExecLauncher::new(
            fleet
                .monitor
                .binaries_installation_directory
                .as_deref(),
        ));
        Self::with_launcher(fleet, config_path, launcher)
    }

    pub fn with_launcher(
        fleet: &FleetConfig,
        config_path: PathBuf,
        launcher: Box<dyn ServerLauncher>,
    ) -> Self {
        let procs = fleet
            .servers
            .iter()
            .map(|binding| SupervisedProcess {
                binding: binding.clone(),
                child: None,
                desired: DesiredState::Stopped,
                observed: ProcessState::Stopped,
                restart_count: 0,
            })
            .collect();
        Supervisor {
            config_path,
            monitor: fleet.monitor.clone(),
            launcher,
            procs: Mutex::new(procs),
        }
    }

    /// How many times a binding has been started again after a crash.
    pub async fn restart_count(&self, name: &str) -> DmResult<u32> {
        let procs = self.procs.lock().await;
        procs
            .iter()
            .find(|p| p.binding.name == name)
            .map(|p| p.restart_count)
            .ok_or_else(|| DmError::UnknownServer(name.to_string()))
    }

    /// Observed state of every process, without side effects.
    pub async fn status(&self) -> FleetStatus {
        self.procs
            .lock()
            .await
            .iter()
            .map(|p| (p.binding.name.clone(), p.observed))
            .collect()
    }

    /// Start one server. Already-running servers are a no-op.
    pub async fn start(&self, name: &str) -> DmResult<ProcessState> {
        // Transition under the lock, spawn outside it.
        let binding = {
            let mut procs = self.procs.lock().await;
            let proc = find_mut(&mut procs, name)?;
            match proc.observed {
                ProcessState::Running => return Ok(ProcessState::Running),
                ProcessState::Starting | ProcessState::Stopping => return Ok(proc.observed),
                ProcessState::Stopped | ProcessState::Crashed => {}
            }
            if proc.observed == ProcessState::Crashed {
                proc.restart_count += 1;
            }
            proc.desired = DesiredState::Running;
            proc.observed = ProcessState::Starting;
            proc.binding.clone()
        };

        let child = match self.launcher.spawn(&binding, &self.config_path) {
            Ok(child) => child,
            Err(e) => {
                self.transition(name, ProcessState::Crashed).await;
                return Err(e);
            }
        };
        {
            let mut procs = self.procs.lock().await;
            if let Ok(proc) = find_mut(&mut procs, name) {
                proc.child = Some(child);
            }
        }

        match wait_ready(&binding.addr(), self.monitor.spawn_timeout).await {
            Ok(()) => {
                self.transition(name, ProcessState::Running).await;
                info!(server = %name, addr = %binding.addr(), "device server running");
                Ok(ProcessState::Running)
            }
            Err(()) => {
                warn!(server = %name, "endpoint never became reachable, killing");
                self.reap(name).await;
                self.transition(name, ProcessState::Crashed).await;
                Err(DmError::SpawnTimeout {
                    name: name.to_string(),
                    timeout: self.monitor.spawn_timeout,
                })
            }
        }
    }

    /// Start every binding in declaration order, spacing launches by the
    /// configured spawn delay. Failures are recorded and logged; the walk
    /// continues.
    pub async fn start_all(&self) -> FleetStatus {
        let names: Vec<String> = {
            let procs = self.procs.lock().await;
            procs.iter().map(|p| p.binding.name.clone()).collect()
        };
        for (idx, name) in names.iter().enumerate() {
            if idx > 0 {
                sleep(self.monitor.spawn_delay).await;
            }
            if let Err(e) = self.start(name).await {
                warn!(server = %name, error = %e, "start failed");
            }
        }
        self.status().await
    }

    /// Stop one server: graceful shutdown RPC, bounded wait, then kill.
    pub async fn stop(&self, name: &str) -> DmResult<ProcessState> {
        let binding = {
            let mut procs = self.procs.lock().await;
            let proc = find_mut(&mut procs, name)?;
            if !matches!(proc.observed, ProcessState::Running) {
                return Ok(proc.observed);
            }
            proc.desired = DesiredState::Stopped;
            proc.observed = ProcessState::Stopping;
            proc.binding.clone()
        };

        // Best effort: the server may already be wedged.
        let addr = binding.addr();
        let shutdown = call(&addr, &MirrorRequest::Shutdown);
        if timeout(self.monitor.stop_grace, shutdown).await.is_err() {
            debug!(server = %name, "no answer to shutdown command");
        }

        let child = {
            let mut procs = self.procs.lock().await;
            find_mut(&mut procs, name).ok().and_then(|p| p.child.take())
        };
        if let Some(mut child) = child {
            match timeout(self.monitor.stop_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(server = %name, %status, "device server exited");
                }
                _ => {
                    warn!(server = %name, "grace period expired, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        self.transition(name, ProcessState::Stopped).await;
        Ok(ProcessState::Stopped)
    }

    /// Stop every server, in reverse declaration order.
    pub async fn stop_all(&self) -> FleetStatus {
        let names: Vec<String> = {
            let procs = self.procs.lock().await;
            procs.iter().rev().map(|p| p.binding.name.clone()).collect()
        };
        for name in &names {
            if let Err(e) = self.stop(name).await {
                warn!(server = %name, error = %e, "stop failed");
            }
        }
        self.status().await
    }

    /// Forcibly terminate every server, skipping the graceful RPC.
    pub async fn kill_all(&self) -> FleetStatus {
        let names: Vec<String> = {
            let procs = self.procs.lock().await;
            procs.iter().map(|p| p.binding.name.clone()).collect()
        };
        for name in &names {
            {
                let mut procs = self.procs.lock().await;
                if let Ok(proc) = find_mut(&mut procs, name) {
                    if matches!(proc.observed, ProcessState::Stopped) {
                        continue;
                    }
                    proc.desired = DesiredState::Stopped;
                }
            }
            self.reap(name).await;
            self.transition(name, ProcessState::Stopped).await;
        }
        self.status().await
    }

    /// One liveness sweep: a `Running` process found dead at the OS level
    /// becomes `Crashed`. No automatic restart.
    pub async fn check_liveness(&self) {
        let mut procs = self.procs.lock().await;
        for proc in procs.iter_mut() {
            if proc.observed != ProcessState::Running {
                continue;
            }
            let Some(child) = proc.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    proc.child = None;
                    // Death with a stop in flight is a normal exit; anything
                    // else is a crash and stays one until the operator acts.
                    if proc.desired == DesiredState::Stopped {
                        proc.observed = ProcessState::Stopped;
                    } else {
                        warn!(
                            server = %proc.binding.name,
                            %status,
                            "device server died without a stop request"
                        );
                        proc.observed = ProcessState::Crashed;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(server = %proc.binding.name, error = %e, "liveness probe failed");
                }
            }
        }
    }

    /// Run the liveness sweep forever at the configured cadence.
    pub async fn liveness_loop(&self) {
        let mut ticker = interval(self.monitor.liveness_interval);
        loop {
            ticker.tick().await;
            self.check_liveness().await;
        }
    }

    async fn transition(&self, name: &str, state: ProcessState) {
        let mut procs = self.procs.lock().await;
        if let Ok(proc) = find_mut(&mut procs, name) {
            debug!(server = %name, from = %proc.observed, to = %state, "state transition");
            proc.observed = state;
        }
    }

    /// Kill and reap a child, if one is attached.
    async fn reap(&self, name: &str) {
        let child = {
            let mut procs = self.procs.lock().await;
            find_mut(&mut procs, name).ok().and_then(|p| p.child.take())
        };
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

fn find_mut<'a>(
    procs: &'a mut [SupervisedProcess],
    name: &str,
) -> DmResult<&'a mut SupervisedProcess> {
    procs
        .iter_mut()
        .find(|p| p.binding.name == name)
        .ok_or_else(|| DmError::UnknownServer(name.to_string()))
}

/// Poll the endpoint with backoff until it accepts a connection or the
/// timeout expires.
async fn wait_ready(addr: &str, limit: Duration) -> Result<(), ()> {
    let deadline = Instant::now() + limit;
    let mut backoff = Duration::from_millis(50);
    loop {
        match TcpStream::connect(addr).await {
            Ok(_) => return Ok(()),
            Err(_) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(());
                }
                sleep(backoff.min(remaining)).await;
                backoff = (backoff * 2).min(Duration::from_millis(200));
            }
        }
    }
}
