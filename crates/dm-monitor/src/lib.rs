//! The process monitor.
//!
//! One [`supervisor::Supervisor`] owns the runtime records of every
//! configured device server process: it spawns them, watches their
//! liveness, and tears them down. [`server::run`] exposes the supervisor
//! over its own RPC endpoint, kept strictly separate from the per-device
//! actuation protocol.

pub mod server;
pub mod supervisor;

pub use supervisor::{ServerLauncher, Supervisor};
