//! Shared foundation for the dm-fleet control servers.
//!
//! This crate carries everything both halves of the system agree on: the
//! error taxonomy with its stable wire kinds, the deployment configuration
//! model, and the newline-delimited JSON protocol spoken by the per-device
//! servers and the process monitor.

pub mod config;
pub mod error;
pub mod protocol;

pub use error::{DmError, DmResult};
