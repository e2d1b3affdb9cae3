//! The per-device control server.
//!
//! One process drives exactly one mirror: a [`controller::MirrorController`]
//! imposes uniform policy on the selected driver, and [`server::run`]
//! exposes it over the newline-delimited JSON protocol on the binding's
//! TCP endpoint.

pub mod controller;
pub mod server;

pub use controller::MirrorController;
