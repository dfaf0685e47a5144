//! Daemon mode: the socket accept loop and its client.
//!
//! CHANGELOG:
//! - 03/02/2026 - Initial module structure

pub mod client;
pub mod server;

pub use client::{ClientError, DaemonClient};
pub use server::DaemonServer;
