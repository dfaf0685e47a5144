//! replbridge library
//!
//! Keeps one interactive child process warm behind a UNIX socket and
//! replaces it when its resident memory grows past a ceiling.
//!
//! CHANGELOG:
//! - 03/02/2026 - Initial library structure

pub mod bridge;
pub mod config;
pub mod daemon;
pub mod encoder;
pub mod error;
pub mod memory;
pub mod supervisor;

pub use bridge::{Bridge, CommandSpawner, Exchange, Spawn};
pub use config::{DaemonConfig, Dialect};
pub use encoder::{encode, Request};
pub use error::BridgeError;
pub use memory::{MemoryProbe, SysinfoProbe};
pub use supervisor::{ProcessSupervisor, Supervisor};
