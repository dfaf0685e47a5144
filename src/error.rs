//! Error types for the subprocess bridge.
//!
//! CHANGELOG:
//! - 03/02/2026 - Initial implementation

use thiserror::Error;

/// Errors raised while spawning or talking to the child process.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open pseudo-terminal: {0}")]
    Pty(#[source] nix::Error),

    #[error("Child I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Child process {pid} closed its output")]
    ChildExited { pid: u32 },

    #[error("Spawn command is empty")]
    EmptyCommand,
}

impl BridgeError {
    /// True when the child is gone and the handle should be discarded.
    pub fn is_child_gone(&self) -> bool {
        match self {
            BridgeError::ChildExited { .. } => true,
            BridgeError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
