//! Unix socket client for the bridge daemon.
//!
//! CHANGELOG:
//! - 03/02/2026 - Fall back to the default timeout on negative, NaN or zero values
//! - 03/02/2026 - Initial implementation

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::config::MAX_PAYLOAD_BYTES;

/// Timeout used when the requested one is unusable.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur when communicating with the daemon.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Socket not found: {0}")]
    SocketNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("Payload too large: {0} bytes (max {max})", max = MAX_PAYLOAD_BYTES)]
    PayloadTooLarge(usize),

    #[error("Empty response from daemon")]
    EmptyResponse,

    #[error("Timeout waiting for response")]
    Timeout,
}

/// A client for the bridge daemon.
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    /// Create a new client with the given socket path and timeout.
    ///
    /// A timeout that is negative, zero, NaN or too large for a `Duration`
    /// is replaced by [`DEFAULT_TIMEOUT`].
    pub fn new(socket_path: impl Into<PathBuf>, timeout_secs: f64) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: timeout_from_secs(timeout_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one payload and return the reply line without its newline.
    pub fn send(&self, payload: &[u8]) -> Result<String, ClientError> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(ClientError::PayloadTooLarge(payload.len()));
        }

        if !self.socket_path.exists() {
            return Err(ClientError::SocketNotFound(
                self.socket_path.display().to_string(),
            ));
        }

        let stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut writer = &stream;
        writer.write_all(payload).map_err(map_timeout)?;
        writer.flush()?;
        stream.shutdown(Shutdown::Write)?;

        let mut reader = BufReader::new(&stream);
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).map_err(map_timeout)?;

        if bytes_read == 0 {
            return Err(ClientError::EmptyResponse);
        }

        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

fn timeout_from_secs(secs: f64) -> Duration {
    match Duration::try_from_secs_f64(secs) {
        Ok(timeout) if !timeout.is_zero() => timeout,
        _ => {
            tracing::warn!(secs, "unusable timeout, using default");
            DEFAULT_TIMEOUT
        }
    }
}

fn map_timeout(e: std::io::Error) -> ClientError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => ClientError::Timeout,
        _ => ClientError::ConnectionFailed(e),
    }
}
