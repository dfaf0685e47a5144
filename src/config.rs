//! Daemon configuration: dialects, defaults and environment overrides.
//!
//! Each dialect pins the native tool it drives, how its output lines are
//! framed, and where its socket lives:
//! - `script`: interactive JavaScript REPL (`osascript -l JavaScript -i -ss`)
//! - `pattern`: pattern transliteration engine (`cmigemo -q`)
//!
//! Environment (read once at start):
//! - JXA_MEMORY_LIMIT / MIGEMO_MEMORY_LIMIT (mebibytes, default 64)
//! - REPLBRIDGE_SOCKET (socket path override)
//! - REPLBRIDGE_COMMAND (spawn command override)
//!
//! CHANGELOG:
//! - 03/02/2026 - Saturate huge MiB limits instead of overflowing
//! - 03/02/2026 - Initial implementation

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default memory ceiling in mebibytes.
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 64;

/// Largest request payload accepted from a client.
pub const MAX_PAYLOAD_BYTES: usize = 1 << 16;

const MIB: u64 = 1024 * 1024;

/// Request/response convention of the tool behind the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Scripting REPL fed with IIFE-wrapped code.
    Script,
    /// Pattern transliteration engine fed with raw patterns.
    Pattern,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Script => "script",
            Dialect::Pattern => "pattern",
        }
    }

    /// Command launched for this dialect unless overridden.
    pub fn default_command(&self) -> &'static str {
        match self {
            Dialect::Script => "osascript -l JavaScript -i -ss",
            Dialect::Pattern => "cmigemo -q",
        }
    }

    pub fn default_socket_path(&self) -> &'static str {
        match self {
            Dialect::Script => "/tmp/jxa-daemon.sock",
            Dialect::Pattern => "/tmp/migemo-daemon.sock",
        }
    }

    /// Environment variable holding the memory ceiling (in MiB).
    pub fn memory_env_var(&self) -> &'static str {
        match self {
            Dialect::Script => "JXA_MEMORY_LIMIT",
            Dialect::Pattern => "MIGEMO_MEMORY_LIMIT",
        }
    }

    /// Leading characters dropped from every reply line.
    ///
    /// The REPL answers with a `>> ` style prompt before each result; the
    /// width is specific to that tool, not part of the socket protocol.
    pub fn prefix_strip(&self) -> usize {
        match self {
            Dialect::Script => 3,
            Dialect::Pattern => 0,
        }
    }

    /// Whether the child prints startup output that must be drained with an
    /// empty exchange before real traffic.
    pub fn needs_bootstrap(&self) -> bool {
        matches!(self, Dialect::Pattern)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "script" | "jxa" => Ok(Dialect::Script),
            "pattern" | "migemo" => Ok(Dialect::Pattern),
            other => Err(format!("Unknown dialect: {}", other)),
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub dialect: Dialect,
    /// Shell command line used to launch the child.
    pub command: String,
    pub socket_path: PathBuf,
    /// Resident memory ceiling in bytes.
    pub memory_limit: u64,
}

impl DaemonConfig {
    /// Built-in defaults for a dialect.
    pub fn for_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            command: dialect.default_command().to_string(),
            socket_path: PathBuf::from(dialect.default_socket_path()),
            memory_limit: DEFAULT_MEMORY_LIMIT_MB * MIB,
        }
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env(dialect: Dialect) -> Self {
        Self::from_lookup(dialect, |key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(dialect: Dialect, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::for_dialect(dialect);

        if let Some(raw) = lookup(dialect.memory_env_var()) {
            match raw.trim().parse::<u64>() {
                Ok(mb) => config.memory_limit = mb.saturating_mul(MIB),
                Err(_) => tracing::warn!(
                    var = dialect.memory_env_var(),
                    value = %raw,
                    "ignoring unparsable memory limit"
                ),
            }
        }

        if let Some(socket) = lookup("REPLBRIDGE_SOCKET").filter(|s| !s.trim().is_empty()) {
            config = config.with_socket_path(socket);
        }

        if let Some(command) = lookup("REPLBRIDGE_COMMAND").filter(|s| !s.trim().is_empty()) {
            config.command = command;
        }

        config
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Set the socket path, expanding a leading `~`.
    pub fn with_socket_path(mut self, path: impl AsRef<str>) -> Self {
        self.socket_path = PathBuf::from(shellexpand::tilde(path.as_ref()).to_string());
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_memory_limit_mb(self, mb: u64) -> Self {
        self.with_memory_limit(mb.saturating_mul(MIB))
    }

    /// PID file written next to the socket in background mode.
    pub fn pid_file(&self) -> PathBuf {
        let mut name = self.socket_path.clone().into_os_string();
        name.push(".pid");
        PathBuf::from(name)
    }
}
