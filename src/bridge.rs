//! Subprocess bridge: one long-lived child and the line exchange with it.
//!
//! The child's stdin is a pipe we write to; its stdout is the slave side of a
//! pseudo-terminal so that line-buffered tools flush after every line. Each
//! exchange writes one line and blocks until exactly one line comes back.
//!
//! CHANGELOG:
//! - 03/02/2026 - Don't double the newline on lines that already end in one
//! - 03/02/2026 - Initial implementation

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::Termios;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::AsRawFd;
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::{debug, warn};

use crate::config::DaemonConfig;
use crate::error::BridgeError;

/// One blocking request/response channel to a child process.
///
/// Callers only see this trait, so a bounded variant (timeouts, watchdogs) can
/// replace the blocking implementation without touching them.
pub trait Exchange {
    /// Process ID of the child.
    fn pid(&self) -> u32;

    /// Write `line` terminated by a newline (added only if missing), then
    /// read one reply line.
    fn exchange(&mut self, line: &str) -> Result<String, BridgeError>;

    /// Signal the child and release its streams. Safe to call repeatedly.
    fn terminate(&mut self);
}

/// Factory for fresh children.
pub trait Spawn {
    type Child: Exchange;

    fn spawn(&self) -> Result<Self::Child, BridgeError>;
}

/// A running child wired to a pipe (stdin) and a pty (stdout).
pub struct Bridge {
    pid: u32,
    child: Option<Child>,
    writer: Option<ChildStdin>,
    reader: Option<BufReader<File>>,
    prefix_strip: usize,
}

impl Bridge {
    /// Launch `command` and attach to its standard streams.
    pub fn spawn(command: &str, prefix_strip: usize) -> Result<Self, BridgeError> {
        let mut cmd = build_command(command)?;

        let pty = openpty(None::<&Winsize>, None::<&Termios>).map_err(BridgeError::Pty)?;
        // Neither end may leak into other children; the slave is dup'ed onto
        // the child's stdout, which clears the flag there.
        for fd in [pty.master.as_raw_fd(), pty.slave.as_raw_fd()] {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(BridgeError::Pty)?;
        }

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::from(pty.slave))
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                command: command.to_string(),
                source,
            })?;
        // Dropping `cmd` closes our copy of the slave, so EOF on the master
        // means the child is gone.
        drop(cmd);

        let writer = child.stdin.take();
        let pid = child.id();

        debug!(pid, command, "child attached to pty");

        Ok(Self {
            pid,
            child: Some(child),
            writer,
            reader: Some(BufReader::new(File::from(pty.master))),
            prefix_strip,
        })
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    fn read_reply(&mut self) -> Result<String, BridgeError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or(BridgeError::ChildExited { pid: self.pid })?;

        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => Err(BridgeError::ChildExited { pid: self.pid }),
            Ok(_) => Ok(strip_reply(&line, self.prefix_strip)),
            // Linux reports a closed slave side as EIO on the master.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                Err(BridgeError::ChildExited { pid: self.pid })
            }
            Err(e) => Err(BridgeError::Io(e)),
        }
    }
}

impl Exchange for Bridge {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn exchange(&mut self, line: &str) -> Result<String, BridgeError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or(BridgeError::ChildExited { pid: self.pid })?;

        // A payload that already ends in a newline must stay one line, or the
        // extra reply would answer the next request.
        writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        self.read_reply()
    }

    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid = self.pid, error = %e, "failed to signal child"),
        }

        self.writer = None;
        self.reader = None;

        // Reap in the background; a child slow to exit must not stall the caller.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        debug!(pid = self.pid, "child terminated");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Spawns `Bridge`s from a fixed command line.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    command: String,
    prefix_strip: usize,
}

impl CommandSpawner {
    pub fn new(command: impl Into<String>, prefix_strip: usize) -> Self {
        Self {
            command: command.into(),
            prefix_strip,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(config.command.clone(), config.dialect.prefix_strip())
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Spawn for CommandSpawner {
    type Child = Bridge;

    fn spawn(&self) -> Result<Bridge, BridgeError> {
        Bridge::spawn(&self.command, self.prefix_strip)
    }
}

/// Characters that need a shell to interpret the command line.
const SHELL_META: &[char] = &[
    '*', '?', '{', '}', '[', ']', '<', '>', '(', ')', '~', '&', '|', '\\', '$', ';', '\'',
    '`', '"', '\n', '#', '=',
];

/// Plain command lines are exec'd directly; anything with shell syntax goes
/// through `sh -c "exec ..."` so the child PID is still the tool's PID.
fn build_command(command: &str) -> Result<Command, BridgeError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(BridgeError::EmptyCommand);
    }

    if command.contains(SHELL_META) {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(format!("exec {}", command));
        return Ok(cmd);
    }

    let mut words = command.split_whitespace();
    let program = words.next().ok_or(BridgeError::EmptyCommand)?;
    let mut cmd = Command::new(program);
    cmd.args(words);
    Ok(cmd)
}

/// Drop the tool's fixed prefix and trailing whitespace (including the `\r`
/// the pty adds).
fn strip_reply(line: &str, prefix_strip: usize) -> String {
    line.chars()
        .skip(prefix_strip)
        .collect::<String>()
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT_REPL: &str = r#"sh -c 'while IFS= read -r l; do printf "=> %s\n" "$l"; done'"#;

    #[test]
    fn test_strip_reply() {
        assert_eq!(strip_reply(">> 5\r\n", 3), "5");
        assert_eq!(strip_reply("kensaku  \r\n", 0), "kensaku");
        assert_eq!(strip_reply("ab\n", 3), "");
        assert_eq!(strip_reply("=> \u{3042}\r\n", 3), "\u{3042}");
    }

    #[test]
    fn test_build_command_direct_and_shell() {
        let cmd = build_command("cmigemo -q").unwrap();
        assert_eq!(cmd.get_program(), "cmigemo");
        assert_eq!(cmd.get_args().collect::<Vec<_>>(), vec!["-q"]);

        let cmd = build_command("echo $HOME").unwrap();
        assert_eq!(cmd.get_program(), "/bin/sh");
        assert_eq!(
            cmd.get_args().collect::<Vec<_>>(),
            vec!["-c", "exec echo $HOME"]
        );

        assert!(matches!(build_command("  "), Err(BridgeError::EmptyCommand)));
    }

    #[test]
    fn test_exchange_with_cat() {
        let mut bridge = Bridge::spawn("cat", 0).unwrap();
        assert_eq!(bridge.exchange("hello").unwrap(), "hello");
        assert_eq!(bridge.exchange("again").unwrap(), "again");
        bridge.terminate();
    }

    #[test]
    fn test_trailing_newline_is_not_doubled() {
        let mut bridge = Bridge::spawn("cat", 0).unwrap();
        assert_eq!(bridge.exchange("a\n").unwrap(), "a");
        assert_eq!(bridge.exchange("b").unwrap(), "b");
        assert_eq!(bridge.exchange("c").unwrap(), "c");
        bridge.terminate();
    }

    #[test]
    fn test_exchange_strips_prompt_prefix() {
        let mut bridge = Bridge::spawn(PROMPT_REPL, 3).unwrap();
        assert_eq!(bridge.exchange("(() => { 1; })()").unwrap(), "(() => { 1; })()");
        bridge.terminate();
    }

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let result = Bridge::spawn("definitely-not-a-real-tool-4821 -q", 0);
        assert!(matches!(result, Err(BridgeError::Spawn { .. })));
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut bridge = Bridge::spawn("cat", 0).unwrap();
        assert!(bridge.is_running());
        bridge.terminate();
        bridge.terminate();
        assert!(!bridge.is_running());
        assert!(matches!(
            bridge.exchange("late"),
            Err(BridgeError::ChildExited { .. })
        ));
    }

    #[test]
    fn test_exited_child_reports_child_exited() {
        let mut bridge = Bridge::spawn("sh -c 'read -r l; exit 0'", 0).unwrap();
        let result = bridge.exchange("bye");
        assert!(matches!(result, Err(BridgeError::ChildExited { .. })));
    }

    #[test]
    fn test_spawner_uses_config() {
        let config = DaemonConfig::for_dialect(crate::config::Dialect::Script);
        let spawner = CommandSpawner::from_config(&config);
        assert_eq!(spawner.command(), "osascript -l JavaScript -i -ss");
    }
}
