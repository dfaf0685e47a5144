//! UNIX socket server for daemon mode.
//!
//! Listens on a UNIX socket, accepts connections one at a time, and forwards
//! each payload to the Supervisor. One reply line per connection.
//!
//! CHANGELOG:
//! - 03/02/2026 - Signal thread kills a child stuck mid-exchange; silent clients can't hold shutdown
//! - 03/02/2026 - Shutdown flag + non-blocking accept so SIGTERM kills the child
//! - 03/02/2026 - Initial implementation

use anyhow::{Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bridge::{CommandSpawner, Spawn};
use crate::config::{DaemonConfig, MAX_PAYLOAD_BYTES};
use crate::memory::{MemoryProbe, SysinfoProbe};
use crate::supervisor::{ProcessSupervisor, Supervisor};

/// Sleep between accept polls while idle.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long a payload read waits before re-checking the shutdown flag.
const CLIENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Daemon server listening on UNIX socket.
pub struct DaemonServer<S: Spawn, P: MemoryProbe> {
    supervisor: Supervisor<S, P>,
    listener: UnixListener,
    socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    child_pid: Arc<AtomicU32>,
}

/// Signal thread registration; closing it stops the thread.
struct SignalListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl DaemonServer<CommandSpawner, SysinfoProbe> {
    /// Bind the socket for `config` with a supervisor over the real command.
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        Self::bind(&config.socket_path, ProcessSupervisor::from_config(config))
    }
}

impl<S: Spawn, P: MemoryProbe> DaemonServer<S, P> {
    /// Bind `socket_path`, replacing any stale socket file.
    pub fn bind(socket_path: impl AsRef<Path>, supervisor: Supervisor<S, P>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        // Clean up stale socket
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;

        // Set permissions to owner-only (0600)
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let child_pid = supervisor.pid_handle();
        Ok(Self {
            supervisor,
            listener,
            socket_path,
            shutdown: Arc::new(AtomicBool::new(false)),
            child_pid,
        })
    }

    /// Flag that stops `serve` at the next poll once set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Start the child, then serve requests until shutdown (blocking).
    pub fn serve(&mut self) -> Result<()> {
        // Registered first so a signal during bootstrap also reaches the child.
        let _signals = self.register_signals()?;

        let dialect = self.supervisor.dialect();
        if dialect.needs_bootstrap() {
            let banner = self
                .supervisor
                .bootstrap()
                .context("Failed to bootstrap child process")?;
            debug!(banner = %banner, "bootstrap complete");
        } else {
            self.supervisor
                .start()
                .context("Failed to start child process")?;
        }

        self.listener.set_nonblocking(true)?;

        info!(socket = %self.socket_path.display(), %dialect, "listening");

        // Accept connections sequentially (single-threaded)
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = self.handle_connection(stream) {
                        log_connection_error(&e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept error");
                }
            }
        }

        info!("shutting down");
        self.supervisor.terminate();
        let _ = std::fs::remove_file(&self.socket_path);

        Ok(())
    }

    /// Route SIGTERM, SIGINT and SIGHUP to a thread that sets the shutdown
    /// flag and kills the live child. Killing the child closes its pty, so an
    /// exchange blocked on it fails with EIO and the accept loop gets to see
    /// the flag.
    fn register_signals(&self) -> Result<SignalListener> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])
            .context("Failed to register signal handlers")?;
        let handle = signals.handle();
        let shutdown = Arc::clone(&self.shutdown);
        let child_pid = Arc::clone(&self.child_pid);

        let thread = std::thread::spawn(move || {
            for signal in signals.forever() {
                info!(signal, "received signal, shutting down");
                shutdown.store(true, Ordering::SeqCst);
                kill_child(child_pid.load(Ordering::SeqCst));
            }
        });

        Ok(SignalListener {
            handle,
            thread: Some(thread),
        })
    }

    /// Handle a single client connection.
    fn handle_connection(&mut self, mut stream: UnixStream) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(CLIENT_POLL_INTERVAL))?;

        // One read, like a single recv(2): clients send the whole payload at once.
        let mut buf = vec![0u8; MAX_PAYLOAD_BYTES];
        let n = loop {
            match stream.read(&mut buf) {
                Ok(n) => break n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    if self.shutdown.load(Ordering::SeqCst) {
                        debug!("shutdown while waiting for payload, dropping client");
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };
        let payload = &buf[..n];

        let response = self.supervisor.dispatch(payload)?;

        stream.write_all(response.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;

        Ok(())
    }
}

fn kill_child(pid: u32) {
    if pid == 0 {
        return;
    }
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => debug!(pid, "sent SIGTERM to child"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "failed to signal child"),
    }
}

fn log_connection_error(e: &anyhow::Error) {
    let client_gone = e
        .downcast_ref::<std::io::Error>()
        .map(|io| {
            matches!(
                io.kind(),
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected
            )
        })
        .unwrap_or(false);

    if client_gone {
        warn!(error = %e, "client disconnected before reply");
    } else {
        error!(error = %e, "connection error");
    }
}
