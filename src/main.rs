//! replbridge - Persistent daemon keeping one REPL-style child warm.
//!
//! CHANGELOG:
//! - 03/02/2026 - Initial implementation

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use replbridge::config::{DaemonConfig, Dialect};
use replbridge::daemon::DaemonServer;
use std::path::Path;

#[derive(Parser)]
#[command(name = "replbridge")]
#[command(about = "Keep an interactive tool alive behind a UNIX socket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Tool dialect: script (JavaScript REPL) or pattern (migemo)
    #[arg(long, default_value = "script")]
    dialect: Dialect,

    /// Socket path (default depends on dialect)
    #[arg(long)]
    socket: Option<String>,
}

impl Target {
    fn config(&self) -> DaemonConfig {
        let config = DaemonConfig::from_env(self.dialect);
        match &self.socket {
            Some(socket) => config.with_socket_path(socket),
            None => config,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start {
        #[command(flatten)]
        target: Target,

        /// Command used to launch the child (overrides the dialect default)
        #[arg(long)]
        command: Option<String>,

        /// Respawn the child once its resident memory exceeds this many MiB
        #[arg(long)]
        memory_limit_mb: Option<u64>,

        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the daemon
    Stop {
        #[command(flatten)]
        target: Target,
    },

    /// Check daemon status
    Status {
        #[command(flatten)]
        target: Target,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            target,
            command,
            memory_limit_mb,
            foreground,
        } => {
            let mut config = target.config();
            if let Some(command) = command {
                config = config.with_command(command);
            }
            if let Some(mb) = memory_limit_mb {
                config = config.with_memory_limit_mb(mb);
            }
            cmd_start(config, foreground)
        }
        Commands::Stop { target } => cmd_stop(target.config()),
        Commands::Status { target } => cmd_status(target.config()),
    }
}

fn cmd_start(config: DaemonConfig, foreground: bool) -> Result<()> {
    // Create parent directory if needed
    if let Some(parent) = Path::new(&config.socket_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(
        dialect = %config.dialect,
        command = %config.command,
        memory_limit = config.memory_limit,
        "starting daemon"
    );

    if !foreground {
        // Background mode (fork into daemon process)
        use daemonize::Daemonize;

        let daemonize = Daemonize::new()
            .pid_file(config.pid_file())
            .working_directory("/tmp");

        daemonize.start().context("Failed to daemonize")?;
    }

    let mut server = DaemonServer::from_config(&config)?;
    server.serve()
}

fn cmd_stop(config: DaemonConfig) -> Result<()> {
    let pid_file = config.pid_file();

    let pid_str = std::fs::read_to_string(&pid_file)
        .with_context(|| format!("No PID file at {}", pid_file.display()))?;
    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid PID in {}", pid_file.display()))?;

    // SIGTERM lets the daemon kill its child before exiting
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => println!("Daemon stopped (pid {})", pid),
        Err(Errno::ESRCH) => println!("Daemon was not running (stale pid {})", pid),
        Err(e) => return Err(e).context("Failed to signal daemon"),
    }

    // Clean up files
    let _ = std::fs::remove_file(&pid_file);
    let _ = std::fs::remove_file(&config.socket_path);

    Ok(())
}

fn cmd_status(config: DaemonConfig) -> Result<()> {
    // Try to connect to socket
    match std::os::unix::net::UnixStream::connect(&config.socket_path) {
        Ok(_) => {
            println!(
                "Daemon ({}) running at {}",
                config.dialect,
                config.socket_path.display()
            );
            Ok(())
        }
        Err(_) => {
            println!("Daemon not running");
            std::process::exit(1);
        }
    }
}
