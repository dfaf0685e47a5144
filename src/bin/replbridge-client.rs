//! replbridge-client - Thin client for the bridge daemon.
//!
//! CHANGELOG:
//! - 03/02/2026 - Reject non-positive or non-finite --timeout values
//! - 03/02/2026 - Initial implementation

use anyhow::{Context, Result};
use clap::Parser;
use replbridge::config::{DaemonConfig, Dialect};
use replbridge::daemon::DaemonClient;
use std::io::Read;

#[derive(Parser)]
#[command(name = "replbridge-client")]
#[command(about = "Send one payload to a replbridge daemon and print the reply")]
struct Cli {
    /// Payload to send (read from stdin when omitted)
    payload: Option<String>,

    /// Dialect whose default socket to use
    #[arg(long, default_value = "script")]
    dialect: Dialect,

    /// Socket path (overrides the dialect default)
    #[arg(long)]
    socket: Option<String>,

    /// Request timeout (seconds)
    #[arg(long, default_value = "5.0", value_parser = parse_timeout)]
    timeout: f64,
}

fn parse_timeout(s: &str) -> Result<f64, String> {
    let secs: f64 = s.parse().map_err(|_| format!("not a number: {s}"))?;
    if secs.is_finite() && secs > 0.0 {
        Ok(secs)
    } else {
        Err(format!("timeout must be a positive number of seconds, got {s}"))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.socket {
        Some(socket) => DaemonConfig::from_env(cli.dialect).with_socket_path(socket),
        None => DaemonConfig::from_env(cli.dialect),
    };

    let payload = match cli.payload {
        Some(p) => p.into_bytes(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read payload from stdin")?;
            buf
        }
    };

    let client = DaemonClient::new(config.socket_path, cli.timeout);
    match client.send(&payload) {
        Ok(reply) => {
            println!("{}", reply);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
