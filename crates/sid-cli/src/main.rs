//! usid - client for the storage-identification daemon.
//!
//! The device manager invokes `usid identify` from its event rules: the
//! whole event environment is forwarded to the daemon as the request
//! payload, and the event sequence number rides in the header status field.
//! `version` and `checkpoint` exist for operators and rule debugging.

mod client;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use sid_daemon::protocol::{CommandKind, Version, DEFAULT_SOCKET_PATH};
use tracing_subscriber::EnvFilter;

use crate::client::DaemonClient;

/// usid - storage instantiation and identification client
#[derive(Parser, Debug)]
#[command(name = "usid")]
#[command(version, about, long_about = None)]
struct Args {
    /// Daemon socket; a leading '@' selects the abstract namespace
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Query the daemon version
    Version,
    /// Forward the current environment as a device identification request
    Identify,
    /// Send a checkpoint marker
    Checkpoint,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let client = DaemonClient::new(&args.socket);

    let reply = match args.command {
        Cmd::Version => {
            let reply = client.request(CommandKind::Version, 0, &[])?;
            if !reply.failed() {
                let version = Version::parse(&reply.payload)?;
                println!("{}.{}.{}", version.major, version.minor, version.release);
            }
            reply
        },
        Cmd::Identify => {
            let payload = env_payload(std::env::vars());
            let seqnum = std::env::var("SEQNUM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            client.request(CommandKind::Identify, seqnum, &payload)?
        },
        Cmd::Checkpoint => client.request(CommandKind::Checkpoint, 0, &[])?,
    };

    if reply.failed() {
        bail!("daemon reported failure (status {:#x})", reply.header.status);
    }
    Ok(())
}

/// Serialises environment variables as the NUL-delimited `KEY=VALUE`
/// payload. Empty values are dropped; the daemon treats them as malformed.
fn env_payload(vars: impl Iterator<Item = (String, String)>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in vars {
        if value.is_empty() {
            continue;
        }
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}
