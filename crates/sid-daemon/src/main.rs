//! sid - storage-identification daemon.
//!
//! The entry point stays deliberately thin: parse flags, daemonize while
//! the process is still guaranteed single-threaded, initialise logging,
//! build the root resource and run its event loop until a signal exits it.
//!
//! Daemonization MUST happen before the event loop (and its signalfd
//! bookkeeping) exists: `fork()` only carries the calling thread, so all
//! process-wide setup happens strictly after the double fork.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sid_daemon::config::SidConfig;
use sid_daemon::ubridge;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// sid daemon - storage instantiation and identification
#[derive(Parser, Debug)]
#[command(name = "sid")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/sid/sid.toml")]
    config: PathBuf,

    /// Listening socket; a leading '@' selects the abstract namespace
    #[arg(long)]
    socket: Option<String>,

    /// Idle worker timeout in milliseconds
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Run in foreground (don't daemonize)
    #[arg(long)]
    no_daemon: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print the resource tree in DOT format after startup
    #[arg(long)]
    dump_dot: bool,
}

/// Double-fork daemonization; must run before any other thread or the
/// event loop exists.
#[allow(unsafe_code)] // fork() requires unsafe
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: nothing but the main thread exists at this point.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    setsid()?;

    // Second fork: the daemon can never reacquire a controlling terminal.
    // SAFETY: still single-threaded.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    std::env::set_current_dir("/")?;
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<SidConfig> {
    let mut config = if args.config.exists() {
        SidConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        SidConfig::default()
    };
    if let Some(socket) = &args.socket {
        config.socket_path.clone_from(socket);
    }
    if let Some(ms) = args.idle_timeout_ms {
        config.idle_timeout = std::time::Duration::from_millis(ms);
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    if !args.no_daemon {
        daemonize().context("daemonization failed")?;
    }

    init_logging(&args)?;
    let config = load_config(&args)?;

    info!(
        pid = std::process::id(),
        socket = %config.socket_path,
        "sid daemon starting"
    );

    let root = ubridge::create_root(config).context("failed to build the resource tree")?;
    if args.dump_dot {
        println!("{}", root.dump_dot());
    }

    let result = root.run_event_loop();
    let _ = root.destroy();
    info!("sid daemon shutdown complete");

    result.map_err(Into::into)
}
