use anyhow::{Context, Result};
use clap::Parser;
use netboot_tftp::backend::FilesystemBackend;
use netboot_tftp::config::{
    parse_timeouts, PortRange, ServerConfig, SessionConfig, DEFAULT_MAX_BLOCK_SIZE, DEFAULT_MAX_SESSIONS,
};
use netboot_tftp::server::Server;
use std::future;
use std::net::SocketAddr;
use std::path::PathBuf;

/// TFTP server for network booting.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Address to listen on for read and write requests
    #[arg(long, default_value = "0.0.0.0:69")]
    bind: SocketAddr,

    /// Directory to serve files from
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Accept uploads into the root directory
    #[arg(long)]
    allow_writes: bool,

    /// Ports to run transfers on, as FIRST-LAST, or 0 to let the OS pick
    #[arg(long, default_value_t = PortRange::default())]
    session_ports: PortRange,

    /// Retry schedule in seconds. A datagram is re-sent after each delay but the last
    #[arg(long, default_value = "1,3,7")]
    timeout: String,

    /// Largest block size to agree to
    #[arg(long, default_value_t = DEFAULT_MAX_BLOCK_SIZE)]
    max_blksize: usize,

    /// Refuse requests with out-of-range option values instead of ignoring those options
    #[arg(long)]
    strict_options: bool,

    /// Most transfers to run at once
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    /// Log every datagram
    #[arg(long)]
    debug: bool,
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Interrupted"),
        Err(e) => {
            log::error!("Can't listen for Ctrl-C, running until killed: {e}");
            future::pending::<()>().await;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let timeouts = parse_timeouts(&args.timeout).context("Invalid --timeout")?;
    let root = args
        .root
        .canonicalize()
        .with_context(|| format!("Can't use {} as the root directory", args.root.display()))?;
    log::info!(
        "Serving {} ({})",
        root.display(),
        if args.allow_writes { "read-write" } else { "read-only" }
    );

    let config = ServerConfig {
        bind: args.bind,
        session_ports: args.session_ports,
        max_sessions: args.max_sessions,
        session: SessionConfig {
            timeouts,
            max_block_size: args.max_blksize,
            reject_invalid_options: args.strict_options,
        },
    };
    let backend = FilesystemBackend::new(root, true, args.allow_writes);
    let server = Server::bind(config, backend).context("Couldn't start the server")?;
    server.run(ctrl_c()).await;
    Ok(())
}
