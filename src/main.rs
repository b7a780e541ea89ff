use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use treeshare::overlay::Overlay;
use treeshare::topology::{DEFAULT_MAX_CONN, DEFAULT_TCP_PORT};
use treeshare::utils::log::{self, LogLevel};

#[derive(Parser)]
#[command(name = "treeshare", about = "Tree-structured peer-to-peer overlay node")]
struct Cli {
    /// Print progress and state transitions, not just warnings.
    #[arg(short, long)]
    verbose: bool,

    /// Run as a receive-only leaf that never accepts children.
    #[arg(short, long)]
    terminal: bool,

    /// Port to accept child connections on.
    #[arg(short = 'p', long, default_value_t = DEFAULT_TCP_PORT)]
    tcp_port: u16,

    /// Upper bound on admitted children; 0 implies --terminal.
    #[arg(short = 'm', long, default_value_t = DEFAULT_MAX_CONN)]
    max_connections: u16,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Start a new overlay as its root node.
    Host {
        /// Directory shared with the overlay.
        dir: PathBuf,
        /// Shared key children must present to join.
        key: String,
    },
    /// Join an existing overlay through a parent node.
    Connect {
        /// Hostname or IPv4 address of the parent.
        host: String,
        /// Port the parent listens on.
        port: u16,
        /// Shared key of the overlay.
        key: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    log::set_global_log_level(if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Warning
    });

    let terminal = cli.terminal || cli.max_connections == 0;

    let mut overlay = match cli.mode {
        Mode::Host { dir, key } => {
            if terminal {
                bail!("a root node cannot be terminal");
            }
            let mut overlay = Overlay::root();
            overlay.set_dir(dir);
            overlay.set_key(key);
            overlay
        }
        Mode::Connect { host, port, key } => {
            let parent = resolve(&host, port)?;
            let mut overlay = Overlay::child(parent, terminal);
            overlay.set_key(key);
            overlay
        }
    };

    overlay.set_tcp_port(cli.tcp_port);
    overlay.set_max_conn(cli.max_connections);

    overlay
        .start()
        .context("unable to establish overlay structure")?;
    overlay.run()
}

/// First IPv4 result for `host:port`.
fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddrV4> {
    let addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("invalid host {:?}", host))?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(v4);
        }
    }
    bail!("no IPv4 address found for {:?}", host)
}
