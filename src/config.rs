//! Configuration module for the echolog server.
//!
//! Everything except the daemon toggle is fixed at build time. The values
//! live here as named constants so tests can swap in an ephemeral port and
//! a temporary store path.

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// TCP port the server listens on
pub const PORT: u16 = 9000;

/// Pending-connection queue length passed to `listen(2)`
pub const LISTEN_BACKLOG: i32 = 10;

/// Size of a single socket read and of each chunk streamed back
pub const CHUNK_SIZE: usize = 64;

/// Backing file of the message store
pub const STORE_PATH: &str = "/var/tmp/echologdata";

#[cfg(not(feature = "ipv6"))]
const BIND_ADDR: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

#[cfg(feature = "ipv6")]
const BIND_ADDR: IpAddr = IpAddr::V6(std::net::Ipv6Addr::LOCALHOST);

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "echolog")]
#[command(version = "0.1.0")]
#[command(about = "Appends newline-terminated messages to a log and replies with the whole log", long_about = None)]
pub struct CliArgs {
    /// Fork into the background and log to syslog only
    #[arg(short = 'd', long)]
    pub daemon: bool,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub store_path: PathBuf,
    pub chunk_size: usize,
    pub backlog: i32,
    pub daemon: bool,
}

impl Config {
    /// Build the fixed configuration, selecting daemon mode or not.
    pub fn new(daemon: bool) -> Self {
        Config {
            listen: SocketAddr::new(BIND_ADDR, PORT),
            store_path: PathBuf::from(STORE_PATH),
            chunk_size: CHUNK_SIZE,
            backlog: LISTEN_BACKLOG,
            daemon,
        }
    }

    /// Parse the command line and build the configuration from it.
    pub fn load() -> Self {
        let cli = CliArgs::parse();
        Self::new(cli.daemon)
    }
}
