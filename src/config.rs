//! Command-line and environment configuration for the server and client.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use clap::builder::RangedU64ValueParser;
use clap::{Parser, Subcommand};

pub const DEFAULT_PORT: u16 = 8899;

/// Largest request frame the server reads by default.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

fn default_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), DEFAULT_PORT)
}

#[derive(Debug, Clone, Parser)]
#[command(name = "kv-server", about = "Key-value service over the schema wire format")]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "KV_LISTEN", default_value_t = default_addr())]
    pub listen: SocketAddr,

    /// Maximum concurrent client connections
    #[arg(long, env = "KV_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: usize,

    /// Maximum concurrent connections from one IP address
    #[arg(
        long,
        env = "KV_MAX_PER_IP",
        default_value_t = 1,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub max_per_ip: usize,

    /// Largest request frame accepted, in bytes
    #[arg(long, env = "KV_MAX_FRAME_LENGTH", default_value_t = DEFAULT_MAX_FRAME_LENGTH)]
    pub max_frame_length: usize,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "kv-client", about = "Call the key-value service")]
pub struct ClientConfig {
    /// Server address
    #[arg(long, env = "KV_SERVER", default_value_t = default_addr())]
    pub server: SocketAddr,

    /// Per-call deadline in seconds
    #[arg(long, env = "KV_TIMEOUT_SECS", default_value_t = 5)]
    pub timeout_secs: u64,

    #[command(subcommand)]
    pub command: ClientCommand,
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum ClientCommand {
    /// Read the value stored under a key
    Get { key: String },
    /// Store a value under a key
    Set { key: String, value: String },
}
