use crate::processor::DEFAULT_MAX_RETRIES;
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4970;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Everything the listener and its sessions need to know. Built once at startup and handed to
/// the server; sessions get their own clone.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address of the well-known endpoint requests arrive on.
    pub bind: SocketAddr,

    /// Directory read requests are served from.
    pub read_root: PathBuf,

    /// Directory write requests are stored in.
    pub write_root: PathBuf,

    /// How long to wait for the peer before retransmitting.
    pub timeout: Duration,

    /// Consecutive timeouts on one block before a transfer is abandoned.
    pub max_retries: u32,

    /// Local ports sessions may bind. `None` lets the OS pick.
    pub port_range: Option<RangeInclusive<u16>>,

    pub allow_overwrite: bool,
    pub read_only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            read_root: PathBuf::from("./read"),
            write_root: PathBuf::from("./write"),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            port_range: None,
            allow_overwrite: false,
            read_only: false,
        }
    }
}

fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, String> {
    let (lo, hi) = s
        .split_once('-')
        .ok_or_else(|| format!("expected LOW-HIGH, got '{s}'"))?;
    let lo: u16 = lo.trim().parse().map_err(|e| format!("bad port '{lo}': {e}"))?;
    let hi: u16 = hi.trim().parse().map_err(|e| format!("bad port '{hi}': {e}"))?;
    if lo == 0 || lo > hi {
        return Err(format!("invalid port range {lo}-{hi}"));
    }
    Ok(lo..=hi)
}

/// Serves files over TFTP (RFC 1350, octet mode)
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// IP address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    pub address: std::net::IpAddr,

    /// Well-known port requests are received on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory read requests are served from
    #[arg(long, default_value = "./read")]
    pub read_dir: PathBuf,

    /// Directory uploaded files are written to
    #[arg(long, default_value = "./write")]
    pub write_dir: PathBuf,

    /// Retransmission timeout in milliseconds
    #[arg(short, long, default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_ms: u64,

    /// Number of timeouts on a single block before giving up
    #[arg(short, long, default_value_t = DEFAULT_MAX_RETRIES, value_parser = clap::value_parser!(u32).range(1..))]
    pub retries: u32,

    /// Restrict session ports to a range, e.g. 50000-50100
    #[arg(long, value_parser = parse_port_range)]
    pub port_range: Option<RangeInclusive<u16>>,

    /// Replace existing files on write requests
    #[arg(long)]
    pub overwrite: bool,

    /// Refuse all write requests
    #[arg(long)]
    pub read_only: bool,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind: SocketAddr::new(args.address, args.port),
            read_root: args.read_dir,
            write_root: args.write_dir,
            timeout: Duration::from_millis(args.timeout_ms),
            max_retries: args.retries,
            port_range: args.port_range,
            allow_overwrite: args.overwrite,
            read_only: args.read_only,
        }
    }
}
