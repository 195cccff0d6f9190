// This is an implementation of a TFTP server following RFC 1350, octet mode only.
//
// A transfer begins with a request to read or write a file, sent to the server's well-known
// port. The server answers from a port chosen for that one transfer, and every later packet of
// the transfer goes through it. The file moves in blocks of 512 bytes, and each block must be
// acknowledged before the next one is sent. A block shorter than 512 bytes (possibly empty) ends
// the transfer.
//
// On loss, whoever is waiting times out and retransmits its last packet. After a fixed number of
// timeouts on the same block the transfer is abandoned.
//
// Most errors terminate the transfer. They are signaled with an error packet, which is a
// courtesy: it is neither acknowledged nor retransmitted.
//
// Packets (all integers big-endian):
//
// opcode   operation
// 1        Read req (RRQ)     | 01 | Filename | 0 | Mode | 0 |
// 2        Write req (WRQ)    | 02 | Filename | 0 | Mode | 0 |
// 3        Data (DATA)        | 03 | Block # (2) | Data (0-512) |
// 4        ACK                | 04 | Block # (2) |
// 5        ERROR              | 05 | ErrorCode (2) | ErrMsg | 0 |
//
// A write is acknowledged with ACK 0 before the first DATA arrives; a read is answered directly
// with DATA 1.
//
// Error codes
//
// 0    Not defined, see msg
// 1    File not found
// 2    Access violation
// 3    Disk full / alloc exceeded
// 4    Illegal TFTP op
// 5    Unknown TID
// 6    File already exists
// 7    No such user
//
// Not supported: netascii and mail modes (the mode is ignored and every transfer is binary),
// option negotiation, multicast.

pub mod config;
pub mod processor;
pub mod server;
pub mod srv_conn;
pub mod tftp;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Args, ServerConfig};
use server::TftpServer;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    for dir in [&config.read_root, &config.write_root] {
        if !dir.is_dir() {
            log::warn!("{:?} is not a directory, requests against it will fail", dir);
        }
    }

    let server = TftpServer::bind(config.clone())
        .with_context(|| format!("Failed to bind TFTP server socket on {}", config.bind))?;
    server.run().await;

    Ok(())
}
