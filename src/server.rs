// The listener owns the well-known endpoint. It never takes part in a transfer itself: each
// request is decoded and handed to a session task with a socket of its own, and the listener goes
// straight back to receiving. Nothing a single datagram does can stop the loop.
//
// Sessions are spawned without limit. A flood of requests will open as many sockets and files as
// the host allows.

use crate::config::ServerConfig;
use crate::srv_conn::{self, ServerRequestHandler};
use crate::tftp::{self, Request, RequestKind};
use std::net::SocketAddr;

pub struct TftpServer {
    config: ServerConfig,
    sock: tftp::TftpSocket,
}

impl TftpServer {
    pub fn bind(config: ServerConfig) -> tftp::TftpResult<TftpServer> {
        let sock = tftp::TftpSocket::bind(config.bind)?;
        Ok(TftpServer { config, sock })
    }

    pub fn local_addr(&self) -> tftp::TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// Receives requests forever.
    pub async fn run(&self) {
        log::info!(
            "Listening on {:?}, serving {:?}, storing into {:?}",
            self.local_addr().ok(),
            self.config.read_root,
            self.config.write_root
        );

        // One byte more than the largest packet so oversized junk does not parse as valid.
        let mut buf = [0_u8; tftp::MAX_PACKET_SIZE + 1];
        loop {
            let (len, src) = match self.sock.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("Error while receiving request: {e}");
                    continue;
                }
            };
            self.dispatch(&buf[..len], src).await;
        }
    }

    async fn dispatch(&self, buf: &[u8], src: SocketAddr) {
        let request = match Request::decode(buf) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Rejecting datagram from {src}: {e}");
                srv_conn::send_error_packet(
                    &self.sock,
                    src,
                    tftp::ErrorCode::Illegal,
                    format!("Expected a read or write request: {e}"),
                )
                .await;
                return;
            }
        };

        if request.kind == RequestKind::Write && self.config.read_only {
            log::warn!("Refusing write of '{}' from {src}: server is read-only", request.filename);
            srv_conn::send_error_packet(
                &self.sock,
                src,
                tftp::ErrorCode::AccessViolation,
                "Server does not accept uploads".to_string(),
            )
            .await;
            return;
        }

        log::info!("{:?} request for '{}' ({}) from {src}", request.kind, request.filename, request.mode);
        let config = self.config.clone();
        tokio::spawn(async move {
            let handler = match ServerRequestHandler::new(&config, &request, src).await {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("Cannot serve '{}' to {src}: {e}", request.filename);
                    return;
                }
            };
            match handler.handle().await {
                Ok(summary) => log::info!(
                    "{:?} of '{}' with {src} complete: {} bytes in {} blocks",
                    summary.kind,
                    request.filename,
                    summary.stats.bytes,
                    summary.stats.blocks
                ),
                Err(e) => log::warn!("{:?} of '{}' with {src} failed: {e}", request.kind, request.filename),
            }
        });
    }
}
