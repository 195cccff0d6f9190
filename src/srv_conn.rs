// This module contains the server-side connection handler.
//
// Server connections are initiated when a read or write request reaches the listener. The
// listener hands the decoded request to a fresh ServerRequestHandler, which works in roughly the
// following stages:
//
// 1. Bind a socket of its own and connect it to the client. Every later packet of the transfer
//    travels over this socket, so the client sees the server's reply come from a new port.
// 2. Check whether the request can be serviced by opening the file. If not, send an error and
//    stop.
// 3. Alternate between work and wait cycles. Work is done by the packet processor (read or write
//    a block, decide what to send); waiting means receiving until the processor is satisfied or
//    the deadline for the last packet passes, in which case the processor decides whether to
//    retransmit or give up.
// 4. After the last block of an upload is acknowledged, linger for one timeout period in case the
//    client never saw that ack and sends its final block again.
//
// Sessions share nothing with each other apart from the file system. Two clients writing the same
// name at once are not coordinated here.

use crate::config::ServerConfig;
use crate::processor::{self, PacketProcessor, ReadProcessor, ResultAction, TransferError, TransferStats, WriteProcessor};
use crate::tftp::{self, Request, RequestKind};
use rand::Rng;
use std::error;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// Attempts to bind within the configured port range before giving up.
const PORT_RANGE_ATTEMPTS: usize = 16;

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    /// The TFTP socket used to send and receive packets, connected to the client.
    sock: tftp::TftpSocket,

    /// The client this session serves.
    dst: SocketAddr,

    /// The packet processor.
    processor: PacketProcessor,

    timeout: Duration,

    /// Destination of an upload, removed again if the transfer fails.
    upload_path: Option<PathBuf>,
}

/// What a successful session moved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferSummary {
    pub kind: RequestKind,
    pub stats: TransferStats,
}

/// Binds the session socket on the listener's address, either on an OS-assigned port or on a
/// random port from the configured range.
fn bind_session_socket(ip: IpAddr, config: &ServerConfig) -> Result<tftp::TftpSocket, ServerConnectionError> {
    let Some(range) = &config.port_range else {
        return Ok(tftp::TftpSocket::bind(SocketAddr::new(ip, 0))?);
    };

    let mut rng = rand::thread_rng();
    let mut last_err = None;
    for _ in 0..PORT_RANGE_ATTEMPTS {
        match tftp::TftpSocket::bind(SocketAddr::new(ip, rng.gen_range(range.clone()))) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::warn!("Couldn't bind socket: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => e.into(),
        None => ServerConnectionError::Internal("empty port range".to_string()),
    })
}

/// Maps a requested file name onto a path under `root`. A leading `/` is ignored; names that
/// would climb out of `root` are refused.
pub fn resolve_path(root: &Path, requested: &str) -> Option<PathBuf> {
    let relative = Path::new(requested.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();
    let mut depth = 0;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (depth > 0).then_some(resolved)
}

/// Sends an error packet to `dst`. Errors are a courtesy: they are never acknowledged or
/// retransmitted, and a failure to send one is only logged.
pub async fn send_error_packet(sock: &tftp::TftpSocket, dst: SocketAddr, code: tftp::ErrorCode, message: String) {
    log::debug!("Sending error {:?} '{}' to {}", code, message, dst);
    if let Err(e) = sock.send_to(&tftp::Packet::Error { code, message }, dst).await {
        log::warn!("Unable to send error packet to {dst}: {e}");
    }
}

/// Tells the connected client why its session is over, if it is owed an answer.
async fn report_failure(sock: &tftp::TftpSocket, dst: SocketAddr, error: &TransferError) {
    let Some(packet) = error.error_packet() else {
        return;
    };
    log::debug!("Sending {:?} to {}", packet, dst);
    if let Err(e) = sock.send(&packet).await {
        log::warn!("Unable to send error packet to {dst}: {e}");
    }
}

impl ServerRequestHandler {
    /// Prepares a session for `request` from `src`. If the file cannot be opened the client is
    /// told why before the error is returned.
    pub async fn new(
        config: &ServerConfig,
        request: &Request,
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        let sock = bind_session_socket(config.bind.ip(), config)?;
        sock.connect(src)?;
        log::debug!("Session socket {:?} connected to {}", sock.local_addr().ok(), src);

        let root = match request.kind {
            RequestKind::Read => &config.read_root,
            RequestKind::Write => &config.write_root,
        };
        let Some(path) = resolve_path(root, &request.filename) else {
            let error = TransferError::AccessViolation(format!("Illegal file name: '{}'", request.filename));
            report_failure(&sock, src, &error).await;
            return Err(error.into());
        };

        let processor = match request.kind {
            RequestKind::Read => processor::open_for_read(&path)
                .await
                .map(|f| PacketProcessor::Read(ReadProcessor::new(f, config.max_retries))),
            RequestKind::Write => processor::open_for_write(&path, config.allow_overwrite)
                .await
                .map(|f| PacketProcessor::Write(WriteProcessor::new(f, config.max_retries))),
        };
        let processor = match processor {
            Ok(p) => p,
            Err(e) => {
                let error = TransferError::from_open_failure(&e, &path);
                report_failure(&sock, src, &error).await;
                return Err(error.into());
            }
        };

        let upload_path = (request.kind == RequestKind::Write).then_some(path);
        Ok(ServerRequestHandler { sock, dst: src, processor, timeout: config.timeout, upload_path })
    }

    #[cfg(test)]
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local_addr().ok()
    }

    fn kind(&self) -> RequestKind {
        match self.processor {
            PacketProcessor::Read(_) => RequestKind::Read,
            PacketProcessor::Write(_) => RequestKind::Write,
        }
    }

    /// Does the work of sending and receiving data over the connection until the connection closes.
    /// A failed upload leaves nothing behind in the write directory, so the client can simply ask
    /// again.
    pub async fn handle(mut self) -> Result<TransferSummary, ServerConnectionError> {
        let result = self.transfer().await;
        if let Err(e) = &result {
            if let Some(path) = self.upload_path.take() {
                drop(self.processor);
                processor::discard_partial_upload(&path).await;
            }
            if let ServerConnectionError::Transfer(error) = e {
                report_failure(&self.sock, self.dst, error).await;
            }
        }
        result
    }

    async fn transfer(&mut self) -> Result<TransferSummary, ServerConnectionError> {
        let mut out_packet = match self.processor.first_packet().await {
            ResultAction::SendPacketAndAwait(p) => p,
            ResultAction::Abort(e) => return Err(e.into()),
            other => {
                return Err(ServerConnectionError::Internal(format!(
                    "Packet processor asked for {:?} before the first message was sent",
                    other
                )));
            }
        };

        // This loop is used for message sending as well as retries, depending on whether
        // |out_packet| has been overwritten.
        loop {
            self.sock.send(&out_packet).await?;

            let deadline = Instant::now() + self.timeout;
            let action = loop {
                let action = match self.sock.recv_until(deadline).await {
                    Ok(packet) => {
                        log::trace!("Got packet from {}: {:?}", self.dst, packet);
                        self.processor.process_packet(&packet).await
                    }
                    Err(tftp::SocketError::Timeout(_)) => {
                        log::debug!("Timed out waiting on {}", self.dst);
                        self.processor.on_timeout()
                    }
                    Err(tftp::SocketError::PacketParse(e)) => self.processor.on_malformed(&e),
                    Err(tftp::SocketError::IO(e)) => {
                        // Connected UDP sockets surface ICMP port unreachable as a receive
                        // error; the client is gone, so there is nobody left to tell.
                        return Err(ServerConnectionError::Socket(tftp::SocketError::IO(e)));
                    }
                };
                if !matches!(action, ResultAction::RetryRecv) {
                    break action;
                }
            };

            match action {
                ResultAction::SendPacketAndAwait(p) => out_packet = p,
                ResultAction::RetryRecv => unreachable!("receive loop only exits with a decision"),
                ResultAction::Complete(last) => {
                    if let Some(p) = last {
                        self.sock.send(&p).await?;
                        self.linger(&p).await;
                    }
                    return Ok(TransferSummary { kind: self.kind(), stats: self.processor.stats() });
                }
                ResultAction::Abort(e) => return Err(e.into()),
            }
        }
    }

    /// Waits one timeout period after the final ack of an upload, answering a retransmitted final
    /// block with the same ack again.
    async fn linger(&self, final_ack: &tftp::Packet) {
        let &tftp::Packet::Ack { block } = final_ack else {
            return;
        };
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.sock.recv_until(deadline).await {
                Ok(tftp::Packet::Data { block: resent, .. }) if resent == block => {
                    log::debug!("Final block {block} resent by {}, acknowledging again", self.dst);
                    if self.sock.send(final_ack).await.is_err() {
                        return;
                    }
                }
                Ok(_) | Err(tftp::SocketError::PacketParse(_)) => {}
                Err(_) => return,
            }
        }
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    /// The transfer ended in a protocol or file failure. The peer has been told, if it is owed a
    /// reply.
    Transfer(TransferError),
    Socket(tftp::SocketError),
    Internal(String),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Transfer(e) => write!(f, "{e}"),
            Self::Socket(e) => write!(f, "{e}"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl From<TransferError> for ServerConnectionError {
    fn from(e: TransferError) -> ServerConnectionError {
        ServerConnectionError::Transfer(e)
    }
}

impl From<tftp::SocketError> for ServerConnectionError {
    fn from(e: tftp::SocketError) -> ServerConnectionError {
        ServerConnectionError::Socket(e)
    }
}
