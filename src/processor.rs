// Transfer engines.
//
// The processors never touch the network. The session feeds them whatever arrived on the wire
// (or the fact that nothing arrived in time) and they answer with a ResultAction describing what
// the session should do next. This keeps the lock-step protocol logic testable without sockets.
//
// Block numbers are 16 bits wide and wrap from 65535 back to 0. A transfer longer than
// 65535 blocks therefore reuses block numbers; since at most one block is ever outstanding this
// is unambiguous on the wire, but clients that refuse to wrap will stall on such files.

use crate::tftp;
use std::error;
use std::fmt;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Number of consecutive timeouts tolerated for a single block before the transfer is abandoned.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Opens the source file of a read transfer.
pub async fn open_for_read(path: &Path) -> Result<File, io::Error> {
    File::open(path).await
}

/// Opens the destination file of a write transfer. Unless `overwrite` is set an existing file is
/// left untouched and the open fails with `AlreadyExists`.
pub async fn open_for_write(path: &Path, overwrite: bool) -> Result<File, io::Error> {
    log::info!("Writing to {:?}", path);
    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    options.open(path).await
}

/// Removes what a failed write transfer left behind.
pub async fn discard_partial_upload(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::info!("Removed incomplete upload {:?}", path),
        Err(e) => log::warn!("Unable to remove incomplete upload {:?}: {e}", path),
    }
}

/// The reasons a transfer can end unsuccessfully.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferError {
    FileNotFound(String),
    AccessViolation(String),
    FileAlreadyExists(String),
    IllegalOperation(String),
    /// The retry budget for a block was used up.
    TransferAborted(String),
    IoFailure { kind: io::ErrorKind, message: String },
    /// The peer gave up and told us so.
    PeerError { code: tftp::ErrorCode, message: String },
}

impl TransferError {
    /// Classifies a failure to open the file backing a request.
    pub fn from_open_failure(e: &io::Error, path: &Path) -> TransferError {
        let what = path.display();
        match e.kind() {
            io::ErrorKind::NotFound => TransferError::FileNotFound(format!("File not found: {what}")),
            io::ErrorKind::PermissionDenied => TransferError::AccessViolation(format!("Access denied: {what}")),
            io::ErrorKind::AlreadyExists => TransferError::FileAlreadyExists(format!("File already exists: {what}")),
            kind => TransferError::IoFailure { kind, message: format!("Cannot open {what}: {e}") },
        }
    }

    /// The Error packet that tells the peer about this failure. Nothing is sent back in reply to
    /// the peer's own error.
    pub fn error_packet(&self) -> Option<tftp::Packet> {
        let (code, message) = match self {
            TransferError::FileNotFound(m) => (tftp::ErrorCode::FileNotFound, m),
            TransferError::AccessViolation(m) => (tftp::ErrorCode::AccessViolation, m),
            TransferError::FileAlreadyExists(m) => (tftp::ErrorCode::FileAlreadyExists, m),
            TransferError::IllegalOperation(m) => (tftp::ErrorCode::Illegal, m),
            TransferError::TransferAborted(m) => (tftp::ErrorCode::Undefined, m),
            TransferError::IoFailure { kind, message } => ((*kind).into(), message),
            TransferError::PeerError { .. } => return None,
        };
        Some(tftp::Packet::Error { code, message: message.clone() })
    }
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::FileNotFound(msg) => write!(f, "File not found: {msg}"),
            Self::AccessViolation(msg) => write!(f, "Access violation: {msg}"),
            Self::FileAlreadyExists(msg) => write!(f, "File already exists: {msg}"),
            Self::IllegalOperation(msg) => write!(f, "Illegal operation: {msg}"),
            Self::TransferAborted(msg) => write!(f, "Transfer aborted: {msg}"),
            Self::IoFailure { kind, message } => write!(f, "File IO failure ({kind:?}): {message}"),
            Self::PeerError { code, message } => write!(f, "Peer sent error {code:?}: '{message}'"),
        }
    }
}

fn io_failure(e: &io::Error, action: &str) -> TransferError {
    TransferError::IoFailure { kind: e.kind(), message: format!("Failed to {action} file: {e}") }
}

fn peer_error(code: tftp::ErrorCode, message: &str) -> TransferError {
    TransferError::PeerError { code, message: message.to_string() }
}

/// Represents an action that the caller of a processor should take in
/// response to processing a packet or a timeout.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should keep waiting for a response to the packet it last sent, without resending it
    /// and without pushing back its deadline.
    RetryRecv,

    /// The transfer succeeded. The packet, if any, is the last one the caller should send.
    Complete(Option<tftp::Packet>),

    /// The transfer failed. The caller should tell the peer (see
    /// [`TransferError::error_packet`]) and close the connection.
    Abort(TransferError),
}

/// Where a transfer engine currently stands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferState {
    /// About to read and send the given block.
    Sending(u16),
    AwaitingAck { block: u16, retries: u32 },
    AwaitingData { expected: u16, retries: u32 },
    Done,
    Failed,
}

/// Counters reported once a transfer finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferStats {
    /// Distinct data blocks moved, not counting retransmissions.
    pub blocks: u64,
    pub bytes: u64,
}

/// An engine for either direction of a transfer over a file on disk.
#[derive(Debug)]
pub enum PacketProcessor {
    Read(ReadProcessor<File>),
    Write(WriteProcessor<File>),
}

impl PacketProcessor {
    pub async fn first_packet(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.first_packet().await,
            PacketProcessor::Write(p) => p.first_packet(),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(packet).await,
            PacketProcessor::Write(p) => p.process_data(packet).await,
        }
    }

    /// Called when a datagram from the peer could not be decoded at all.
    pub fn on_malformed(&mut self, e: &tftp::PacketError) -> ResultAction {
        match self {
            PacketProcessor::Read(_) => {
                log::debug!("Dropping undecodable packet while waiting for an ack: {e}");
                ResultAction::RetryRecv
            }
            PacketProcessor::Write(p) => {
                p.state = TransferState::Failed;
                ResultAction::Abort(TransferError::IllegalOperation(format!("Error parsing incoming packet: {e}")))
            }
        }
    }

    /// Called when the peer failed to answer the last packet in time.
    pub fn on_timeout(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.on_timeout(),
            PacketProcessor::Write(p) => p.on_timeout(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> TransferState {
        match self {
            PacketProcessor::Read(p) => p.state,
            PacketProcessor::Write(p) => p.state,
        }
    }

    pub fn stats(&self) -> TransferStats {
        match self {
            PacketProcessor::Read(p) => p.stats,
            PacketProcessor::Write(p) => p.stats,
        }
    }
}

/// Sends a file: reads a block, sends it, waits for its ack, repeat.
#[derive(Debug)]
pub struct ReadProcessor<R> {
    f: R,
    state: TransferState,
    max_retries: u32,
    /// The data packet awaiting acknowledgment, kept for retransmission.
    last_sent: Option<tftp::Packet>,
    /// Set once a short block has been sent.
    final_block: bool,
    stats: TransferStats,
}

impl<R: AsyncRead + Unpin> ReadProcessor<R> {
    pub fn new(f: R, max_retries: u32) -> ReadProcessor<R> {
        ReadProcessor {
            f,
            state: TransferState::Sending(1),
            max_retries,
            last_sent: None,
            final_block: false,
            stats: TransferStats::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> TransferState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> TransferStats {
        self.stats
    }

    pub async fn first_packet(&mut self) -> ResultAction {
        self.send_block(1).await
    }

    async fn send_block(&mut self, block: u16) -> ResultAction {
        self.state = TransferState::Sending(block);
        match read_block_from_file(&mut self.f).await {
            Ok(data) => {
                if data.len() < tftp::DATA_BUFFER_SIZE {
                    self.final_block = true;
                }
                self.stats.blocks += 1;
                self.stats.bytes += data.len() as u64;
                let packet = tftp::Packet::Data { block, data };
                self.last_sent = Some(packet.clone());
                self.state = TransferState::AwaitingAck { block, retries: 0 };
                ResultAction::SendPacketAndAwait(packet)
            }
            Err(e) => {
                self.state = TransferState::Failed;
                ResultAction::Abort(io_failure(&e, "read from"))
            }
        }
    }

    pub async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        let TransferState::AwaitingAck { block: current, .. } = self.state else {
            return ResultAction::RetryRecv;
        };

        match packet {
            &tftp::Packet::Ack { block } if block == current => {
                if self.final_block {
                    self.state = TransferState::Done;
                    return ResultAction::Complete(None);
                }
                self.send_block(current.wrapping_add(1)).await
            }
            tftp::Packet::Error { code, message } => {
                self.state = TransferState::Failed;
                ResultAction::Abort(peer_error(*code, message))
            }
            other => {
                // Stale or duplicated acks, and anything else that is not the ack we are waiting
                // for, are dropped. The deadline keeps running.
                log::debug!("Ignoring {:?} while waiting for ack of block {current}", other);
                ResultAction::RetryRecv
            }
        }
    }

    pub fn on_timeout(&mut self) -> ResultAction {
        let TransferState::AwaitingAck { block, retries } = self.state else {
            return ResultAction::RetryRecv;
        };
        let retries = retries + 1;
        if retries >= self.max_retries {
            self.state = TransferState::Failed;
            return ResultAction::Abort(TransferError::TransferAborted(format!(
                "No acknowledgment for block {block} after {retries} attempts"
            )));
        }
        self.state = TransferState::AwaitingAck { block, retries };
        match &self.last_sent {
            Some(packet) => ResultAction::SendPacketAndAwait(packet.clone()),
            None => ResultAction::RetryRecv,
        }
    }
}

/// Reads up to one block from `f`. Anything shorter than a full block means the input is
/// exhausted.
async fn read_block_from_file<R: AsyncRead + Unpin>(f: &mut R) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
    let mut cursor = 0;

    // A single call to read may return fewer bytes than are available, so keep reading into the
    // remainder of the buffer until it is full or the reader reports end of input.
    while cursor < buf.len() {
        match f.read(&mut buf[cursor..]).await? {
            0 => break,
            s => cursor += s,
        }
    }
    buf.truncate(cursor);
    Ok(buf)
}

/// Receives a file: acks block 0, then appends and acks each block in turn.
#[derive(Debug)]
pub struct WriteProcessor<W> {
    f: W,
    state: TransferState,
    max_retries: u32,
    /// The most recently sent ack, resent on timeout or on a duplicated data block.
    last_ack: u16,
    stats: TransferStats,
}

impl<W: AsyncWrite + Unpin> WriteProcessor<W> {
    pub fn new(f: W, max_retries: u32) -> WriteProcessor<W> {
        WriteProcessor {
            f,
            state: TransferState::AwaitingData { expected: 1, retries: 0 },
            max_retries,
            last_ack: 0,
            stats: TransferStats::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> TransferState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> TransferStats {
        self.stats
    }

    /// Gives the output back, e.g. to inspect what was written.
    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.f
    }

    pub fn first_packet(&mut self) -> ResultAction {
        ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 })
    }

    pub async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        let TransferState::AwaitingData { expected, .. } = self.state else {
            return ResultAction::RetryRecv;
        };

        match packet {
            tftp::Packet::Data { block, data } if *block == expected => {
                if let Err(e) = self.f.write_all(data).await {
                    self.state = TransferState::Failed;
                    return ResultAction::Abort(io_failure(&e, "write to"));
                }
                self.stats.blocks += 1;
                self.stats.bytes += data.len() as u64;
                self.last_ack = expected;
                let ack = tftp::Packet::Ack { block: expected };

                if data.len() < tftp::DATA_BUFFER_SIZE {
                    if let Err(e) = self.f.shutdown().await {
                        self.state = TransferState::Failed;
                        return ResultAction::Abort(io_failure(&e, "close"));
                    }
                    self.state = TransferState::Done;
                    ResultAction::Complete(Some(ack))
                } else {
                    self.state = TransferState::AwaitingData { expected: expected.wrapping_add(1), retries: 0 };
                    ResultAction::SendPacketAndAwait(ack)
                }
            }
            tftp::Packet::Data { block, .. } if *block == self.last_ack => {
                // Our ack was lost and the peer resent the block. It is already on disk.
                log::debug!("Duplicate data block {block}, acknowledging again");
                ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: self.last_ack })
            }
            tftp::Packet::Data { block, .. } => {
                self.state = TransferState::Failed;
                ResultAction::Abort(TransferError::IllegalOperation(format!(
                    "Data blocks must be received by the server in sequence. Server received data \
                    for block {block}, but expected block {expected}."
                )))
            }
            tftp::Packet::Error { code, message } => {
                self.state = TransferState::Failed;
                ResultAction::Abort(peer_error(*code, message))
            }
            other => {
                self.state = TransferState::Failed;
                ResultAction::Abort(TransferError::IllegalOperation(format!(
                    "Expected to receive a Data packet, but got {:?} instead",
                    other.op_code()
                )))
            }
        }
    }

    pub fn on_timeout(&mut self) -> ResultAction {
        let TransferState::AwaitingData { expected, retries } = self.state else {
            return ResultAction::RetryRecv;
        };
        let retries = retries + 1;
        if retries >= self.max_retries {
            self.state = TransferState::Failed;
            return ResultAction::Abort(TransferError::TransferAborted(format!(
                "No data for block {expected} after {retries} attempts"
            )));
        }
        self.state = TransferState::AwaitingData { expected, retries };
        ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: self.last_ack })
    }
}
