use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use tokio::time::error::Elapsed;
use tokio::time::{timeout_at, Instant};

/// Maximum number of payload bytes in a single DATA packet.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Largest well-formed TFTP datagram: 4 byte header plus a full block.
pub const MAX_PACKET_SIZE: usize = DATA_BUFFER_SIZE + 4;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents a datagram that could not be decoded as a TFTP packet.
#[derive(Debug, PartialEq)]
pub enum PacketError {
    /// Fewer bytes than the framing of the packet requires.
    TooShort(usize),
    UnknownOpcode(u16),
    Malformed(String),
    /// A well-formed packet arrived where a read or write request was expected.
    NotARequest(u16),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::TooShort(len) => write!(f, "Packet too short: {len} bytes"),
            PacketError::UnknownOpcode(op) => write!(f, "Unknown opcode: {op}"),
            PacketError::Malformed(msg) => write!(f, "Malformed packet: {msg}"),
            PacketError::NotARequest(op) => write!(f, "Opcode {op} is not a read or write request"),
        }
    }
}

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(PacketError),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {e}"),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

impl From<PacketError> for SocketError {
    fn from(e: PacketError) -> Self {
        SocketError::PacketParse(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

///////////////////////////////////////////////////////////////
// Packets

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorCode { Undefined, FileNotFound, AccessViolation, DiskFull, Illegal, UnknownTid, FileAlreadyExists, NoSuchUser }

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    /// Codes outside the RFC 1350 range are reported as `Undefined`.
    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error }

impl OpCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The transfer mode as sent by the client. Only octet transfers are performed, so
        /// this is carried for logging and otherwise ignored.
        mode: String,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: String,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs until the
/// first 0 byte.
///
/// Returns the bytes of the string along with the position of the 0 byte, or `None` for the
/// position if the buffer ended before a terminator was seen.
fn bytes_until_nul(buf: &[u8]) -> (&[u8], Option<usize>) {
    match buf.iter().position(|&c| c == 0x00) {
        Some(end) => (&buf[..end], Some(end)),
        None => (buf, None),
    }
}

/// Like [`bytes_until_nul`], for text that is only ever displayed.
fn string_from_buffer(buf: &[u8]) -> (String, Option<usize>) {
    let (bytes, end) = bytes_until_nul(buf);
    (String::from_utf8_lossy(bytes).into_owned(), end)
}

fn retrieve_op_code(buf: &[u8]) -> Result<OpCode, PacketError> {
    if buf.len() < 2 {
        return Err(PacketError::TooShort(buf.len()));
    }
    match u16_from_buffer(&buf[..2]) {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        raw => Err(PacketError::UnknownOpcode(raw)),
    }
}

/// Splits the body of a request into filename and mode. The filename must be terminated; the
/// mode is not interpreted, so a missing or unterminated mode is accepted as-is.
fn parse_path_and_mode(buf: &[u8]) -> Result<(String, String), PacketError> {
    let (path, path_end) = bytes_until_nul(buf);

    let path_end = path_end.ok_or_else(|| {
        PacketError::Malformed("Filename must be terminated with a null byte".to_string())
    })?;
    // A file name is looked up byte for byte, so it is never patched up into something else.
    let path = std::str::from_utf8(path)
        .map_err(|e| PacketError::Malformed(format!("Filename is not valid UTF-8: {e}")))?
        .to_string();

    if path.is_empty() {
        return Err(PacketError::Malformed("Request does not name a file".to_string()));
    }

    let (mode, _) = string_from_buffer(&buf[path_end + 1..]);
    Ok((path, mode))
}

fn parse_data(buf: &[u8]) -> Result<Packet, PacketError> {
    if buf.len() > MAX_PACKET_SIZE {
        return Err(PacketError::Malformed(format!(
            "Data payload of {} bytes exceeds the {DATA_BUFFER_SIZE} byte block size",
            buf.len() - 4
        )));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

fn parse_ack(buf: &[u8]) -> Result<Packet, PacketError> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> Result<Packet, PacketError> {
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> Result<Packet, PacketError> {
        match retrieve_op_code(buf)? {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            _ if buf.len() < 4 => Err(PacketError::TooShort(buf.len())),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Serializes the packet into its on-the-wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        buf.extend_from_slice(&self.op_code().as_u16().to_be_bytes());
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                buf.extend_from_slice(path.as_bytes());
                buf.push(0x00);
                buf.extend_from_slice(mode.as_bytes());
                buf.push(0x00);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
            }
        }
        buf
    }
}

/// Which side of the transfer the server plays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RequestKind {
    /// The client reads, the server sends.
    Read,
    /// The client writes, the server receives.
    Write,
}

/// The first packet of an exchange, as received on the well-known port.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    pub filename: String,
    pub mode: String,
}

impl Request {
    pub fn decode(buf: &[u8]) -> Result<Request, PacketError> {
        match Packet::parse_from_buf(buf)? {
            Packet::ReadReq { path, mode } => Ok(Request { kind: RequestKind::Read, filename: path, mode }),
            Packet::WriteReq { path, mode } => Ok(Request { kind: RequestKind::Write, filename: path, mode }),
            other => Err(PacketError::NotARequest(other.op_code().as_u16())),
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
#[derive(Debug)]
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Restricts the socket to a single peer. Datagrams from any other address are dropped by
    /// the OS and `send` goes to `peer`.
    pub fn connect(&self, peer: SocketAddr) -> TftpResult<()> {
        Ok(self.sock.get_ref().connect(peer)?)
    }

    /// Sends to the connected peer.
    pub async fn send(&self, packet: &Packet) -> TftpResult<()> {
        self.sock.send(&packet.to_bytes()).await?;
        Ok(())
    }

    pub async fn send_to(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }

    /// Receives one packet from the connected peer, giving up once `deadline` passes.
    pub async fn recv_until(&self, deadline: Instant) -> TftpResult<Packet> {
        // One spare byte so that an oversized datagram is seen as such rather than truncated.
        let mut buf = [0; MAX_PACKET_SIZE + 1];
        let total_written = timeout_at(deadline, self.sock.recv(&mut buf)).await??;

        Ok(Packet::parse_from_buf(&buf[..total_written])?)
    }

    /// Receives a raw datagram from any peer. Decoding is left to the caller, who needs the
    /// source address even when the bytes turn out to be garbage.
    pub async fn recv_from(&self, buf: &mut [u8]) -> TftpResult<(usize, SocketAddr)> {
        Ok(self.sock.recv_from(buf).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: octet
            0x6F, 0x63, 0x74, 0x65, 0x74, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::ReadReq { path: "/path/to/data.txt".to_string(), mode: "octet".to_string() });
    }

    #[test]
    fn test_packet_write_req() {
        let buf = vec![
            // opcode
            0x00, 0x02,
            // path: data.bin with terminating nullchar
            0x64, 0x61, 0x74, 0x61, 0x2E, 0x62, 0x69, 0x6E, 0x00,
            // mode: mail
            0x6D, 0x61, 0x69, 0x6C, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::WriteReq { path: "data.bin".to_string(), mode: "mail".to_string() });
    }

    #[test]
    fn test_request_without_mode_is_accepted() {
        let buf = vec![0x00, 0x01, 0x68, 0x69, 0x00];
        assert_eq!(
            Request::decode(&buf).unwrap(),
            Request { kind: RequestKind::Read, filename: "hi".to_string(), mode: String::new() }
        );
    }

    #[test]
    fn test_packet_parses_data_at_wrap_point() {
        // Block 65535 is the last number before the counter wraps; block 0 follows it.
        let buf = vec![0x00, 0x03, 0xFF, 0xFF, 0x00, 0x01, 0x02];
        assert_eq!(Packet::parse_from_buf(&buf).unwrap(), Packet::Data { block: u16::MAX, data: vec![0x00, 0x01, 0x02] });

        let buf = vec![0x00, 0x03, 0x00, 0x00, 0xFF];
        assert_eq!(Packet::parse_from_buf(&buf).unwrap(), Packet::Data { block: 0, data: vec![0xFF] });
    }

    #[test]
    fn test_packet_parses_empty_data() {
        let buf = vec![0x00, 0x03, 0x00, 0x07];
        assert_eq!(Packet::parse_from_buf(&buf).unwrap(), Packet::Data { block: 7, data: vec![] });
    }

    #[test]
    fn test_packet_parses_write_acks() {
        // Ack 0 answers a write request; trailing bytes after the block number are ignored.
        assert_eq!(Packet::parse_from_buf(&[0x00, 0x04, 0x00, 0x00]).unwrap(), Packet::Ack { block: 0 });
        assert_eq!(Packet::parse_from_buf(&[0x00, 0x04, 0xFF, 0xFF, 0x99]).unwrap(), Packet::Ack { block: u16::MAX });
    }

    #[test]
    fn test_packet_parses_error_variants() {
        // Terminated message with an unassigned code.
        let buf = vec![0x00, 0x05, 0x00, 0x2A, 0x6E, 0x6F, 0x00];
        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::Error { code: ErrorCode::Undefined, message: "no".to_string() }
        );

        // Empty message, with and without its terminator.
        for buf in [vec![0x00, 0x05, 0x00, 0x06, 0x00], vec![0x00, 0x05, 0x00, 0x06]] {
            assert_eq!(
                Packet::parse_from_buf(&buf).unwrap(),
                Packet::Error { code: ErrorCode::FileAlreadyExists, message: String::new() }
            );
        }
    }

    #[test]
    fn test_non_utf8_filename_is_rejected() {
        let buf = vec![0x00, 0x01, 0x66, 0xFF, 0xFE, 0x00, 0x6F, 0x63, 0x74, 0x65, 0x74, 0x00];
        assert!(matches!(Packet::parse_from_buf(&buf), Err(PacketError::Malformed(_))));
        assert!(matches!(Request::decode(&buf), Err(PacketError::Malformed(_))));
    }

    #[test]
    fn test_packet_parse_failures() {
        assert_eq!(Packet::parse_from_buf(&[]), Err(PacketError::TooShort(0)));
        assert_eq!(Packet::parse_from_buf(&[0x10]), Err(PacketError::TooShort(1)));
        assert_eq!(Packet::parse_from_buf(&[0x10, 0x00]), Err(PacketError::UnknownOpcode(0x1000)));
        assert_eq!(Packet::parse_from_buf(&[0x00, 0x09]), Err(PacketError::UnknownOpcode(9)));
        // Ack without block number
        assert_eq!(Packet::parse_from_buf(&[0x00, 0x04, 0x01]), Err(PacketError::TooShort(3)));
        // Unterminated read path
        assert!(matches!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69]), Err(PacketError::Malformed(_))));
        // Empty filename
        assert!(matches!(Packet::parse_from_buf(&[0x00, 0x02, 0x00, 0x00]), Err(PacketError::Malformed(_))));
        // Oversized data block
        let mut oversized = vec![0x00, 0x03, 0x00, 0x01];
        oversized.extend_from_slice(&[0xAA; DATA_BUFFER_SIZE + 1]);
        assert!(matches!(Packet::parse_from_buf(&oversized), Err(PacketError::Malformed(_))));
    }

    #[test]
    fn test_request_decode_rejects_other_packets() {
        assert_eq!(Request::decode(&[0x00, 0x04, 0x00, 0x01]), Err(PacketError::NotARequest(4)));
        assert_eq!(Request::decode(&[0x00, 0x09, 0x61, 0x00]), Err(PacketError::UnknownOpcode(9)));
    }

    #[test]
    fn test_packet_serialization() {
        assert_eq!(Packet::Ack { block: 0x0102 }.to_bytes(), vec![0x00, 0x04, 0x01, 0x02]);
        assert_eq!(
            Packet::Data { block: 1, data: vec![0xAB, 0xCD] }.to_bytes(),
            vec![0x00, 0x03, 0x00, 0x01, 0xAB, 0xCD]
        );
        assert_eq!(
            Packet::Error { code: ErrorCode::FileNotFound, message: "nope".to_string() }.to_bytes(),
            vec![0x00, 0x05, 0x00, 0x01, 0x6E, 0x6F, 0x70, 0x65, 0x00]
        );
        assert_eq!(
            Packet::WriteReq { path: "a".to_string(), mode: "octet".to_string() }.to_bytes(),
            vec![0x00, 0x02, 0x61, 0x00, 0x6F, 0x63, 0x74, 0x65, 0x74, 0x00]
        );
    }

    #[test]
    fn test_full_data_block_survives_encoding() {
        let packet = Packet::Data { block: u16::MAX, data: vec![0x5A; DATA_BUFFER_SIZE] };
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), MAX_PACKET_SIZE);
        assert_eq!(Packet::parse_from_buf(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(ErrorCode::from(io::ErrorKind::NotFound), ErrorCode::FileNotFound);
        assert_eq!(ErrorCode::from(io::ErrorKind::PermissionDenied), ErrorCode::AccessViolation);
        assert_eq!(ErrorCode::from(io::ErrorKind::AlreadyExists), ErrorCode::FileAlreadyExists);
        assert_eq!(ErrorCode::from(io::ErrorKind::BrokenPipe), ErrorCode::Undefined);
        assert_eq!(ErrorCode::from_u16(42), ErrorCode::Undefined);
        assert_eq!(ErrorCode::Illegal.as_u16(), 4);
    }

    #[tokio::test]
    async fn test_connected_socket_exchange() {
        let server = TftpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client = TftpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        server.connect(client.local_addr().unwrap()).unwrap();
        client.connect(server.local_addr().unwrap()).unwrap();

        server.send(&Packet::Ack { block: 3 }).await.unwrap();
        let got = client
            .recv_until(Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(got, Packet::Ack { block: 3 });
    }

    #[tokio::test]
    async fn test_recv_until_times_out() {
        let sock = TftpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let peer = TftpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        sock.connect(peer.local_addr().unwrap()).unwrap();

        let res = sock.recv_until(Instant::now() + Duration::from_millis(20)).await;
        assert!(matches!(res, Err(SocketError::Timeout(_))));
    }
}
