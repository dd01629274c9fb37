use crate::options::{OptionPairs, MAX_BLKSIZE};
use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest datagram a peer may legally send: a 4-byte DATA header plus the largest block.
pub const MAX_PACKET_SIZE: usize = 4 + MAX_BLKSIZE as usize;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// A datagram that could not be decoded as a TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedPacket(pub String);

impl error::Error for MalformedPacket {}

impl fmt::Display for MalformedPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "malformed packet: {}", self.0)
    }
}

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    /// A datagram arrived from the given source but did not decode.
    PacketParse(SocketAddr, MalformedPacket),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(src, e) => write!(f, "Packet parsing error from {}: {}", src, e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {}", e),
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

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
///
/// `NetAscii` is carried as raw octets; line-ending translation is left to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
}

impl FileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }

    fn parse(raw: &str) -> Option<FileMode> {
        match raw.to_ascii_lowercase().as_str() {
            "netascii" => Some(FileMode::NetAscii),
            "octet" => Some(FileMode::Octet),
            "mail" => Some(FileMode::Mail),
            _ => None,
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    /// RFC 2347: the requester refuses the options in an OACK.
    OptionNegotiation,
    /// A code outside the RFC table, kept as sent.
    Other(u16),
}

impl ErrorCode {
    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiation,
            0 => ErrorCode::Undefined,
            other => ErrorCode::Other(other),
        }
    }

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
            ErrorCode::OptionNegotiation => 8,
            ErrorCode::Other(raw) => raw,
        }
    }

    /// The message sent when nothing more specific is known.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Undefined | ErrorCode::Other(_) => "undefined error",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full or allocation exceeded",
            ErrorCode::Illegal => "illegal TFTP operation",
            ErrorCode::UnknownTid => "unknown transfer ID",
            ErrorCode::FileAlreadyExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
            ErrorCode::OptionNegotiation => "option negotiation failed",
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
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

        /// The file mode.
        mode: FileMode,

        /// RFC 2347 option pairs, in the order the requester sent them.
        options: OptionPairs,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
        options: OptionPairs,
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

    /// An option acknowledgment, listing the options the responder accepted.
    OptionAck {
        options: OptionPairs,
    },
}

/// The opcode carried in the first two bytes of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Splits a NUL-terminated string off the front of `buf`, returning the string bytes and the
/// remainder after the terminator.
fn split_cstr<'a>(buf: &'a [u8], what: &str) -> Result<(&'a [u8], &'a [u8]), MalformedPacket> {
    match buf.iter().position(|&c| c == 0x00) {
        Some(end) => Ok((&buf[..end], &buf[end + 1..])),
        None => Err(MalformedPacket(format!("{what} is not NUL-terminated"))),
    }
}

fn take_string<'a>(buf: &'a [u8], what: &str) -> Result<(String, &'a [u8]), MalformedPacket> {
    let (raw, rest) = split_cstr(buf, what)?;
    let s = String::from_utf8(raw.to_vec())
        .map_err(|_| MalformedPacket(format!("{what} is not valid UTF-8")))?;
    Ok((s, rest))
}

fn retrieve_op_code(buf: &[u8]) -> Result<OpCode, MalformedPacket> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        6 => Ok(OpCode::Oack),
        _ => Err(MalformedPacket(format!("unknown opcode {rawcode}"))),
    }
}

fn parse_options(mut buf: &[u8]) -> Result<OptionPairs, MalformedPacket> {
    let mut options = Vec::new();
    while !buf.is_empty() {
        let (name, rest) = take_string(buf, "option name")?;
        let (value, rest) = take_string(rest, "option value")?;
        options.push((name, value));
        buf = rest;
    }
    Ok(options)
}

fn parse_request(buf: &[u8]) -> Result<(String, FileMode, OptionPairs), MalformedPacket> {
    let (path, rest) = take_string(buf, "filename")?;
    let (raw_mode, rest) = take_string(rest, "mode")?;
    let mode = FileMode::parse(&raw_mode)
        .ok_or_else(|| MalformedPacket(format!("unknown file mode '{raw_mode}'")))?;
    let options = parse_options(rest)?;
    Ok((path, mode, options))
}

fn require_header(buf: &[u8], what: &str) -> Result<(), MalformedPacket> {
    if buf.len() < 4 {
        return Err(MalformedPacket(format!("{what} packet shorter than its 4-byte header")));
    }
    Ok(())
}

fn push_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
}

fn push_options(buf: &mut Vec<u8>, options: &OptionPairs) {
    for (name, value) in options {
        push_cstr(buf, name);
        push_cstr(buf, value);
    }
}

impl Packet {
    /// Decodes one datagram.
    pub fn parse_from_buf(buf: &[u8]) -> Result<Packet, MalformedPacket> {
        if buf.len() < 2 {
            return Err(MalformedPacket("packet too short to hold an opcode".to_string()));
        }

        match retrieve_op_code(buf)? {
            OpCode::Rrq => {
                let (path, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode, options })
            }
            OpCode::Wrq => {
                let (path, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode, options })
            }
            OpCode::Data => {
                require_header(buf, "DATA")?;
                Ok(Packet::Data {
                    block: u16_from_buffer(&buf[2..4]),
                    data: buf[4..].to_vec(),
                })
            }
            OpCode::Ack => {
                require_header(buf, "ACK")?;
                Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) })
            }
            OpCode::Error => {
                require_header(buf, "ERROR")?;
                let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));
                // Error text is for humans; tolerate non-UTF-8 peers.
                let (raw, _) = split_cstr(&buf[4..], "error message")?;
                let message = String::from_utf8_lossy(raw).into_owned();
                Ok(Packet::Error { code, message })
            }
            OpCode::Oack => Ok(Packet::OptionAck { options: parse_options(&buf[2..])? }),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
            Packet::OptionAck { .. } => OpCode::Oack,
        }
    }

    /// Encodes the packet into its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(match self {
            Packet::Data { data, .. } => 4 + data.len(),
            _ => 32,
        });
        buf.extend_from_slice(&(self.op_code() as u16).to_be_bytes());

        match self {
            Packet::ReadReq { path, mode, options } | Packet::WriteReq { path, mode, options } => {
                push_cstr(&mut buf, path);
                push_cstr(&mut buf, mode.as_str());
                push_options(&mut buf, options);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                push_cstr(&mut buf, message);
            }
            Packet::OptionAck { options } => push_options(&mut buf, options),
        }
        buf
    }

    /// Shorthand for an error packet carrying the code's standard message.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error { code, message: code.default_message().to_string() }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
    buf: Vec<u8>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
            buf: vec![0; MAX_PACKET_SIZE],
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.to_bytes(), dst).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> TftpResult<(Packet, SocketAddr)> {
        let (total_written, src) = self.sock.recv_from(&mut self.buf).await?;

        let packet = Packet::parse_from_buf(&self.buf[..total_written])
            .map_err(|e| SocketError::PacketParse(src, e))?;
        Ok((packet, src))
    }

    pub async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        timeout(ttl, self.recv()).await?
    }
}
