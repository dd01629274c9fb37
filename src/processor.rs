// Per-transfer state machine.
//
// A processor owns one end of one transfer: either the side that holds the data and sends DATA
// blocks (SendProcessor), or the side that stores it and answers with ACKs (ReceiveProcessor).
// It never touches the network. The session feeds it each packet from the locked peer and acts
// on the ResultAction it returns; retransmission timers live in the session too.
//
// Both sides may begin in AwaitingPeerAckOrOack: a client that has just sent its RRQ/WRQ, or a
// server that has just sent an OACK. A client that asked for options and hears plain DATA(1) or
// ACK(0) back treats the peer as an RFC 1350 peer and keeps the default options.

use crate::options::{self, OptionPairs, TransferOptions};
use crate::tftp::{ErrorCode, Packet};
use std::error;
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Where a sending processor reads file contents from.
pub type Source<'a> = Box<dyn AsyncRead + Unpin + Send + 'a>;

/// Where a receiving processor writes file contents to.
pub type Sink<'a> = Box<dyn AsyncWrite + Unpin + Send + 'a>;

/// The block number that follows `block`, wrapping after 65535.
pub fn next_block(block: u16) -> u16 {
    block.wrapping_add(1)
}

/// Whether `candidate` is the modular successor of `previous`.
pub fn is_next_block(previous: u16, candidate: u16) -> bool {
    candidate == next_block(previous)
}

/// Why a transfer ended without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// The peer sent an ERROR packet.
    PeerError { code: ErrorCode, message: String },
    /// The retry budget for one outstanding packet ran out.
    Timeout,
    /// Nothing was heard from the peer for longer than the idle ceiling.
    IdleTimeout,
    /// Reading the source or writing the sink failed.
    LocalIo { kind: io::ErrorKind, message: String },
    /// The peer broke the protocol in a way we refused to tolerate.
    ProtocolViolation(String),
    /// Sending or receiving on the session socket failed.
    Socket(String),
    /// The owner abandoned the session.
    Cancelled,
}

impl error::Error for FailReason {}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::PeerError { code, message } => {
                write!(f, "peer sent error {} ({:?}): {}", code.as_u16(), code, message)
            }
            Self::Timeout => write!(f, "retry budget exhausted"),
            Self::IdleTimeout => write!(f, "session idle for too long"),
            Self::LocalIo { message, .. } => write!(f, "local I/O error: {}", message),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::Socket(msg) => write!(f, "socket error: {}", msg),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// A request or OACK is outstanding and the peer has not answered yet.
    AwaitingPeerAckOrOack,
    /// A DATA block is outstanding, waiting for its ACK.
    Sending,
    /// An ACK is outstanding, waiting for the next DATA block.
    Receiving,
    Complete,
    Failed(FailReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed(_))
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(Packet),

    /// Caller should send its last packet again without counting it as a retry.
    Resend,

    /// Caller should close the connection without sending a message, optionally logging a string.
    CloseConnection(Option<String>),

    /// Caller should drop the packet and keep waiting.
    RetryRecv,

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(Packet),
}

pub enum PacketProcessor<'a> {
    Send(SendProcessor<'a>),
    Receive(ReceiveProcessor<'a>),
}

/// An entity that can process packets and produce a response.
impl<'a> PacketProcessor<'a> {
    pub fn for_sending(source: Source<'a>, options: TransferOptions) -> PacketProcessor<'a> {
        PacketProcessor::Send(SendProcessor::new(source, options))
    }

    pub fn for_receiving(sink: Sink<'a>, options: TransferOptions) -> PacketProcessor<'a> {
        PacketProcessor::Receive(ReceiveProcessor::new(sink, options))
    }

    /// Puts a client-side processor into the state it holds after sending its request.
    ///
    /// `requested` is the option list that went out with the request; an OACK is only honoured
    /// when it is non-empty.
    pub fn await_reply_to_request(&mut self, requested: OptionPairs) {
        let requested = (!requested.is_empty()).then_some(requested);
        match self {
            PacketProcessor::Send(p) => {
                p.requested = requested;
                p.state = SessionState::AwaitingPeerAckOrOack;
            }
            PacketProcessor::Receive(p) => {
                p.requested = requested;
                p.state = SessionState::AwaitingPeerAckOrOack;
            }
        }
    }

    /// Produces the first packet a server sends after accepting a request.
    ///
    /// With an OACK that is the OACK itself; otherwise DATA(1) for a read or ACK(0) for a write.
    pub async fn first_packet(&mut self, oack: Option<Packet>) -> ResultAction {
        match self {
            PacketProcessor::Send(p) => match oack {
                Some(oack) => {
                    p.state = SessionState::AwaitingPeerAckOrOack;
                    ResultAction::SendPacketAndAwait(oack)
                }
                None => p.send_next_block().await,
            },
            PacketProcessor::Receive(p) => match oack {
                Some(oack) => {
                    p.state = SessionState::AwaitingPeerAckOrOack;
                    ResultAction::SendPacketAndAwait(oack)
                }
                None => {
                    p.state = SessionState::Receiving;
                    ResultAction::SendPacketAndAwait(Packet::Ack { block: 0 })
                }
            },
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &Packet) -> ResultAction {
        match self {
            PacketProcessor::Send(p) => p.process(packet).await,
            PacketProcessor::Receive(p) => p.process(packet).await,
        }
    }

    pub fn state(&self) -> &SessionState {
        match self {
            PacketProcessor::Send(p) => &p.state,
            PacketProcessor::Receive(p) => &p.state,
        }
    }

    pub fn options(&self) -> &TransferOptions {
        match self {
            PacketProcessor::Send(p) => &p.options,
            PacketProcessor::Receive(p) => &p.options,
        }
    }

    /// Bytes whose delivery has been confirmed: ACKed blocks when sending, written blocks when
    /// receiving.
    pub fn bytes_transferred(&self) -> u64 {
        match self {
            PacketProcessor::Send(p) => p.bytes,
            PacketProcessor::Receive(p) => p.bytes,
        }
    }

    /// Forces a non-terminal processor into `Failed`.
    pub fn fail(&mut self, reason: FailReason) {
        let state = match self {
            PacketProcessor::Send(p) => &mut p.state,
            PacketProcessor::Receive(p) => &mut p.state,
        };
        if !state.is_terminal() {
            *state = SessionState::Failed(reason);
        }
    }
}

impl fmt::Debug for PacketProcessor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketProcessor::Send(p) => f
                .debug_struct("SendProcessor")
                .field("state", &p.state)
                .field("options", &p.options)
                .field("block", &p.block)
                .field("awaiting_final_ack", &p.awaiting_final_ack)
                .field("bytes", &p.bytes)
                .finish_non_exhaustive(),
            PacketProcessor::Receive(p) => f
                .debug_struct("ReceiveProcessor")
                .field("state", &p.state)
                .field("options", &p.options)
                .field("last_acked", &p.last_acked)
                .field("bytes", &p.bytes)
                .finish_non_exhaustive(),
        }
    }
}

fn peer_error(state: &mut SessionState, code: ErrorCode, message: &str) -> ResultAction {
    *state = SessionState::Failed(FailReason::PeerError { code, message: message.to_string() });
    ResultAction::CloseConnection(Some(format!(
        "Peer sent error packet: code: {:?}, message: '{}'",
        code, message
    )))
}

fn local_io_error(state: &mut SessionState, e: io::Error, doing: &str) -> ResultAction {
    let message = format!("{doing}: {e}");
    *state = SessionState::Failed(FailReason::LocalIo { kind: e.kind(), message: message.clone() });
    ResultAction::TerminateWithPacket(Packet::Error { code: e.kind().into(), message })
}

fn negotiation_error(state: &mut SessionState, message: String) -> ResultAction {
    *state = SessionState::Failed(FailReason::ProtocolViolation(message.clone()));
    ResultAction::TerminateWithPacket(Packet::Error { code: ErrorCode::OptionNegotiation, message })
}

pub struct SendProcessor<'a> {
    source: Source<'a>,
    options: TransferOptions,
    state: SessionState,
    requested: Option<OptionPairs>,
    /// The outstanding block; 0 while the request or OACK is outstanding.
    block: u16,
    pending_len: usize,
    awaiting_final_ack: bool,
    bytes: u64,
}

impl<'a> SendProcessor<'a> {
    fn new(source: Source<'a>, options: TransferOptions) -> SendProcessor<'a> {
        SendProcessor {
            source,
            options,
            state: SessionState::Sending,
            requested: None,
            block: 0,
            pending_len: 0,
            awaiting_final_ack: false,
            bytes: 0,
        }
    }

    async fn send_next_block(&mut self) -> ResultAction {
        match read_block(&mut self.source, self.options.blksize as usize).await {
            Ok(data) => {
                self.block = next_block(self.block);
                self.pending_len = data.len();
                if data.len() < self.options.blksize as usize {
                    self.awaiting_final_ack = true;
                }
                self.state = SessionState::Sending;
                ResultAction::SendPacketAndAwait(Packet::Data { block: self.block, data })
            }
            Err(e) => local_io_error(&mut self.state, e, "Failed to read from file"),
        }
    }

    async fn process(&mut self, packet: &Packet) -> ResultAction {
        if self.state.is_terminal() {
            return ResultAction::RetryRecv;
        }

        match packet {
            &Packet::Ack { block } if block == self.block => {
                self.bytes += self.pending_len as u64;
                self.pending_len = 0;
                if self.awaiting_final_ack {
                    self.state = SessionState::Complete;
                    return ResultAction::CloseConnection(None);
                }
                self.send_next_block().await
            }
            // Duplicates of earlier ACKs and ACKs for blocks never sent change nothing.
            Packet::Ack { .. } => ResultAction::RetryRecv,
            Packet::OptionAck { options: acked } if self.state == SessionState::AwaitingPeerAckOrOack => {
                let Some(requested) = &self.requested else {
                    return ResultAction::RetryRecv;
                };
                match options::accept_oack(requested, acked) {
                    Ok(accepted) => {
                        let local_size = self.options.tsize;
                        self.options = accepted;
                        self.options.tsize = accepted.tsize.or(local_size);
                        self.send_next_block().await
                    }
                    Err(msg) => negotiation_error(&mut self.state, msg),
                }
            }
            Packet::Error { code, message } => peer_error(&mut self.state, *code, message),
            _ => ResultAction::RetryRecv,
        }
    }
}

/// Fills a buffer of `blksize` bytes from the source, stopping short only at end of file.
async fn read_block(source: &mut Source<'_>, blksize: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; blksize];
    let mut cursor = 0;

    // A single read may return fewer bytes than asked for without being at EOF, so keep
    // reading into the unfilled tail until the block is full or the source runs dry.
    while cursor < buf.len() {
        match source.read(&mut buf[cursor..]).await? {
            0 => break,
            s => cursor += s,
        }
    }
    buf.truncate(cursor);
    Ok(buf)
}

pub struct ReceiveProcessor<'a> {
    sink: Sink<'a>,
    options: TransferOptions,
    state: SessionState,
    requested: Option<OptionPairs>,
    last_acked: u16,
    bytes: u64,
}

impl<'a> ReceiveProcessor<'a> {
    fn new(sink: Sink<'a>, options: TransferOptions) -> ReceiveProcessor<'a> {
        ReceiveProcessor {
            sink,
            options,
            state: SessionState::Receiving,
            requested: None,
            last_acked: 0,
            bytes: 0,
        }
    }

    async fn apply_data(&mut self, block: u16, data: &[u8]) -> ResultAction {
        let blksize = self.options.blksize as usize;
        if data.len() > blksize {
            let message = format!("DATA block {block} carries {} bytes, above the {blksize}-byte block size", data.len());
            self.state = SessionState::Failed(FailReason::ProtocolViolation(message.clone()));
            return ResultAction::TerminateWithPacket(Packet::Error { code: ErrorCode::Illegal, message });
        }

        if let Err(e) = self.sink.write_all(data).await {
            return local_io_error(&mut self.state, e, "Error writing to file");
        }
        self.bytes += data.len() as u64;
        self.last_acked = block;
        let ack = Packet::Ack { block };

        if data.len() < blksize {
            if let Err(e) = self.sink.flush().await {
                return local_io_error(&mut self.state, e, "Error writing to file");
            }
            self.state = SessionState::Complete;
            ResultAction::TerminateWithPacket(ack)
        } else {
            self.state = SessionState::Receiving;
            ResultAction::SendPacketAndAwait(ack)
        }
    }

    async fn process(&mut self, packet: &Packet) -> ResultAction {
        if self.state.is_terminal() {
            return ResultAction::RetryRecv;
        }

        match packet {
            Packet::Data { block, data } if is_next_block(self.last_acked, *block) => {
                self.apply_data(*block, data).await
            }
            // Our ACK was lost; acknowledge again but do not write twice.
            Packet::Data { block, .. }
                if *block == self.last_acked && self.state == SessionState::Receiving =>
            {
                ResultAction::Resend
            }
            Packet::Data { .. } => ResultAction::RetryRecv,
            Packet::OptionAck { options: acked } if self.state == SessionState::AwaitingPeerAckOrOack => {
                let Some(requested) = &self.requested else {
                    return ResultAction::RetryRecv;
                };
                match options::accept_oack(requested, acked) {
                    Ok(accepted) => {
                        self.options = accepted;
                        self.state = SessionState::Receiving;
                        ResultAction::SendPacketAndAwait(Packet::Ack { block: 0 })
                    }
                    Err(msg) => negotiation_error(&mut self.state, msg),
                }
            }
            Packet::Error { code, message } => peer_error(&mut self.state, *code, message),
            _ => ResultAction::RetryRecv,
        }
    }
}
