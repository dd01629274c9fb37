// This module contains the server-side connection handler.
//
// Server connections are initiated when a ReadReq or a WriteReq is received on the listening
// socket. The dispatcher handles this by creating a ServerRequestHandler, which works in roughly
// the following stages:
//
// 1. Bind a fresh socket for the transfer, so every reply comes from a new transfer ID.
// 2. Check whether the request can be serviced: the name must resolve inside the sandbox, the
//    file must be readable (RRQ) or creatable (WRQ), and the mode must be supported. Refusals are
//    reported with a single ERROR packet from the new socket.
// 3. Negotiate options and produce the first packet: an OACK, or DATA(1) / ACK(0).
// 4. Hand the processor to a TransferSession, which runs the work and wait cycles until the
//    transfer completes or fails.
//
// A failed upload leaves nothing behind: the partially written file is removed.

use crate::events::Events;
use crate::options::{self, Capabilities, Direction};
use crate::policy::RetryPolicy;
use crate::processor::{FailReason, PacketProcessor, ResultAction};
use crate::sandbox::{Sandbox, SandboxError};
use crate::session::TransferSession;
use crate::tftp::{self, ErrorCode, FileMode, Packet, TftpSocket};
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::sync::watch;

/// How many random ports to try before giving up when a port range is configured.
const PORT_ATTEMPTS: usize = 32;

/// Everything a handler needs to know about the server's policy.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub policy: RetryPolicy,
    pub capabilities: Capabilities,
    pub allow_writes: bool,
    pub allow_overwrite: bool,
    pub port_range: Option<RangeInclusive<u16>>,
}

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    session: TransferSession<'static>,
    first_packet: Packet,
    description: String,

    /// Upload target to delete if the transfer fails.
    partial_upload: Option<PathBuf>,
    events: Events,
}

/// Binds the socket for one transfer. Without a port range the OS picks the port.
fn bind_session_socket(ip: IpAddr, port_range: Option<&RangeInclusive<u16>>) -> tftp::TftpResult<TftpSocket> {
    let Some(range) = port_range else {
        return TftpSocket::bind((ip, 0).into());
    };

    let mut rng = rand::thread_rng();
    let mut last_err = None;
    for _ in 0..PORT_ATTEMPTS {
        match TftpSocket::bind((ip, rng.gen_range(range.clone())).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrInUse, "empty session port range").into()
    }))
}

async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: String) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::Error { code, message }, dst).await;
}

/// Reports a refused request to the peer with the code's standard message.
async fn refuse<T>(
    sock: &TftpSocket,
    dst: SocketAddr,
    code: ErrorCode,
    err: ServerConnectionError,
) -> Result<T, ServerConnectionError> {
    send_error_packet(sock, dst, code, code.default_message().to_string()).await;
    Err(err)
}

impl ServerRequestHandler {
    pub async fn new(
        settings: &HandlerSettings,
        sandbox: &Sandbox,
        initial_request: &Packet,
        src: SocketAddr,
        local_ip: IpAddr,
        events: Events,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        let (path, mode, requested, direction) = match initial_request {
            Packet::ReadReq { path, mode, options } => (path, *mode, options, Direction::Read),
            Packet::WriteReq { path, mode, options } => (path, *mode, options, Direction::Write),
            _ => {
                return Err(ServerConnectionError::BadRequest(
                    "Only read and write requests are valid initial requests.".to_string(),
                ))
            }
        };

        let sock = bind_session_socket(local_ip, settings.port_range.as_ref())
            .map_err(|e| ServerConnectionError::Internal(format!("Couldn't bind session socket: {e}")))?;

        if mode == FileMode::Mail {
            let err = ServerConnectionError::BadRequest("Peer requested mail mode, which is unsupported".to_string());
            return refuse(&sock, src, ErrorCode::Illegal, err).await;
        }

        let ((processor, first_packet), partial_upload) = match direction {
            Direction::Read => {
                let resolved = match sandbox.resolve_read(path).await {
                    Ok(p) => p,
                    Err(e) => return refuse(&sock, src, e.error_code(), e.into()).await,
                };
                let file = match File::open(&resolved).await {
                    Ok(f) => f,
                    Err(e) => return refuse(&sock, src, e.kind().into(), e.into()).await,
                };
                let size = file.metadata().await.ok().map(|m| m.len());
                let negotiation = options::negotiate(requested, &settings.capabilities, direction, size);
                let mut processor = PacketProcessor::for_sending(Box::new(file), negotiation.options);
                let first = processor.first_packet(negotiation.oack()).await;
                (Self::opening(processor, first, &sock, src).await?, None)
            }
            Direction::Write => {
                if !settings.allow_writes {
                    let err = ServerConnectionError::BadRequest("Writes are disabled".to_string());
                    return refuse(&sock, src, ErrorCode::AccessViolation, err).await;
                }
                let resolved = match sandbox.resolve_write(path, settings.allow_overwrite).await {
                    Ok(p) => p,
                    Err(e) => return refuse(&sock, src, e.error_code(), e.into()).await,
                };
                let opened = if settings.allow_overwrite {
                    File::create(&resolved).await
                } else {
                    File::create_new(&resolved).await
                };
                let file = match opened {
                    Ok(f) => f,
                    Err(e) => return refuse(&sock, src, e.kind().into(), e.into()).await,
                };
                let negotiation = options::negotiate(requested, &settings.capabilities, direction, None);
                let mut processor = PacketProcessor::for_receiving(Box::new(file), negotiation.options);
                let first = processor.first_packet(negotiation.oack()).await;
                (Self::opening(processor, first, &sock, src).await?, Some(resolved))
            }
        };

        let description = format!(
            "{} '{}' for {}",
            if direction == Direction::Read { "RRQ" } else { "WRQ" },
            path,
            src
        );
        let session = TransferSession::new(sock, src, processor, settings.policy.clone(), events.clone())
            .with_idle_limit(settings.policy.idle_session_timeout)
            .with_shutdown(shutdown);

        Ok(ServerRequestHandler { session, first_packet, description, partial_upload, events })
    }

    /// Unwraps the processor's first action into the packet that opens the session.
    async fn opening(
        processor: PacketProcessor<'static>,
        first: ResultAction,
        sock: &TftpSocket,
        src: SocketAddr,
    ) -> Result<(PacketProcessor<'static>, Packet), ServerConnectionError> {
        match first {
            ResultAction::SendPacketAndAwait(p) => Ok((processor, p)),
            ResultAction::TerminateWithPacket(p) => {
                let _ = sock.send(&p, src).await;
                Err(ServerConnectionError::Internal(format!("Transfer ended before it began: {:?}", p)))
            }
            ResultAction::CloseConnection(_) | ResultAction::RetryRecv | ResultAction::Resend => {
                send_error_packet(sock, src, ErrorCode::Undefined, "Internal error, please retry".to_string()).await;
                Err(ServerConnectionError::Internal(
                    "Packet processor produced no opening packet".to_string(),
                ))
            }
        }
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(self) -> Result<u64, FailReason> {
        let ServerRequestHandler { session, first_packet, description, partial_upload, events } = self;
        events.info(format_args!("Serving {} from {}", description, session.peer()));

        let result = session.run(first_packet).await;
        match &result {
            Ok(bytes) => events.info(format_args!("Finished {}: {} bytes", description, bytes)),
            Err(reason) => {
                events.warn(format_args!("{} failed: {}", description, reason));
                if let Some(path) = partial_upload {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        events.debug(format_args!("Couldn't remove partial upload {}: {}", path.display(), e));
                    }
                }
            }
        }
        result
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    Rejected(SandboxError),
    File(io::Error),
    Internal(String),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::Rejected(e) => write!(f, "Request rejected: {}", e),
            Self::File(e) => write!(f, "File IO error: {}", e),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::File(e)
    }
}

impl From<SandboxError> for ServerConnectionError {
    fn from(e: SandboxError) -> ServerConnectionError {
        ServerConnectionError::Rejected(e)
    }
}
