// The client driver: one transfer against one server, run to completion on the caller's task.
//
// Requests go to the server's well-known port; the session then locks onto whichever port the
// server answers from. Requested options are advisory. A server that ignores them answers with
// plain DATA(1) or ACK(0) and the transfer runs with RFC 1350 defaults.

use crate::events::{EventSink, Events, Progress};
use crate::options::{self, TransferOptions};
use crate::policy::RetryPolicy;
use crate::processor::{FailReason, PacketProcessor};
use crate::session::TransferSession;
use crate::tftp::{ErrorCode, FileMode, Packet, SocketError, TftpSocket};
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub mode: FileMode,

    /// Block size to ask for. `None` sends no `blksize` option.
    pub blksize: Option<u16>,

    /// Retransmission timeout in seconds to ask for.
    pub timeout: Option<u8>,

    /// Ask for the size on download, announce it on upload.
    pub tsize: bool,

    pub policy: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            mode: FileMode::Octet,
            blksize: None,
            timeout: None,
            tsize: false,
            policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub enum ClientError {
    /// The local socket could not be bound, or sending/receiving on it failed.
    ConnectFailed(String),
    PeerError { code: ErrorCode, message: String },
    /// The retry budget ran out.
    Timeout,
    LocalIo(io::Error),
    ProtocolViolation(String),
}

impl error::Error for ClientError {}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientError::ConnectFailed(msg) => write!(f, "Couldn't reach server: {}", msg),
            ClientError::PeerError { code, message } => {
                write!(f, "Server refused transfer: {} ({:?})", message, code)
            }
            ClientError::Timeout => write!(f, "Server stopped responding"),
            ClientError::LocalIo(e) => write!(f, "Local file error: {}", e),
            ClientError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
        }
    }
}

impl From<FailReason> for ClientError {
    fn from(reason: FailReason) -> ClientError {
        match reason {
            FailReason::PeerError { code, message } => ClientError::PeerError { code, message },
            FailReason::Timeout | FailReason::IdleTimeout => ClientError::Timeout,
            FailReason::LocalIo { kind, message } => ClientError::LocalIo(io::Error::new(kind, message)),
            FailReason::ProtocolViolation(msg) => ClientError::ProtocolViolation(msg),
            FailReason::Socket(msg) => ClientError::ConnectFailed(msg),
            // Client sessions carry no shutdown signal.
            FailReason::Cancelled => ClientError::ConnectFailed("transfer abandoned".to_string()),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> ClientError {
        ClientError::LocalIo(e)
    }
}

pub struct Client {
    server: SocketAddr,
    options: ClientOptions,
    events: Events,
}

impl Client {
    pub fn new(server: SocketAddr, options: ClientOptions) -> Client {
        Client { server, options, events: Events::default() }
    }

    /// Routes status messages to `sink` instead of the `log` facade.
    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Client {
        self.events = Events::new(sink);
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn bind_socket(&self) -> Result<TftpSocket, ClientError> {
        let ip: IpAddr = if self.server.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        TftpSocket::bind((ip, 0).into()).map_err(|e| ClientError::ConnectFailed(e.to_string()))
    }

    /// Fetches `remote` into `sink`, reporting progress after each block written.
    ///
    /// Returns the number of bytes received.
    pub async fn download<W>(
        &self,
        remote: &str,
        sink: W,
        progress: impl FnMut(Progress) + Send,
    ) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let requested = options::request_options(
            self.options.blksize,
            self.options.timeout,
            self.options.tsize.then_some(0),
        );
        let request = Packet::ReadReq { path: remote.to_string(), mode: self.options.mode, options: requested.clone() };

        let mut processor = PacketProcessor::for_receiving(Box::new(sink), TransferOptions::default());
        processor.await_reply_to_request(requested);

        let sock = self.bind_socket()?;
        self.events.info(format_args!("Downloading '{}' from {}", remote, self.server));
        let result = TransferSession::for_request(sock, self.server, processor, self.options.policy.clone(), self.events.clone())
            .with_progress(progress)
            .run(request)
            .await;
        self.finish("Download", remote, result)
    }

    /// Downloads `remote` into a new local file. A failed download leaves no file behind.
    pub async fn download_file(
        &self,
        remote: &str,
        local: &Path,
        progress: impl FnMut(Progress) + Send,
    ) -> Result<u64, ClientError> {
        let file = File::create(local).await?;
        let result = self.download(remote, file, progress).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(local).await;
        }
        result
    }

    /// Sends everything `source` yields to the server as `remote`.
    ///
    /// Returns the number of bytes the server acknowledged.
    pub async fn upload<R>(
        &self,
        remote: &str,
        source: R,
        progress: impl FnMut(Progress) + Send,
    ) -> Result<u64, ClientError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.upload_sized(remote, source, None, progress).await
    }

    /// Uploads a local file, announcing its size when `tsize` is enabled.
    pub async fn upload_file(
        &self,
        remote: &str,
        local: &Path,
        progress: impl FnMut(Progress) + Send,
    ) -> Result<u64, ClientError> {
        let file = File::open(local).await?;
        let size = file.metadata().await?.len();
        self.upload_sized(remote, file, Some(size), progress).await
    }

    async fn upload_sized<R>(
        &self,
        remote: &str,
        source: R,
        size: Option<u64>,
        progress: impl FnMut(Progress) + Send,
    ) -> Result<u64, ClientError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let announced = if self.options.tsize { size } else { None };
        let requested = options::request_options(self.options.blksize, self.options.timeout, announced);
        let request = Packet::WriteReq { path: remote.to_string(), mode: self.options.mode, options: requested.clone() };

        let local = TransferOptions { tsize: size, ..TransferOptions::default() };
        let mut processor = PacketProcessor::for_sending(Box::new(source), local);
        processor.await_reply_to_request(requested);

        let sock = self.bind_socket()?;
        self.events.info(format_args!("Uploading '{}' to {}", remote, self.server));
        let result = TransferSession::for_request(sock, self.server, processor, self.options.policy.clone(), self.events.clone())
            .with_progress(progress)
            .run(request)
            .await;
        self.finish("Upload", remote, result)
    }

    fn finish(&self, what: &str, remote: &str, result: Result<u64, FailReason>) -> Result<u64, ClientError> {
        match result {
            Ok(bytes) => {
                self.events.info(format_args!("{} of '{}' complete: {} bytes", what, remote, bytes));
                Ok(bytes)
            }
            Err(reason) => {
                self.events.warn(format_args!("{} of '{}' failed: {}", what, remote, reason));
                Err(reason.into())
            }
        }
    }

    /// Asks the server for the size of `remote` without transferring it.
    ///
    /// Sends a RRQ carrying `tsize=0` and abandons the transfer with an ERROR once the server
    /// answers. `None` means the server does not support the option.
    pub async fn query_size(&self, remote: &str) -> Result<Option<u64>, ClientError> {
        let request = Packet::ReadReq {
            path: remote.to_string(),
            mode: self.options.mode,
            options: options::request_options(None, None, Some(0)),
        };
        let mut sock = self.bind_socket()?;
        let policy = &self.options.policy;
        let cancel = Packet::Error { code: ErrorCode::Undefined, message: "size query only".to_string() };

        let mut attempts = 0;
        'send: loop {
            sock.send(&request, self.server).await.map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
            loop {
                match sock.recv_with_timeout(policy.response_timeout).await {
                    Ok((packet, src)) if src.ip() == self.server.ip() => match packet {
                        Packet::OptionAck { options } => {
                            let _ = sock.send(&cancel, src).await;
                            let size = options
                                .iter()
                                .find(|(name, _)| name.eq_ignore_ascii_case("tsize"))
                                .and_then(|(_, value)| value.parse::<u64>().ok());
                            return Ok(size);
                        }
                        Packet::Data { .. } => {
                            let _ = sock.send(&cancel, src).await;
                            return Ok(None);
                        }
                        Packet::Error { code, message } => return Err(ClientError::PeerError { code, message }),
                        _ => continue,
                    },
                    Ok(_) | Err(SocketError::PacketParse(..)) => continue,
                    Err(SocketError::Timeout(_)) => {
                        attempts += 1;
                        if attempts > policy.max_retries {
                            return Err(ClientError::Timeout);
                        }
                        continue 'send;
                    }
                    Err(SocketError::IO(e))
                        if matches!(e.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset) =>
                    {
                        continue
                    }
                    Err(SocketError::IO(e)) => return Err(ClientError::ConnectFailed(e.to_string())),
                }
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client").field("server", &self.server).field("options", &self.options).finish()
    }
}
