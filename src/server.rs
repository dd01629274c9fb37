// The server dispatcher.
//
// One task owns the well-known request socket. Every RRQ/WRQ that arrives there is handed to a
// freshly spawned task running a ServerRequestHandler on its own ephemeral port, so a slow or
// broken transfer never holds up the listener or any other transfer. The only state the tasks
// share is the map of active sessions and the sandbox root, which is read at request time.

use crate::events::{EventSink, Events};
use crate::options::{Capabilities, Direction};
use crate::policy::RetryPolicy;
use crate::sandbox::Sandbox;
use crate::srv_conn::{HandlerSettings, ServerRequestHandler};
use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket};
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEFAULT_PORT: u16 = 69;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub policy: RetryPolicy,
    pub capabilities: Capabilities,

    /// When false every WRQ is refused with an access violation.
    pub allow_writes: bool,

    /// When false a WRQ naming an existing file is refused with "file already exists".
    pub allow_overwrite: bool,

    /// Upper bound on concurrent transfers. `None` is unbounded.
    pub max_sessions: Option<usize>,

    /// Ports to pick session endpoints from. `None` lets the OS choose.
    pub port_range: Option<RangeInclusive<u16>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            policy: RetryPolicy::default(),
            capabilities: Capabilities::default(),
            allow_writes: true,
            allow_overwrite: false,
            max_sessions: None,
            port_range: None,
        }
    }
}

impl ServerConfig {
    fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            policy: self.policy.clone(),
            capabilities: self.capabilities.clone(),
            allow_writes: self.allow_writes,
            allow_overwrite: self.allow_overwrite,
            port_range: self.port_range.clone(),
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    AlreadyRunning(SocketAddr),
    Bind(SocketError),
}

impl error::Error for ServerError {}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerError::AlreadyRunning(addr) => write!(f, "Server is already listening on {}", addr),
            ServerError::Bind(e) => write!(f, "Couldn't bind request socket: {}", e),
        }
    }
}

/// Identifies a transfer for duplicate request suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    peer: SocketAddr,
    filename: String,
    direction: Direction,
}

type SessionMap = Arc<Mutex<HashMap<SessionKey, JoinHandle<()>>>>;

/// Lock helper that shrugs off poisoning; the map stays consistent because every critical
/// section is a single insert or remove.
fn lock_sessions(sessions: &SessionMap) -> std::sync::MutexGuard<'_, HashMap<SessionKey, JoinHandle<()>>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    listener: JoinHandle<()>,
    sessions: SessionMap,
}

pub struct Server {
    config: Arc<ServerConfig>,
    sandbox: Arc<RwLock<Sandbox>>,
    events: Events,
    running: Option<Running>,
}

impl Server {
    pub fn new(root: impl Into<PathBuf>, config: ServerConfig) -> Server {
        Server {
            config: Arc::new(config),
            sandbox: Arc::new(RwLock::new(Sandbox::new(root))),
            events: Events::default(),
            running: None,
        }
    }

    /// Routes status messages to `sink` instead of the `log` facade.
    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Server {
        self.events = Events::new(sink);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn root_dir(&self) -> PathBuf {
        self.sandbox.read().unwrap_or_else(PoisonError::into_inner).root().to_path_buf()
    }

    /// Changes the directory served to new requests. Transfers already running keep their files.
    pub fn set_root_dir(&self, root: impl Into<PathBuf>) {
        let root = root.into();
        self.events.info(format_args!("Serving files from {}", root.display()));
        *self.sandbox.write().unwrap_or_else(PoisonError::into_inner) = Sandbox::new(root);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn active_sessions(&self) -> usize {
        self.running.as_ref().map_or(0, |r| lock_sessions(&r.sessions).len())
    }

    /// Binds the request socket and starts dispatching requests. Returns the bound address,
    /// which differs from the requested one when `port` is 0.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen(&mut self, ip: IpAddr, port: u16) -> Result<SocketAddr, ServerError> {
        if let Some(running) = &self.running {
            return Err(ServerError::AlreadyRunning(running.local_addr));
        }

        let sock = TftpSocket::bind((ip, port).into()).map_err(ServerError::Bind)?;
        let local_addr = sock.local_addr().map_err(ServerError::Bind)?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sessions = SessionMap::default();

        let dispatcher = Dispatcher {
            settings: Arc::new(self.config.handler_settings()),
            max_sessions: self.config.max_sessions,
            sandbox: self.sandbox.clone(),
            sessions: sessions.clone(),
            events: self.events.clone(),
            shutdown: shutdown_rx,
            local_ip: local_addr.ip(),
        };
        let listener = tokio::spawn(dispatcher.run(sock));

        self.events.info(format_args!(
            "Listening on {}, serving {}",
            local_addr,
            self.root_dir().display()
        ));
        self.running = Some(Running { local_addr, shutdown, listener, sessions });
        Ok(local_addr)
    }

    /// Closes the request socket and tells every active session to abandon its transfer.
    /// No packets are sent to the peers.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.listener.abort();
        let _ = running.shutdown.send(true);
        self.events.info(format_args!("Stopped listening on {}", running.local_addr));
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server")
            .field("root", &self.root_dir())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// Everything the listener task needs to spawn sessions.
struct Dispatcher {
    settings: Arc<HandlerSettings>,
    max_sessions: Option<usize>,
    sandbox: Arc<RwLock<Sandbox>>,
    sessions: SessionMap,
    events: Events,
    shutdown: watch::Receiver<bool>,
    local_ip: IpAddr,
}

impl Dispatcher {
    async fn run(self, mut sock: TftpSocket) {
        loop {
            match sock.recv().await {
                Ok((packet, src)) => self.dispatch(&sock, packet, src).await,
                Err(SocketError::PacketParse(src, e)) => {
                    self.events.debug(format_args!("Malformed request from {}: {}", src, e));
                    let _ = sock.send(&Packet::error(ErrorCode::Illegal), src).await;
                }
                Err(SocketError::Timeout(_)) => {}
                Err(SocketError::IO(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
                    ) => {}
                Err(SocketError::IO(e)) => {
                    self.events.error(format_args!("Request socket failed: {}", e));
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, sock: &TftpSocket, packet: Packet, src: SocketAddr) {
        let key = match &packet {
            Packet::ReadReq { path, .. } => SessionKey { peer: src, filename: path.clone(), direction: Direction::Read },
            Packet::WriteReq { path, .. } => SessionKey { peer: src, filename: path.clone(), direction: Direction::Write },
            // Stray packets from a peer that lost track of its transfer ID.
            Packet::Error { .. } => return,
            other => {
                self.events.debug(format_args!("Unexpected {:?} on the request port from {}", other.op_code(), src));
                let _ = sock.send(&Packet::error(ErrorCode::Illegal), src).await;
                return;
            }
        };

        match self.admit(key.clone(), packet, src) {
            Admission::Started => {}
            Admission::Duplicate => {
                self.events.debug(format_args!("Ignoring repeated request for '{}' from {}", key.filename, src));
            }
            Admission::Busy => {
                self.events.warn(format_args!("Refusing request for '{}' from {}: server busy", key.filename, src));
                let busy = Packet::Error { code: ErrorCode::Undefined, message: "server busy".to_string() };
                let _ = sock.send(&busy, src).await;
            }
        }
    }

    /// Registers and spawns a session for `request` unless it duplicates an active one or the
    /// session limit is reached.
    fn admit(&self, key: SessionKey, request: Packet, src: SocketAddr) -> Admission {
        let mut sessions = lock_sessions(&self.sessions);
        sessions.retain(|_, handle| !handle.is_finished());
        if sessions.contains_key(&key) {
            return Admission::Duplicate;
        }
        if self.max_sessions.is_some_and(|max| sessions.len() >= max) {
            return Admission::Busy;
        }

        let sandbox = self.sandbox.read().unwrap_or_else(PoisonError::into_inner).clone();
        let settings = self.settings.clone();
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        let local_ip = self.local_ip;
        let task_sessions = self.sessions.clone();
        let task_key = key.clone();

        // The map lock is held across the spawn so the task's own removal can never run first.
        let handle = tokio::spawn(async move {
            match ServerRequestHandler::new(&settings, &sandbox, &request, src, local_ip, events.clone(), shutdown).await {
                Ok(handler) => {
                    let _ = handler.handle().await;
                }
                Err(e) => events.warn(format_args!("Rejected request for '{}' from {}: {}", task_key.filename, src, e)),
            }
            lock_sessions(&task_sessions).remove(&task_key);
        });
        sessions.insert(key, handle);
        Admission::Started
    }
}

enum Admission {
    Started,
    Duplicate,
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tempdir::TempDir;
    use tokio::net::UdpSocket;
    use tokio_test::{assert_err, assert_ok};

    async fn exchange(sock: &UdpSocket, packet: Packet, dst: SocketAddr) -> (Packet, SocketAddr) {
        sock.send_to(&packet.to_bytes(), dst).await.unwrap();
        let mut buf = vec![0; 2048];
        let (n, src) = tokio::time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .expect("server went quiet")
            .unwrap();
        (Packet::parse_from_buf(&buf[..n]).unwrap(), src)
    }

    fn rrq(path: &str) -> Packet {
        Packet::ReadReq { path: path.to_string(), mode: crate::tftp::FileMode::Octet, options: vec![] }
    }

    #[tokio::test]
    async fn test_listen_twice_is_refused() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let mut server = Server::new(tmpdir.path(), ServerConfig::default());

        let addr = assert_ok!(server.listen(Ipv4Addr::LOCALHOST.into(), 0));
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        assert_err!(server.listen(Ipv4Addr::LOCALHOST.into(), 0));

        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
    }

    #[tokio::test]
    async fn test_malformed_and_stray_packets_on_request_port() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let mut server = Server::new(tmpdir.path(), ServerConfig::default());
        let addr = server.listen(Ipv4Addr::LOCALHOST.into(), 0).unwrap();
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        client.send_to(&[0, 1, b'x'], addr).await.unwrap();
        let mut buf = vec![0; 64];
        let (n, src) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(src, addr);
        assert_eq!(Packet::parse_from_buf(&buf[..n]).unwrap(), Packet::error(ErrorCode::Illegal));

        let (reply, src) = exchange(&client, Packet::Ack { block: 1 }, addr).await;
        assert_eq!(src, addr);
        assert_eq!(reply, Packet::error(ErrorCode::Illegal));
    }

    #[tokio::test]
    async fn test_repeated_request_is_ignored() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("report.txt"), vec![1u8; 100]).unwrap();
        let mut server = Server::new(tmpdir.path(), ServerConfig::default());
        let addr = server.listen(Ipv4Addr::LOCALHOST.into(), 0).unwrap();
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        let (first, session) = exchange(&client, rrq("report.txt"), addr).await;
        assert!(matches!(first, Packet::Data { block: 1, .. }));
        assert_eq!(server.active_sessions(), 1);

        // Nothing answers the repeat: no second session, no error from the request port.
        client.send_to(&rrq("report.txt").to_bytes(), addr).await.unwrap();
        let mut buf = vec![0; 2048];
        let quiet = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(quiet.is_err());
        assert_eq!(server.active_sessions(), 1);

        client.send_to(&Packet::Ack { block: 1 }.to_bytes(), session).await.unwrap();
        for _ in 0..50 {
            if server.active_sessions() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_session_limit_answers_busy() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("a.bin"), vec![1u8; 100]).unwrap();
        std::fs::write(tmpdir.path().join("b.bin"), vec![2u8; 100]).unwrap();
        let config = ServerConfig { max_sessions: Some(1), ..ServerConfig::default() };
        let mut server = Server::new(tmpdir.path(), config);
        let addr = server.listen(Ipv4Addr::LOCALHOST.into(), 0).unwrap();
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        let (first, _) = exchange(&client, rrq("a.bin"), addr).await;
        assert!(matches!(first, Packet::Data { block: 1, .. }));

        let (busy, src) = exchange(&client, rrq("b.bin"), addr).await;
        assert_eq!(src, addr);
        assert_eq!(busy, Packet::Error { code: ErrorCode::Undefined, message: "server busy".to_string() });
    }

    #[tokio::test]
    async fn test_set_root_dir_applies_to_new_requests() {
        let first_root = TempDir::new("first").unwrap();
        let second_root = TempDir::new("second").unwrap();
        std::fs::write(second_root.path().join("only-here.txt"), b"moved").unwrap();

        let mut server = Server::new(first_root.path(), ServerConfig::default());
        let addr = server.listen(Ipv4Addr::LOCALHOST.into(), 0).unwrap();
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        let (reply, _) = exchange(&client, rrq("only-here.txt"), addr).await;
        assert_eq!(reply, Packet::error(ErrorCode::FileNotFound));

        server.set_root_dir(second_root.path());
        assert_eq!(server.root_dir(), second_root.path());
        let (reply, session) = exchange(&client, rrq("only-here.txt"), addr).await;
        assert_eq!(reply, Packet::Data { block: 1, data: b"moved".to_vec() });
        client.send_to(&Packet::Ack { block: 1 }.to_bytes(), session).await.unwrap();
    }
}
