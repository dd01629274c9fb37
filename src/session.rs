// Drives one PacketProcessor over its own UDP endpoint until the transfer ends.
//
// The loop alternates between a work step (send the outstanding packet) and a wait step (read
// datagrams until the response deadline). A timeout retransmits the outstanding packet; once the
// retry budget is spent the session fails. The only suspension points are the socket read and
// the retransmission timer, plus an optional shutdown signal from the owning server.
//
// Servers may also set an idle limit: a session that makes no progress for that long is torn down
// even while its peer keeps it busy with duplicates. The limit never undercuts the retry budget.

use crate::events::{Events, Progress};
use crate::policy::RetryPolicy;
use crate::processor::{FailReason, PacketProcessor, ResultAction, SessionState};
use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Receives progress after every applied DATA block.
pub type ProgressFn<'a> = Box<dyn FnMut(Progress) + Send + 'a>;

pub struct TransferSession<'a> {
    sock: TftpSocket,

    /// Where packets go. Before `peer_locked` this is the well-known request address.
    peer: SocketAddr,
    peer_locked: bool,

    processor: PacketProcessor<'a>,
    policy: RetryPolicy,
    events: Events,
    progress: Option<ProgressFn<'a>>,
    shutdown: Option<watch::Receiver<bool>>,
    idle_limit: Option<Duration>,

    retries: u32,
    last_progress: Instant,
    reported: u64,
}

/// Resolves once the owner asks the session to stop, or drops the signal's sender.
async fn cancelled(shutdown: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = shutdown else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl<'a> TransferSession<'a> {
    /// A session whose peer transfer ID is already known, as on the server.
    pub fn new(
        sock: TftpSocket,
        peer: SocketAddr,
        processor: PacketProcessor<'a>,
        policy: RetryPolicy,
        events: Events,
    ) -> TransferSession<'a> {
        TransferSession {
            sock,
            peer,
            peer_locked: true,
            processor,
            policy,
            events,
            progress: None,
            shutdown: None,
            idle_limit: None,
            retries: 0,
            last_progress: Instant::now(),
            reported: 0,
        }
    }

    /// A client session that sends its request to `server` and then switches to whatever port
    /// the server answers from.
    pub fn for_request(
        sock: TftpSocket,
        server: SocketAddr,
        processor: PacketProcessor<'a>,
        policy: RetryPolicy,
        events: Events,
    ) -> TransferSession<'a> {
        TransferSession { peer_locked: false, ..TransferSession::new(sock, server, processor, policy, events) }
    }

    pub fn with_progress(mut self, progress: impl FnMut(Progress) + Send + 'a) -> TransferSession<'a> {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> TransferSession<'a> {
        self.shutdown = Some(shutdown);
        self
    }

    /// Tears the session down once it has gone `limit` without advancing a block.
    pub fn with_idle_limit(mut self, limit: Duration) -> TransferSession<'a> {
        self.idle_limit = Some(limit);
        self
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> &SessionState {
        self.processor.state()
    }

    fn response_timeout(&self) -> Duration {
        self.policy.response_timeout_for(self.processor.options().timeout)
    }

    /// Whether the idle limit has run out. The effective limit is at least the time the retry
    /// budget needs, so a silent peer always sees every retransmission first.
    fn idle_expired(&self) -> bool {
        let Some(limit) = self.idle_limit else {
            return false;
        };
        let budget = self.response_timeout().saturating_mul(self.policy.max_retries.saturating_add(1));
        self.last_progress.elapsed() >= limit.max(budget)
    }

    /// Checks the source of a datagram against the peer, locking onto the first reply to a
    /// client request.
    fn accept_source(&mut self, src: SocketAddr) -> bool {
        if self.peer_locked {
            return src == self.peer;
        }
        if src.ip() != self.peer.ip() {
            return false;
        }
        self.events.debug(format_args!("Request to {} answered from {}", self.peer, src));
        self.peer = src;
        self.peer_locked = true;
        true
    }

    fn report_progress(&mut self) {
        let transferred = self.processor.bytes_transferred();
        if transferred == self.reported {
            return;
        }
        self.reported = transferred;
        if let Some(progress) = self.progress.as_mut() {
            progress(Progress { transferred, total: self.processor.options().tsize });
        }
    }

    fn finish(&self) -> Result<u64, FailReason> {
        match self.processor.state() {
            SessionState::Complete => Ok(self.processor.bytes_transferred()),
            SessionState::Failed(reason) => Err(reason.clone()),
            _ => Err(FailReason::Cancelled),
        }
    }

    fn abort(&mut self, reason: FailReason) -> Result<u64, FailReason> {
        self.processor.fail(reason);
        self.finish()
    }

    /// Sends `opening` and runs the exchange to a terminal state.
    ///
    /// Returns the number of bytes transferred on completion.
    pub async fn run(mut self, opening: Packet) -> Result<u64, FailReason> {
        let mut out = opening;
        self.last_progress = Instant::now();

        // This loop is used for message sending as well as retries, depending on whether |out|
        // has been overwritten.
        'send: loop {
            if let Err(e) = self.sock.send(&out, self.peer).await {
                return self.abort(FailReason::Socket(e.to_string()));
            }
            let deadline = Instant::now() + self.response_timeout();

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let received = tokio::select! {
                    received = self.sock.recv_with_timeout(remaining) => received,
                    _ = cancelled(&mut self.shutdown) => return self.abort(FailReason::Cancelled),
                };

                match received {
                    Ok((packet, src)) => {
                        if !self.accept_source(src) {
                            self.events.debug(format_args!(
                                "{:?} from unknown transfer ID {} while serving {}",
                                packet.op_code(),
                                src,
                                self.peer
                            ));
                            if !matches!(packet, Packet::Error { .. }) {
                                let _ = self.sock.send(&Packet::error(ErrorCode::UnknownTid), src).await;
                            }
                            continue;
                        }

                        let action = self.processor.process_packet(&packet).await;
                        self.report_progress();
                        match action {
                            ResultAction::SendPacketAndAwait(p) => {
                                self.retries = 0;
                                self.last_progress = Instant::now();
                                out = p;
                                continue 'send;
                            }
                            ResultAction::Resend => {
                                if self.idle_expired() {
                                    return self.abort(FailReason::IdleTimeout);
                                }
                                self.events.debug(format_args!("Duplicate from {}, acknowledging again", self.peer));
                                continue 'send;
                            }
                            ResultAction::RetryRecv => {
                                self.events.debug(format_args!(
                                    "Ignoring {:?} from {} in state {:?}",
                                    packet.op_code(),
                                    self.peer,
                                    self.processor.state()
                                ));
                                continue;
                            }
                            ResultAction::CloseConnection(maybe_warn) => {
                                if let Some(msg) = maybe_warn {
                                    self.events.warn(format_args!("{}", msg));
                                }
                                return self.finish();
                            }
                            ResultAction::TerminateWithPacket(p) => {
                                let _ = self.sock.send(&p, self.peer).await;
                                return self.finish();
                            }
                        }
                    }
                    // If we timed out, rebroadcast the last sent packet
                    Err(SocketError::Timeout(_)) => {
                        self.retries += 1;
                        if self.retries > self.policy.max_retries {
                            return self.abort(FailReason::Timeout);
                        }
                        if self.idle_expired() {
                            return self.abort(FailReason::IdleTimeout);
                        }
                        self.events.debug(format_args!(
                            "No reply from {} after {:?}, retransmitting (retry {}/{})",
                            self.peer,
                            self.response_timeout(),
                            self.retries,
                            self.policy.max_retries
                        ));
                        continue 'send;
                    }
                    Err(SocketError::PacketParse(src, e)) => {
                        self.events.debug(format_args!("Dropping datagram from {}: {}", src, e));
                        continue;
                    }
                    // Some platforms surface ICMP errors from earlier sends on the next read.
                    Err(SocketError::IO(e))
                        if matches!(e.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset) =>
                    {
                        continue;
                    }
                    Err(SocketError::IO(e)) => return self.abort(FailReason::Socket(e.to_string())),
                }
            }
        }
    }
}
