use std::time::Duration;

/// Timer and retransmission settings shared by every session, client or server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait for a reply before assuming the last packet was lost.
    pub response_timeout: Duration,

    /// Retransmissions allowed for one outstanding packet before giving up.
    pub max_retries: u32,

    /// Server-side ceiling on how long a session may go without advancing a block. Never
    /// shorter than the time the retry budget takes.
    pub idle_session_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            response_timeout: Duration::from_secs(2),
            max_retries: 5,
            idle_session_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// The response timeout for a session, honouring a negotiated `timeout` option.
    pub fn response_timeout_for(&self, negotiated: Option<u8>) -> Duration {
        match negotiated {
            Some(secs) => Duration::from_secs(u64::from(secs)),
            None => self.response_timeout,
        }
    }
}
