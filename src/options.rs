// Option negotiation (RFC 2347, 2348, 2349).
//
// A requester appends name/value pairs to its RRQ or WRQ. A responder that understands any of
// them answers with an OACK listing the ones it accepted, in place of the first DATA (for a read)
// or ACK(0) (for a write). A responder that understands none of them answers as plain RFC 1350
// would, and the requester quietly falls back to the defaults. Unknown options are never an error.

use crate::tftp::Packet;

/// Option name/value pairs in wire order.
pub type OptionPairs = Vec<(String, String)>;

pub const DEFAULT_BLKSIZE: u16 = 512;
pub const MIN_BLKSIZE: u16 = 8;
pub const MAX_BLKSIZE: u16 = 65464;
pub const MIN_TIMEOUT: u8 = 1;
pub const MAX_TIMEOUT: u8 = 255;

const BLKSIZE: &str = "blksize";
const TIMEOUT: &str = "timeout";
const TSIZE: &str = "tsize";

/// The parameters a transfer actually runs with once negotiation is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub blksize: u16,

    /// Retransmission timeout in seconds, if one was agreed.
    pub timeout: Option<u8>,

    /// Total transfer size, if known. `None` is "unknown", never "empty".
    pub tsize: Option<u64>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions { blksize: DEFAULT_BLKSIZE, timeout: None, tsize: None }
    }
}

/// Which way the file moves, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// RRQ: the server sends the file.
    Read,
    /// WRQ: the server receives the file.
    Write,
}

/// What the responding side is willing to negotiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub max_blksize: u16,
    pub allow_timeout: bool,
    pub allow_tsize: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities { max_blksize: MAX_BLKSIZE, allow_timeout: true, allow_tsize: true }
    }
}

/// Outcome of server-side negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    /// Options to echo in the OACK, lower-cased, in request order.
    pub accepted: OptionPairs,
    pub options: TransferOptions,
}

impl Negotiation {
    /// True when nothing was accepted, so the responder must behave as a plain RFC 1350 peer.
    pub fn declined_silently(&self) -> bool {
        self.accepted.is_empty()
    }

    /// The OACK to send instead of the first DATA/ACK, if any.
    pub fn oack(&self) -> Option<Packet> {
        if self.declined_silently() {
            None
        } else {
            Some(Packet::OptionAck { options: self.accepted.clone() })
        }
    }
}

fn clamp_blksize(requested: u64, max: u16) -> u16 {
    let max = max.clamp(MIN_BLKSIZE, MAX_BLKSIZE);
    requested.clamp(MIN_BLKSIZE as u64, max as u64) as u16
}

fn clamp_timeout(requested: u64) -> u8 {
    requested.clamp(MIN_TIMEOUT as u64, MAX_TIMEOUT as u64) as u8
}

/// Selects the options a responder accepts from a request.
///
/// `file_size` is the size of the file being read; it answers a `tsize` query on RRQ and is
/// reported as 0 when unknown. Unparseable values and unrecognised names are dropped.
pub fn negotiate(
    requested: &OptionPairs,
    caps: &Capabilities,
    direction: Direction,
    file_size: Option<u64>,
) -> Negotiation {
    let mut accepted: OptionPairs = Vec::new();
    let mut options = TransferOptions::default();

    for (raw_name, value) in requested {
        let name = raw_name.to_ascii_lowercase();
        if accepted.iter().any(|(n, _)| *n == name) {
            continue;
        }
        let Ok(parsed) = value.trim().parse::<u64>() else {
            continue;
        };

        match name.as_str() {
            BLKSIZE => {
                options.blksize = clamp_blksize(parsed, caps.max_blksize);
                accepted.push((name, options.blksize.to_string()));
            }
            TIMEOUT if caps.allow_timeout => {
                let secs = clamp_timeout(parsed);
                options.timeout = Some(secs);
                accepted.push((name, secs.to_string()));
            }
            TSIZE if caps.allow_tsize => {
                let size = match direction {
                    Direction::Read => file_size.unwrap_or(0),
                    Direction::Write => parsed,
                };
                options.tsize = match direction {
                    Direction::Read => file_size,
                    Direction::Write => Some(parsed),
                };
                accepted.push((name, size.to_string()));
            }
            _ => {}
        }
    }

    Negotiation { accepted, options }
}

/// Builds the option list a client appends to its request.
pub fn request_options(blksize: Option<u16>, timeout: Option<u8>, tsize: Option<u64>) -> OptionPairs {
    let mut options = Vec::new();
    if let Some(size) = blksize {
        options.push((BLKSIZE.to_string(), size.clamp(MIN_BLKSIZE, MAX_BLKSIZE).to_string()));
    }
    if let Some(secs) = timeout {
        options.push((TIMEOUT.to_string(), secs.max(MIN_TIMEOUT).to_string()));
    }
    if let Some(size) = tsize {
        options.push((TSIZE.to_string(), size.to_string()));
    }
    options
}

/// Validates an OACK against what the client asked for.
///
/// The responder may only acknowledge requested options, and may only shrink `blksize`.
pub fn accept_oack(requested: &OptionPairs, oack: &OptionPairs) -> Result<TransferOptions, String> {
    let mut options = TransferOptions::default();

    for (raw_name, value) in oack {
        let name = raw_name.to_ascii_lowercase();
        let asked = requested
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
            .map(|(_, v)| v)
            .ok_or_else(|| format!("peer acknowledged option '{raw_name}' that was never requested"))?;

        match name.as_str() {
            BLKSIZE => {
                let size: u16 = value
                    .parse()
                    .map_err(|_| format!("peer sent an invalid blksize '{value}'"))?;
                let limit: u16 = asked.parse().unwrap_or(MAX_BLKSIZE);
                if !(MIN_BLKSIZE..=limit).contains(&size) {
                    return Err(format!("peer chose blksize {size}, outside 8..={limit}"));
                }
                options.blksize = size;
            }
            TIMEOUT => {
                let secs: u8 = value
                    .parse()
                    .map_err(|_| format!("peer sent an invalid timeout '{value}'"))?;
                if secs < MIN_TIMEOUT {
                    return Err("peer chose a zero timeout".to_string());
                }
                options.timeout = Some(secs);
            }
            TSIZE => {
                let size: u64 = value
                    .parse()
                    .map_err(|_| format!("peer sent an invalid tsize '{value}'"))?;
                options.tsize = Some(size);
            }
            _ => return Err(format!("peer acknowledged unsupported option '{raw_name}'")),
        }
    }

    Ok(options)
}
