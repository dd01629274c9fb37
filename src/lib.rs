// A TFTP engine: client and server sides of RFC 1350, with the option extension (RFC 2347),
// block size (RFC 2348) and timeout/transfer size (RFC 2349) options.
//
// Notes on the protocol, as they shape the code:
//
// A transfer starts with a request (RRQ to read, WRQ to write) sent to port 69. The server
// answers from a new port of its own choosing; that (address, port) pair is the transfer ID for
// the rest of the exchange, and datagrams from any other source get ERROR 5 without disturbing
// the transfer.
//
// Data moves in numbered blocks of blksize bytes (512 unless negotiated). Each DATA must be
// ACKed before the next is sent, so each side only ever has one packet outstanding and keeps it
// around for retransmission. A block shorter than blksize, possibly empty, ends the transfer.
// Block numbers are 16 bits and wrap, so every comparison is modular.
//
// Opcodes:
// 1  RRQ    | 01 | filename | 0 | mode | 0 | (option | 0 | value | 0)*
// 2  WRQ    | 02 | filename | 0 | mode | 0 | (option | 0 | value | 0)*
// 3  DATA   | 03 | block (2) | payload (0..blksize)
// 4  ACK    | 04 | block (2)
// 5  ERROR  | 05 | code (2) | message | 0
// 6  OACK   | 06 | (option | 0 | value | 0)*
//
// Loss is detected only by timeouts: whoever is waiting retransmits its last packet. ERROR
// packets are a courtesy. They are never ACKed or retransmitted, and they end the transfer.
//
// If a request carries options the responder understands, it answers with an OACK in place of
// DATA(1) or ACK(0), and an OACK stands for ACK(0) on the requesting side. A responder that
// ignores options answers as plain RFC 1350, and the requester carries on with the defaults.

pub mod client;
pub mod events;
pub mod options;
pub mod policy;
pub mod processor;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod srv_conn;
pub mod tftp;

pub use client::{Client, ClientError, ClientOptions};
pub use events::{EventSink, Events, LogSink, Progress};
pub use options::{Capabilities, TransferOptions};
pub use policy::RetryPolicy;
pub use server::{Server, ServerConfig, ServerError, DEFAULT_PORT};
pub use tftp::{ErrorCode, FileMode, Packet};
