//! Stop-and-Wait Reliable Transfer
//!
//! Building blocks for moving a file over an unreliable, unordered datagram
//! transport with exactly-once, in-order delivery. Only one unacknowledged
//! message is ever in flight.
//!
//! - [`protocol`] - the wire messages and their text codec
//! - [`transfer`] - configuration, the [`Link`] abstraction and [`send_and_await`]
//! - [`session`] - receiver and sender bookkeeping shared by every state machine
//! - [`path`] - confinement of served and stored files
//! - [`error`] - the [`TransferError`] taxonomy
//!
//! ```rust
//! use stopwait::{Ack, Message};
//!
//! let wire = Message::Data { seq: 0, payload: vec![0, 159, 146, 150] }.encode();
//! assert_eq!(wire, b"DAT|0|AJ+Slg==");
//!
//! let ack: Message = "ACK|EOF".parse().unwrap();
//! assert_eq!(ack, Message::Ack(Ack::Eof));
//! ```

pub mod error;
pub mod path;
pub mod protocol;
pub mod session;
pub mod transfer;

pub use error::{ConfigError, TransferError, io_reason};
pub use path::{resolve_in_root, sanitize_basename};
pub use protocol::{Ack, DecodeError, ErrorReason, MAX_DATAGRAM, Message, Verb};
pub use session::{Direction, InboundSession, OutboundSession, Receipt, SendSummary, SessionStatus};
pub use transfer::{Link, TransferConfig, UdpLink, create_ephemeral_socket, recv_from_peer, recv_within, send_and_await};
