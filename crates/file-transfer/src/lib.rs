//! Reliable File Transfer
//!
//! File download and upload over UDP with a stop-and-wait protocol, plus an
//! upload variant over TCP.
//!
//! # Services
//!
//! - **Download** (UDP 5006): concurrent sessions, one per requesting peer
//!   - Path confinement to the serving root
//!   - Per-chunk acknowledgment with bounded retransmission
//!
//! - **Upload** (UDP 5007): one active session at a time
//!   - `ERR|Busy` for competing uploads, `ERR|NoSession` for strangers
//!   - Idle sessions abandoned after a timeout
//!
//! - **Stream upload** (TCP 6007): header line, raw body, `DONE`
//!

pub mod util;

pub use {download, stopwait, stream, upload};
