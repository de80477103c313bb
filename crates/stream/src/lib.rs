//! File Upload over a Reliable Stream
//!
//! The transport already orders and delivers bytes, so the protocol is only a
//! header line and a reply:
//!
//! ```text
//! client: PUT|<basename>|<size>\n
//! server: OK\n | ERR|<reason>\n
//! client: <size raw bytes>
//! server: DONE\n
//! ```

mod client;
mod server;

pub use client::*;
pub use server::*;

/// Final line the server sends once every byte is stored
pub const DONE: &str = "DONE";

/// Longest header line either side will read
pub const MAX_LINE: u64 = 4096;
