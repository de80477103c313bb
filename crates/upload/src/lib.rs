//! Stop-and-Wait File Upload
//!
//! Server side: one upload slot per process. A second `PUT` while a session is
//! active is answered with `ERR|Busy`; datagrams from any other peer get
//! `ERR|NoSession`. Client side: the matching `PUT` state machine.

mod client;
mod server;
mod slot;

pub use client::*;
pub use server::*;
pub use slot::UploadSlot;
