//! Stop-and-Wait File Download
//!
//! Server side: a dispatch loop that spawns one session per requesting peer and
//! streams the requested file as acknowledged chunks. Client side: the matching
//! `GET` state machine.
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//!
//! use download::{DownloadServer, download_file};
//! use stopwait::TransferConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = DownloadServer::with_config("127.0.0.1:0".to_string(), PathBuf::from("./files"));
//!     let addr = server.bind().await?;
//!     tokio::spawn(async move { server.serve().await });
//!
//!     let report = download_file(addr, "boot.img", None, &TransferConfig::default()).await?;
//!     println!("{} bytes -> {}", report.bytes, report.path.display());
//!     Ok(())
//! }
//! ```

mod client;
mod server;
mod session;

pub use client::*;
pub use server::*;
pub use session::*;
