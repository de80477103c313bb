//! Client Upload State Machine
//!
//! `PUT` → `OK` → (`DAT` → `ACK`)* → `EOF` → `ACK|EOF`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use stopwait::{
    Link, Message, OutboundSession, TransferConfig, TransferError, UdpLink, recv_within, sanitize_basename,
};
use tokio::fs::File;
use tokio::io::BufReader;

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub path: PathBuf,
    pub name: String,
    pub bytes: u64,
    pub chunks: u64,
}

/// Upload the file at `path` to `server` under its basename
pub async fn upload_file(
    server: SocketAddr,
    path: impl AsRef<Path>,
    config: &TransferConfig,
) -> Result<UploadReport, TransferError> {
    let mut link = UdpLink::connect(server).await?;
    send_file(&mut link, path.as_ref(), config).await
}

/// Run the upload state machine over an existing link
pub async fn send_file<L: Link>(
    link: &mut L,
    path: &Path,
    config: &TransferConfig,
) -> Result<UploadReport, TransferError> {
    let name = path
        .file_name()
        .and_then(|n| sanitize_basename(&n.to_string_lossy()))
        .ok_or_else(|| TransferError::NotFound(path.display().to_string()))?;
    let file = File::open(path).await?;
    let size = file.metadata().await?.len();

    link.send(&Message::Put {
        filename: name.clone(),
        size,
    })
    .await?;

    match recv_within(link, config.response_timeout).await? {
        Some(Message::Accept) => {}
        Some(Message::Error { reason, detail }) => return Err(TransferError::rejected(&reason, detail.as_deref())),
        Some(other) => return Err(TransferError::Unexpected(other.to_string())),
        None => return Err(TransferError::NoResponse(link.peer())),
    }

    tracing::info!("Uploading {} ({} bytes) to {}", name, size, link.peer());

    let mut session = OutboundSession::new(BufReader::new(file));
    let summary = session.run(link, config).await?;

    Ok(UploadReport {
        path: path.to_path_buf(),
        name,
        bytes: summary.bytes,
        chunks: summary.chunks,
    })
}
