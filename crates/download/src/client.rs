//! Client Download State Machine
//!
//! `GET` → `OK|size|basename` → `ACK|START` → (`DAT` → `ACK`)* → `EOF` → `ACK|EOF`

use std::net::SocketAddr;
use std::path::PathBuf;

use stopwait::{
    Ack, Direction, InboundSession, Link, Message, TransferConfig, TransferError, UdpLink, recv_within,
    sanitize_basename,
};
use tokio::fs::File;
use tokio::io::BufWriter;

/// Result of a successful download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub bytes: u64,
    pub chunks: u64,
}

/// Download `filename` from `server` into `output`, or `downloaded_<basename>`
pub async fn download_file(
    server: SocketAddr,
    filename: &str,
    output: Option<PathBuf>,
    config: &TransferConfig,
) -> Result<DownloadReport, TransferError> {
    let mut link = UdpLink::connect(server).await?;
    receive_file(&mut link, filename, output, config).await
}

/// Run the download state machine over an existing link
pub async fn receive_file<L: Link>(
    link: &mut L,
    filename: &str,
    output: Option<PathBuf>,
    config: &TransferConfig,
) -> Result<DownloadReport, TransferError> {
    link.send(&Message::Get {
        filename: filename.to_string(),
    })
    .await?;

    let (total_size, basename) = match recv_within(link, config.response_timeout).await? {
        None => return Err(TransferError::NoResponse(link.peer())),
        Some(Message::Error { reason, detail }) => return Err(TransferError::rejected(&reason, detail.as_deref())),
        Some(Message::Offer { size, basename }) => (size, basename),
        Some(other) => return Err(TransferError::Unexpected(other.to_string())),
    };

    let path = output.unwrap_or_else(|| default_output_path(&basename, filename));
    let file = File::create(&path).await?;
    tracing::info!("Receiving {} ({} bytes) into {}", basename, total_size, path.display());

    link.send(&Message::Ack(Ack::Start)).await?;

    let mut session = InboundSession::new(link.peer(), Direction::Download, BufWriter::new(file), total_size);
    loop {
        let message = recv_within(link, config.idle_timeout)
            .await?
            .ok_or(TransferError::Stalled(config.idle_timeout))?;

        match message {
            Message::Data { seq, payload } => {
                let receipt = session.accept_chunk(seq, &payload).await?;
                if let Some(reply) = receipt.reply(seq) {
                    link.send(&reply).await?;
                }
            }
            Message::Eof { next_seq } => {
                if next_seq != session.expected_seq() {
                    tracing::debug!(
                        "EOF|{} from {} while expecting chunk {}",
                        next_seq,
                        link.peer(),
                        session.expected_seq()
                    );
                }
                link.send(&Message::Ack(Ack::Eof)).await?;
                break;
            }
            other => tracing::debug!("Ignoring {} from {} during download", other, link.peer()),
        }
    }

    let received = session.received();
    let chunks = session.expected_seq();
    let complete = session.is_complete();
    session.finish().await?;

    if !complete {
        return Err(TransferError::Incomplete {
            expected: total_size,
            received,
        });
    }

    Ok(DownloadReport {
        path,
        bytes: received,
        chunks,
    })
}

/// `downloaded_<basename>` in the working directory
fn default_output_path(offered: &str, requested: &str) -> PathBuf {
    let name = sanitize_basename(offered)
        .or_else(|| sanitize_basename(requested))
        .unwrap_or_else(|| "file".to_string());
    PathBuf::from(format!("downloaded_{name}"))
}
