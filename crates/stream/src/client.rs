//! Stream Upload Client
//!
//! Sends one file per connection and waits for the server's `DONE`.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use stopwait::{Message, TransferError, sanitize_basename};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::DONE;
use crate::server::{read_line, write_line};

/// Result of a successful stream upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub name: String,
    pub bytes: u64,
}

/// Upload `path` over a single connection to `server`.
///
/// `reply_timeout` bounds the wait for `OK` and for `DONE`.
pub async fn upload_stream(
    server: SocketAddr,
    path: impl AsRef<Path>,
    reply_timeout: Duration,
) -> Result<StreamReport, TransferError> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .and_then(|n| sanitize_basename(&n.to_string_lossy()))
        .ok_or_else(|| TransferError::NotFound(path.display().to_string()))?;
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();

    let stream = TcpStream::connect(server).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_line(&mut writer, &Message::Put {
        filename: name.clone(),
        size,
    })
    .await?;

    let reply = timeout(reply_timeout, read_line(&mut reader))
        .await
        .map_err(|_| TransferError::NoResponse(server))??;
    match Message::decode(reply.as_bytes())? {
        Message::Accept => {}
        Message::Error { reason, detail } => return Err(TransferError::rejected(&reason, detail.as_deref())),
        other => return Err(TransferError::Unexpected(other.to_string())),
    }

    tracing::info!("Streaming {} ({} bytes) to {}", name, size, server);

    let sent = tokio::io::copy(&mut file, &mut writer).await?;
    writer.flush().await?;
    if sent != size {
        return Err(TransferError::Incomplete {
            expected: size,
            received: sent,
        });
    }

    let done = timeout(reply_timeout, read_line(&mut reader))
        .await
        .map_err(|_| TransferError::NoResponse(server))??;
    if done != DONE {
        return Err(TransferError::Unexpected(done));
    }

    Ok(StreamReport { name, bytes: sent })
}
