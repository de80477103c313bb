//! Server Download Sessions
//!
//! One session per accepted `GET`. Sessions share the server socket for
//! sending and receive only their own peer's datagrams through an inbox fed by
//! the dispatch loop.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stopwait::{
    Ack, Link, Message, OutboundSession, SendSummary, TransferConfig, TransferError, resolve_in_root,
    sanitize_basename,
};
use tokio::fs::File;
use tokio::io::BufReader;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

/// Messages a session may have queued before it drains them
pub const SESSION_INBOX: usize = 64;

/// A [`Link`] over the shared server socket
#[derive(Debug)]
pub struct ChannelLink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbox: mpsc::Receiver<Message>,
}

impl ChannelLink {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, inbox: mpsc::Receiver<Message>) -> Self {
        Self { socket, peer, inbox }
    }
}

impl Link for ChannelLink {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn send(&self, message: &Message) -> io::Result<()> {
        self.socket.send_to(&message.encode(), self.peer).await?;
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<Message> {
        self.inbox
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "session inbox closed"))
    }
}

/// How a download session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Every chunk and the `EOF` were acknowledged.
    Completed(SendSummary),
    /// The client never signalled `ACK|START`.
    Abandoned,
}

/// Serve one `GET` to the link's peer.
///
/// Missing files, non-files and names escaping `root` are all answered with
/// `ERR|NotFound|<basename>`.
pub async fn handle_get_request<L: Link>(
    link: &mut L,
    filename: &str,
    root: &Path,
    config: &TransferConfig,
) -> Result<SessionEnd, TransferError> {
    let requested = sanitize_basename(filename).unwrap_or_default();

    let Some(path) = resolve_in_root(root, filename) else {
        let err = TransferError::NotFound(requested);
        link.send(&err.to_wire()).await?;
        return Err(err);
    };

    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            let err = TransferError::Io(e);
            link.send(&err.to_wire()).await?;
            return Err(err);
        }
    };
    let size = file.metadata().await?.len();
    let basename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or(requested);

    link.send(&Message::Offer { size, basename }).await?;

    if !await_start(link, config.response_timeout).await? {
        tracing::debug!("No ACK|START from {}, abandoning {}", link.peer(), filename);
        return Ok(SessionEnd::Abandoned);
    }

    let mut session = OutboundSession::new(BufReader::new(file));
    let summary = session.run(link, config).await?;
    Ok(SessionEnd::Completed(summary))
}

/// Wait once for the client's readiness signal
async fn await_start<L: Link>(link: &mut L, wait: Duration) -> Result<bool, TransferError> {
    let deadline = Instant::now() + wait;

    loop {
        match timeout_at(deadline, link.recv()).await {
            Ok(Ok(Message::Ack(Ack::Start))) => return Ok(true),
            Ok(Ok(other)) => tracing::debug!("Discarding {} from {} before ACK|START", other, link.peer()),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(false),
        }
    }
}

/// Run a session to completion and log how it ended
pub async fn serve_session(mut link: ChannelLink, filename: String, root: impl AsRef<Path>, config: TransferConfig) {
    let peer = link.peer();

    match handle_get_request(&mut link, &filename, root.as_ref(), &config).await {
        Ok(SessionEnd::Completed(summary)) => {
            tracing::info!(
                "Sent {} ({} bytes, {} chunks) to {}",
                filename,
                summary.bytes,
                summary.chunks,
                peer
            );
        }
        Ok(SessionEnd::Abandoned) => {
            tracing::info!("Download of {} abandoned by {}", filename, peer);
        }
        Err(TransferError::NotFound(_)) => {
            tracing::info!("GET {} from {}: not found", filename, peer);
        }
        Err(e) => {
            tracing::warn!("Transfer of {} to {} aborted: {}", filename, peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    struct Harness {
        link: ChannelLink,
        inbox: mpsc::Sender<Message>,
        client: UdpSocket,
    }

    async fn harness() -> Harness {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (inbox, rx) = mpsc::channel(SESSION_INBOX);
        let link = ChannelLink::new(server, client.local_addr().unwrap(), rx);
        Harness { link, inbox, client }
    }

    async fn next_message(socket: &UdpSocket) -> Message {
        let mut buf = vec![0u8; 4096];
        let (n, _) = socket.recv_from(&mut buf).await.unwrap();
        Message::decode(&buf[..n]).unwrap()
    }

    fn fast_config() -> TransferConfig {
        TransferConfig {
            chunk_size: 4,
            ack_timeout: Duration::from_millis(50),
            max_retries: 3,
            response_timeout: Duration::from_millis(100),
            ..TransferConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let temp_dir = tempdir().unwrap();
        let mut h = harness().await;

        let result = handle_get_request(&mut h.link, "missing.txt", temp_dir.path(), &fast_config()).await;
        assert!(matches!(result, Err(TransferError::NotFound(ref name)) if name == "missing.txt"));
        assert_eq!(
            next_message(&h.client).await,
            Message::error_with_detail(stopwait::ErrorReason::NotFound, "missing.txt")
        );
    }

    #[tokio::test]
    async fn test_traversal_is_not_found() {
        let temp_dir = tempdir().unwrap();
        let mut h = harness().await;

        let result = handle_get_request(&mut h.link, "../../etc/passwd", temp_dir.path(), &fast_config()).await;
        assert!(matches!(result, Err(TransferError::NotFound(_))));
        assert_eq!(next_message(&h.client).await.encode(), b"ERR|NotFound|passwd");
    }

    #[tokio::test]
    async fn test_abandoned_without_start() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), b"hello").unwrap();
        let mut h = harness().await;

        let result = handle_get_request(&mut h.link, "a.txt", temp_dir.path(), &fast_config()).await;
        assert_eq!(result.unwrap(), SessionEnd::Abandoned);
        assert_eq!(
            next_message(&h.client).await,
            Message::Offer {
                size: 5,
                basename: "a.txt".into()
            }
        );
    }

    #[tokio::test]
    async fn test_streams_file_after_start() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), b"hello").unwrap();
        let mut h = harness().await;
        let root = temp_dir.path().to_path_buf();

        let inbox = h.inbox.clone();
        inbox.send(Message::Ack(Ack::Start)).await.unwrap();
        let client = h.client;
        let peer_side = tokio::spawn(async move {
            let mut received = Vec::new();
            loop {
                match next_message(&client).await {
                    Message::Offer { .. } => {}
                    Message::Data { seq, payload } => {
                        received.extend_from_slice(&payload);
                        inbox.send(Message::ack(seq)).await.unwrap();
                    }
                    Message::Eof { next_seq } => {
                        inbox.send(Message::Ack(Ack::Eof)).await.unwrap();
                        return (received, next_seq);
                    }
                    other => panic!("unexpected {other}"),
                }
            }
        });

        let result = handle_get_request(&mut h.link, "a.txt", &root, &fast_config()).await.unwrap();
        assert_eq!(result, SessionEnd::Completed(SendSummary { chunks: 2, bytes: 5 }));

        let (received, next_seq) = peer_side.await.unwrap();
        assert_eq!(received, b"hello");
        assert_eq!(next_seq, 2);
    }
}
