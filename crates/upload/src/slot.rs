//! Upload Slot
//!
//! The server accepts one upload at a time. [`UploadSlot`] is that single slot:
//! `idle → receiving → idle`. It is owned by the dispatch loop and mutated only
//! there, one datagram at a time, so it needs no locking.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use stopwait::{
    Ack, DecodeError, Direction, InboundSession, Message, TransferError, Verb, sanitize_basename,
};
use tokio::fs::File;
use tokio::io::BufWriter;
use tokio::time::Instant;

/// An upload in progress
#[derive(Debug)]
struct UploadSession {
    inbound: InboundSession<BufWriter<File>>,
    path: PathBuf,
    last_activity: Instant,
}

/// The single upload slot of a server process
#[derive(Debug)]
pub struct UploadSlot {
    upload_dir: PathBuf,
    idle_timeout: Duration,
    session: Option<UploadSession>,
    /// Peer and final seq of the last completed upload, to re-acknowledge a
    /// retransmitted `EOF` whose `ACK|EOF` was lost.
    last_completed: Option<(SocketAddr, u64)>,
}

impl UploadSlot {
    pub fn new(upload_dir: impl Into<PathBuf>, idle_timeout: Duration) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            idle_timeout,
            session: None,
            last_completed: None,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn is_idle(&self) -> bool {
        self.session.is_none()
    }

    /// Peer owning the active session
    pub fn client(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(|s| s.inbound.peer())
    }

    /// Next sequence number the active session accepts
    pub fn expected_seq(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.inbound.expected_seq())
    }

    /// Declared bytes the active session is still waiting for
    pub fn remaining(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.inbound.remaining())
    }

    /// When the active session will be abandoned if its client stays silent
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.session.as_ref().map(|s| s.last_activity + self.idle_timeout)
    }

    /// Abandon the active session: close the sink and return to idle
    pub async fn expire(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::warn!(
                "Upload of {} from {} idle for {:?}, abandoning after {} of {} bytes",
                session.path.display(),
                session.inbound.peer(),
                self.idle_timeout,
                session.inbound.received(),
                session.inbound.total_size()
            );
            if let Err(e) = session.inbound.finish().await {
                tracing::warn!("Failed to close {}: {}", session.path.display(), e);
            }
        }
    }

    /// Apply one datagram and return the reply to send, if any
    pub async fn handle(&mut self, from: SocketAddr, decoded: Result<Message, DecodeError>) -> Option<Message> {
        let message = match decoded {
            Ok(message) => message,
            Err(e) if e.verb() == Some(Verb::Put) => {
                if self.session.is_some() {
                    return Some(TransferError::Busy.to_wire());
                }
                tracing::debug!("Bad PUT header from {}: {}", from, e);
                return Some(TransferError::Protocol(e).to_wire());
            }
            Err(e) => {
                tracing::debug!("Undecodable datagram from {}: {}", from, e);
                return match self.client() {
                    Some(client) if client == from => None,
                    _ => Some(TransferError::SessionMismatch(from).to_wire()),
                };
            }
        };

        if let Message::Put { filename, size } = message {
            if self.session.is_some() {
                tracing::debug!("Rejecting PUT {} from {}: busy", filename, from);
                return Some(TransferError::Busy.to_wire());
            }
            return Some(self.open(from, &filename, size).await);
        }

        let Some(session) = self.session.as_mut() else {
            if let (Message::Eof { next_seq }, Some((peer, last_seq))) = (&message, self.last_completed)
                && peer == from
                && *next_seq == last_seq
            {
                return Some(Message::Ack(Ack::Eof));
            }
            return Some(TransferError::SessionMismatch(from).to_wire());
        };

        if session.inbound.peer() != from {
            return Some(TransferError::SessionMismatch(from).to_wire());
        }
        session.last_activity = Instant::now();

        match message {
            Message::Data { seq, payload } => match session.inbound.accept_chunk(seq, &payload).await {
                Ok(receipt) => receipt.reply(seq),
                Err(e) => {
                    tracing::warn!("Write to {} failed: {}", session.path.display(), e);
                    let reply = TransferError::Io(e).to_wire();
                    self.session = None;
                    Some(reply)
                }
            },
            Message::Eof { next_seq } => {
                if !session.inbound.accepts_eof(next_seq) {
                    tracing::debug!(
                        "Not accepting EOF|{} from {}: expecting seq {}, {} bytes remaining",
                        next_seq,
                        from,
                        session.inbound.expected_seq(),
                        session.inbound.remaining()
                    );
                    return None;
                }
                self.complete(from, next_seq).await
            }
            other => {
                tracing::debug!("Ignoring {} from {} during upload", other, from);
                None
            }
        }
    }

    async fn open(&mut self, from: SocketAddr, filename: &str, size: u64) -> Message {
        let Some(name) = sanitize_basename(filename) else {
            tracing::debug!("Rejecting PUT with unusable name {:?} from {}", filename, from);
            return Message::error(stopwait::ErrorReason::BadHeader);
        };
        let path = self.upload_dir.join(&name);

        let file = match File::create(&path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Cannot create {}: {}", path.display(), e);
                return TransferError::Io(e).to_wire();
            }
        };

        tracing::info!("Receiving {} ({} bytes) from {}", name, size, from);
        self.session = Some(UploadSession {
            inbound: InboundSession::new(from, Direction::Upload, BufWriter::new(file), size),
            path,
            last_activity: Instant::now(),
        });
        self.last_completed = None;
        Message::Accept
    }

    async fn complete(&mut self, from: SocketAddr, next_seq: u64) -> Option<Message> {
        let session = self.session.take()?;
        let received = session.inbound.received();

        match session.inbound.finish().await {
            Ok(_) => {
                tracing::info!("Saved {} ({} bytes) from {}", session.path.display(), received, from);
                self.last_completed = Some((from, next_seq));
                Some(Message::Ack(Ack::Eof))
            }
            Err(e) => {
                tracing::warn!("Failed to finish {}: {}", session.path.display(), e);
                Some(TransferError::Io(e).to_wire())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn parse(text: &str) -> Result<Message, DecodeError> {
        text.parse()
    }

    async fn feed(slot: &mut UploadSlot, from: SocketAddr, text: &str) -> Option<String> {
        slot.handle(from, parse(text))
            .await
            .map(|reply| String::from_utf8(reply.encode()).unwrap())
    }

    fn data(seq: u64, bytes: &[u8]) -> String {
        String::from_utf8(
            Message::Data {
                seq,
                payload: bytes.to_vec(),
            }
            .encode(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_empty_upload() {
        let dir = tempdir().unwrap();
        let mut slot = UploadSlot::new(dir.path(), Duration::from_secs(30));
        let client = addr(40000);

        assert_eq!(feed(&mut slot, client, "PUT|f|0").await.as_deref(), Some("OK"));
        assert_eq!(feed(&mut slot, client, "EOF|0").await.as_deref(), Some("ACK|EOF"));
        assert!(slot.is_idle());
        assert_eq!(std::fs::metadata(dir.path().join("f")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_chunks_duplicates_and_gaps() {
        let dir = tempdir().unwrap();
        let mut slot = UploadSlot::new(dir.path(), Duration::from_secs(30));
        let client = addr(40001);

        assert_eq!(feed(&mut slot, client, "PUT|data.bin|6").await.as_deref(), Some("OK"));
        assert_eq!(feed(&mut slot, client, &data(0, b"abc")).await.as_deref(), Some("ACK|0"));

        // Duplicate: re-acknowledged, not rewritten
        assert_eq!(feed(&mut slot, client, &data(0, b"abc")).await.as_deref(), Some("ACK|0"));
        assert_eq!(slot.remaining(), Some(3));

        // Ahead of expected: ignored, no progress
        assert_eq!(feed(&mut slot, client, &data(2, b"zzz")).await, None);
        assert_eq!(slot.expected_seq(), Some(1));

        // EOF before all bytes arrived is ignored
        assert_eq!(feed(&mut slot, client, "EOF|1").await, None);

        assert_eq!(feed(&mut slot, client, &data(1, b"def")).await.as_deref(), Some("ACK|1"));
        assert_eq!(feed(&mut slot, client, "EOF|2").await.as_deref(), Some("ACK|EOF"));

        assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_second_put_is_busy() {
        let dir = tempdir().unwrap();
        let mut slot = UploadSlot::new(dir.path(), Duration::from_secs(30));
        let first = addr(40002);
        let second = addr(40003);

        feed(&mut slot, first, "PUT|one|3").await;
        feed(&mut slot, first, &data(0, b"ab")).await;

        assert_eq!(feed(&mut slot, second, "PUT|two|3").await.as_deref(), Some("ERR|Busy"));
        assert_eq!(feed(&mut slot, first, "PUT|again|3").await.as_deref(), Some("ERR|Busy"));
        assert_eq!(feed(&mut slot, second, "PUT|bad").await.as_deref(), Some("ERR|Busy"));

        assert_eq!(slot.client(), Some(first));
        assert_eq!(slot.expected_seq(), Some(1));
        assert_eq!(slot.remaining(), Some(1));
        assert!(!dir.path().join("two").exists());
    }

    #[tokio::test]
    async fn test_cross_talk_gets_no_session() {
        let dir = tempdir().unwrap();
        let mut slot = UploadSlot::new(dir.path(), Duration::from_secs(30));
        let owner = addr(40004);
        let other = addr(40005);

        assert_eq!(feed(&mut slot, other, &data(0, b"x")).await.as_deref(), Some("ERR|NoSession"));

        feed(&mut slot, owner, "PUT|f|1").await;
        assert_eq!(feed(&mut slot, other, &data(0, b"x")).await.as_deref(), Some("ERR|NoSession"));
        assert_eq!(feed(&mut slot, other, "EOF|1").await.as_deref(), Some("ERR|NoSession"));
        assert_eq!(slot.expected_seq(), Some(0));
    }

    #[tokio::test]
    async fn test_bad_headers() {
        let dir = tempdir().unwrap();
        let mut slot = UploadSlot::new(dir.path(), Duration::from_secs(30));
        let client = addr(40006);

        assert_eq!(feed(&mut slot, client, "PUT|f|lots").await.as_deref(), Some("ERR|BadHeader"));
        assert_eq!(feed(&mut slot, client, "PUT|..|3").await.as_deref(), Some("ERR|BadHeader"));
        assert!(slot.is_idle());

        // Directory components are stripped
        assert_eq!(feed(&mut slot, client, "PUT|../../escape.txt|0").await.as_deref(), Some("OK"));
        feed(&mut slot, client, "EOF|0").await;
        assert!(dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_malformed_chunk_gets_no_ack() {
        let dir = tempdir().unwrap();
        let mut slot = UploadSlot::new(dir.path(), Duration::from_secs(30));
        let client = addr(40007);

        feed(&mut slot, client, "PUT|f|3").await;
        assert_eq!(feed(&mut slot, client, "DAT|0|%%%").await, None);
        assert_eq!(slot.expected_seq(), Some(0));
    }

    #[tokio::test]
    async fn test_open_failure_reports_kind() {
        let dir = tempdir().unwrap();
        let mut slot = UploadSlot::new(dir.path().join("does-not-exist"), Duration::from_secs(30));

        assert_eq!(feed(&mut slot, addr(40008), "PUT|f|3").await.as_deref(), Some("ERR|NotFound"));
        assert!(slot.is_idle());
    }

    #[tokio::test]
    async fn test_retransmitted_eof_is_reacknowledged() {
        let dir = tempdir().unwrap();
        let mut slot = UploadSlot::new(dir.path(), Duration::from_secs(30));
        let client = addr(40009);

        feed(&mut slot, client, "PUT|f|1").await;
        feed(&mut slot, client, &data(0, b"x")).await;
        assert_eq!(feed(&mut slot, client, "EOF|1").await.as_deref(), Some("ACK|EOF"));
        assert_eq!(feed(&mut slot, client, "EOF|1").await.as_deref(), Some("ACK|EOF"));
        assert_eq!(feed(&mut slot, addr(40010), "EOF|1").await.as_deref(), Some("ERR|NoSession"));
    }

    #[tokio::test]
    async fn test_expire_returns_to_idle() {
        let dir = tempdir().unwrap();
        let mut slot = UploadSlot::new(dir.path(), Duration::from_millis(10));
        let client = addr(40011);

        feed(&mut slot, client, "PUT|f|10").await;
        assert!(slot.idle_deadline().is_some());

        slot.expire().await;
        assert!(slot.is_idle());
        assert!(slot.idle_deadline().is_none());
        assert_eq!(feed(&mut slot, addr(40012), "PUT|g|0").await.as_deref(), Some("OK"));
    }
}
