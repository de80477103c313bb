//! Transfer Sessions
//!
//! A session is the protocol state of one transfer. The receiving half
//! ([`InboundSession`]) and the sending half ([`OutboundSession`]) are shared
//! by the client and server state machines, so both directions get identical
//! sequence-number bookkeeping.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransferError;
use crate::protocol::{Ack, Message};
use crate::transfer::{Link, TransferConfig, send_and_await};

/// Lifecycle of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Negotiating,
    Active,
    Finalizing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Which way the bytes flow, seen from the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer to local
    Upload,
    /// Local to peer
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// What [`InboundSession::accept_chunk`] did with a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// In order; written to the sink. Acknowledge it.
    Accepted,
    /// Already written. Acknowledge again, write nothing.
    Duplicate,
    /// Beyond the next expected chunk. Ignore it.
    Ahead,
}

impl Receipt {
    /// The acknowledgment to send back for chunk `seq`, if any
    pub fn reply(self, seq: u64) -> Option<Message> {
        match self {
            Self::Accepted | Self::Duplicate => Some(Message::ack(seq)),
            Self::Ahead => None,
        }
    }
}

/// Receiving side of a transfer: writes in-order chunks to an owned sink
#[derive(Debug)]
pub struct InboundSession<W> {
    peer: SocketAddr,
    direction: Direction,
    sink: W,
    expected_seq: u64,
    total_size: u64,
    received: u64,
    status: SessionStatus,
}

impl<W: AsyncWrite + Unpin> InboundSession<W> {
    pub fn new(peer: SocketAddr, direction: Direction, sink: W, total_size: u64) -> Self {
        Self {
            peer,
            direction,
            sink,
            expected_seq: 0,
            total_size,
            received: 0,
            status: SessionStatus::Active,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn expected_seq(&self) -> u64 {
        self.expected_seq
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Declared bytes not yet received. Saturates at zero if the peer sent more.
    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.received)
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// At least the declared number of bytes has been written
    pub fn is_complete(&self) -> bool {
        self.received >= self.total_size
    }

    /// Whether `EOF|next_seq` may end this session
    pub fn accepts_eof(&self, next_seq: u64) -> bool {
        next_seq == self.expected_seq && self.remaining() == 0
    }

    /// Apply one `DAT` message. Only the next expected chunk is written.
    pub async fn accept_chunk(&mut self, seq: u64, payload: &[u8]) -> std::io::Result<Receipt> {
        if seq < self.expected_seq {
            tracing::debug!("Duplicate chunk {} from {}", seq, self.peer);
            return Ok(Receipt::Duplicate);
        }
        if seq > self.expected_seq {
            tracing::debug!(
                "Ignoring chunk {} from {} while expecting {}",
                seq,
                self.peer,
                self.expected_seq
            );
            return Ok(Receipt::Ahead);
        }

        if let Err(e) = self.sink.write_all(payload).await {
            self.status = SessionStatus::Failed;
            return Err(e);
        }
        self.received += payload.len() as u64;
        self.expected_seq += 1;
        Ok(Receipt::Accepted)
    }

    /// Flush the sink and hand it back
    pub async fn finish(mut self) -> std::io::Result<W> {
        self.status = SessionStatus::Finalizing;
        self.sink.flush().await?;
        self.status = SessionStatus::Completed;
        tracing::debug!(
            "{} from {} finished: {} bytes in {} chunks",
            self.direction,
            self.peer,
            self.received,
            self.expected_seq
        );
        Ok(self.sink)
    }
}

/// Totals of a completed outbound transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSummary {
    pub chunks: u64,
    pub bytes: u64,
}

/// Sending side of a transfer: streams a source as acknowledged chunks
#[derive(Debug)]
pub struct OutboundSession<R> {
    source: R,
    next_seq: u64,
    sent: u64,
    status: SessionStatus,
}

impl<R: AsyncRead + Unpin> OutboundSession<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            next_seq: 0,
            sent: 0,
            status: SessionStatus::Active,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Send every chunk, then `EOF`, each through [`send_and_await`].
    ///
    /// The first unacknowledged message fails the whole session.
    pub async fn run<L: Link>(&mut self, link: &mut L, config: &TransferConfig) -> Result<SendSummary, TransferError> {
        let result = self.send_all(link, config).await;
        self.status = match result {
            Ok(_) => SessionStatus::Completed,
            Err(_) => SessionStatus::Failed,
        };
        result
    }

    async fn send_all<L: Link>(&mut self, link: &mut L, config: &TransferConfig) -> Result<SendSummary, TransferError> {
        let mut buf = vec![0u8; config.chunk_size];

        loop {
            let n = read_chunk(&mut self.source, &mut buf).await?;
            if n == 0 {
                break;
            }

            let seq = self.next_seq;
            let data = Message::Data {
                seq,
                payload: buf[..n].to_vec(),
            };
            send_and_await(link, &data, &Message::ack(seq), config).await?;

            self.sent += n as u64;
            self.next_seq += 1;
        }

        self.status = SessionStatus::Finalizing;
        let eof = Message::Eof {
            next_seq: self.next_seq,
        };
        send_and_await(link, &eof, &Message::Ack(Ack::Eof), config).await?;

        Ok(SendSummary {
            chunks: self.next_seq,
            bytes: self.sent,
        })
    }
}

/// Fill `buf` from `source`, short only at end of input
async fn read_chunk<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
