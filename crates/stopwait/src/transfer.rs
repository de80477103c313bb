//! Stop-and-Wait Transfer Primitives
//!
//! This module holds the transfer configuration, the [`Link`] abstraction over
//! "one peer on a datagram transport", and [`send_and_await`], the retry loop
//! every sender is built on.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout, timeout_at};

use crate::error::{ConfigError, TransferError};
use crate::protocol::{MAX_DATAGRAM, Message, data_datagram_len};

const CHUNK_SIZE: usize = 1024;
const ACK_TIMEOUT_MS: u64 = 1000;
const MAX_RETRIES: usize = 10;
const RESPONSE_TIMEOUT_SECS: u64 = 3;
const IDLE_TIMEOUT_SECS: u64 = 5;

/// Timing and sizing knobs shared by every state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Raw bytes per `DAT` message, before encoding
    pub chunk_size: usize,
    /// How long a sender waits for each acknowledgment before resending
    pub ack_timeout: Duration,
    /// Total send attempts per message
    pub max_retries: usize,
    /// How long a requester waits for `OK`/`ERR`, and a server for `ACK|START`
    pub response_timeout: Duration,
    /// How long a receiver waits between datagrams before giving up
    pub idle_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            ack_timeout: Duration::from_millis(ACK_TIMEOUT_MS),
            max_retries: MAX_RETRIES,
            response_timeout: Duration::from_secs(RESPONSE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
        }
    }
}

impl TransferConfig {
    /// Check that the settings describe a usable transfer
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        match data_datagram_len(self.chunk_size) {
            Some(len) if len <= MAX_DATAGRAM => {}
            _ => return Err(ConfigError::ChunkTooLarge(self.chunk_size)),
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        if self.ack_timeout.is_zero() || self.response_timeout.is_zero() || self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// One peer reachable over a datagram transport.
///
/// `recv` only ever yields decoded messages from [`Link::peer`]; filtering and
/// decoding happen below this trait.
pub trait Link {
    fn peer(&self) -> SocketAddr;

    fn send(&self, message: &Message) -> impl Future<Output = io::Result<()>> + Send;

    fn recv(&mut self) -> impl Future<Output = io::Result<Message>> + Send;
}

/// A [`Link`] that owns its socket, as clients do
#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpLink {
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    /// Bind an ephemeral socket of the peer's address family
    pub async fn connect(peer: SocketAddr) -> io::Result<Self> {
        let socket = create_ephemeral_socket(peer, None).await?;
        Ok(Self::new(socket, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Link for UdpLink {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn send(&self, message: &Message) -> io::Result<()> {
        self.socket.send_to(&message.encode(), self.peer).await?;
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<Message> {
        recv_from_peer(&self.socket, self.peer).await
    }
}

/// Bind an ephemeral UDP socket appropriate for the peer's address family
pub async fn create_ephemeral_socket(peer: SocketAddr, local_bind: Option<IpAddr>) -> io::Result<UdpSocket> {
    let bind_addr: SocketAddr = match (local_bind, peer) {
        (Some(ip), _) => SocketAddr::new(ip, 0),
        (None, SocketAddr::V4(_)) => SocketAddr::from(([0, 0, 0, 0], 0)),
        (None, SocketAddr::V6(_)) => SocketAddr::from(([0u16; 8], 0)),
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    tracing::debug!("Transfer socket bound to {}", socket.local_addr()?);
    Ok(socket)
}

/// Receive the next decodable message from `peer`, ignoring everything else
pub async fn recv_from_peer(socket: &UdpSocket, peer: SocketAddr) -> io::Result<Message> {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            // ICMP unreachable from an earlier send surfaces here on some platforms
            Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused) => {
                continue;
            }
            Err(e) => return Err(e),
        };

        if src != peer {
            tracing::trace!("Ignoring datagram from {} while talking to {}", src, peer);
            continue;
        }

        match Message::decode(&buf[..n]) {
            Ok(message) => return Ok(message),
            Err(e) => tracing::debug!("Discarding undecodable datagram from {}: {}", src, e),
        }
    }
}

/// Wait up to `wait` for the first message from the link's peer
pub async fn recv_within<L: Link>(link: &mut L, wait: Duration) -> Result<Option<Message>, TransferError> {
    match timeout(wait, link.recv()).await {
        Ok(Ok(message)) => Ok(Some(message)),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Ok(None),
    }
}

/// Send `message` and wait for exactly `expected`, resending on timeout.
///
/// Other messages that arrive while waiting are discarded without consuming an
/// attempt. After `max_retries` unanswered attempts the transfer is aborted.
pub async fn send_and_await<L: Link>(
    link: &mut L,
    message: &Message,
    expected: &Message,
    config: &TransferConfig,
) -> Result<(), TransferError> {
    let attempts = config.max_retries.max(1);

    for attempt in 1..=attempts {
        link.send(message).await?;
        let deadline = Instant::now() + config.ack_timeout;

        loop {
            match timeout_at(deadline, link.recv()).await {
                Ok(Ok(reply)) if reply == *expected => return Ok(()),
                Ok(Ok(other)) => {
                    tracing::debug!("Discarding {} from {} while waiting for {}", other, link.peer(), expected);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        if attempt < attempts {
            tracing::debug!(
                "No {} from {} (attempt {}/{}), resending {}",
                expected,
                link.peer(),
                attempt,
                attempts,
                message
            );
        }
    }

    Err(TransferError::Timeout {
        waiting_for: expected.to_string(),
        attempts,
    })
}
