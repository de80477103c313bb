//! Download Server
//!
//! The dispatch loop owns the receive side of the socket. A `GET` from a new
//! peer spawns a session task; later datagrams from that peer are routed to the
//! session's inbox, so sessions never consume each other's datagrams.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use stopwait::{
    DecodeError, ErrorReason, MAX_DATAGRAM, Message, TransferConfig, TransferError, Verb, resolve_in_root,
    sanitize_basename,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::session::{ChannelLink, SESSION_INBOX, serve_session};

pub const DEFAULT_PORT: u16 = 5006;

/// Download server configuration
#[derive(Debug, Clone)]
pub struct DownloadServerConfig {
    pub bind_address: String,
    pub root_directory: PathBuf,
    pub transfer_config: TransferConfig,
}

impl Default for DownloadServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{DEFAULT_PORT}"),
            root_directory: PathBuf::from("."),
            transfer_config: TransferConfig::default(),
        }
    }
}

/// Serves files from a root directory, one concurrent session per peer
pub struct DownloadServer {
    config: DownloadServerConfig,
    socket: Option<Arc<UdpSocket>>,
}

impl DownloadServer {
    pub fn new(config: DownloadServerConfig) -> Self {
        Self { config, socket: None }
    }

    pub fn with_defaults() -> Self {
        Self::new(DownloadServerConfig::default())
    }

    /// Create a server with a custom bind address and serving root
    pub fn with_config(bind_address: String, root_directory: PathBuf) -> Self {
        Self::new(DownloadServerConfig {
            bind_address,
            root_directory,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &DownloadServerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut DownloadServerConfig {
        &mut self.config
    }

    /// The bound address, once [`DownloadServer::bind`] has run
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the server socket and return the actual local address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        self.config
            .transfer_config
            .validate()
            .context("Invalid transfer configuration")?;

        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind download server socket on {}", self.config.bind_address))?;
        let local_addr = socket.local_addr().context("Failed to get local address")?;

        tracing::info!(
            "Download server listening on {}, serving files from {}",
            local_addr,
            self.config.root_directory.display()
        );

        self.socket = Some(Arc::new(socket));
        Ok(local_addr)
    }

    /// Bind and run the main loop
    pub async fn run(&mut self) -> Result<()> {
        self.bind().await?;
        self.serve().await
    }

    /// Main dispatch loop
    pub async fn serve(&self) -> Result<()> {
        let socket = self.socket.clone().context("Server must be bound before serving")?;
        let mut sessions: HashMap<SocketAddr, mpsc::Sender<Message>> = HashMap::new();
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, peer) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused) => {
                    continue;
                }
                Err(e) => return Err(e).context("Download server receive failed"),
            };

            // Sessions drop their inbox when they end
            sessions.retain(|_, inbox| !inbox.is_closed());

            let decoded = Message::decode(&buffer[..len]);

            if let Some(inbox) = sessions.get(&peer) {
                match decoded {
                    Ok(message) => match inbox.try_send(message) {
                        Ok(()) => {}
                        Err(TrySendError::Full(message)) => {
                            tracing::debug!("Session inbox for {} full, dropping {}", peer, message);
                        }
                        Err(TrySendError::Closed(message)) => {
                            tracing::debug!("Session for {} already ended, dropping {}", peer, message);
                        }
                    },
                    Err(e) => tracing::debug!("Discarding undecodable datagram from {}: {}", peer, e),
                }
                continue;
            }

            if let Some(inbox) = self.handle_new_peer(&socket, peer, decoded) {
                sessions.insert(peer, inbox);
            }
        }
    }

    /// Handle a datagram from a peer with no live session.
    ///
    /// Returns the inbox of a newly spawned session.
    fn handle_new_peer(
        &self,
        socket: &Arc<UdpSocket>,
        peer: SocketAddr,
        decoded: Result<Message, DecodeError>,
    ) -> Option<mpsc::Sender<Message>> {
        let reply = match decoded {
            Ok(Message::Get { filename }) if resolve_in_root(&self.config.root_directory, &filename).is_none() => {
                tracing::info!("GET {} from {}: not found", filename, peer);
                TransferError::NotFound(sanitize_basename(&filename).unwrap_or_default()).to_wire()
            }
            Ok(Message::Get { filename }) => {
                tracing::info!("GET {} from {}", filename, peer);

                let (inbox, rx) = mpsc::channel(SESSION_INBOX);
                let link = ChannelLink::new(Arc::clone(socket), peer, rx);
                let root = self.config.root_directory.clone();
                let config = self.config.transfer_config.clone();
                tokio::spawn(serve_session(link, filename, root, config));
                return Some(inbox);
            }
            Err(e) if e.verb() == Some(Verb::Get) => {
                tracing::debug!("Bad GET from {}: {}", peer, e);
                Message::error(ErrorReason::BadHeader)
            }
            Ok(other) => {
                tracing::debug!("Unexpected {} from {} outside a session", other, peer);
                Message::error(ErrorReason::UnknownCommand)
            }
            Err(e) => {
                tracing::debug!("Undecodable datagram from {}: {}", peer, e);
                Message::error(ErrorReason::UnknownCommand)
            }
        };

        let socket = Arc::clone(socket);
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&reply.encode(), peer).await {
                tracing::debug!("Failed to send {} to {}: {}", reply, peer, e);
            }
        });
        None
    }
}

/// Bind and run a download server
pub async fn run_download_server(
    bind_address: String,
    root_directory: PathBuf,
    transfer_config: TransferConfig,
) -> Result<()> {
    let mut server = DownloadServer::new(DownloadServerConfig {
        bind_address,
        root_directory,
        transfer_config,
    });
    server.run().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;
    use tokio::time::timeout;

    use super::*;

    async fn start(root: PathBuf) -> SocketAddr {
        let mut server = DownloadServer::with_config("127.0.0.1:0".to_string(), root);
        let addr = server.bind().await.unwrap();
        tokio::spawn(async move { server.serve().await });
        addr
    }

    async fn request(server: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(payload, server).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_download_server_config_default() {
        let config = DownloadServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:5006");
        assert_eq!(config.root_directory, PathBuf::from("."));
    }

    #[test]
    fn test_download_server_creation() {
        let server = DownloadServer::with_config("127.0.0.1:9999".to_string(), PathBuf::from("/tmp/files"));
        assert_eq!(server.config().bind_address, "127.0.0.1:9999");
        assert_eq!(server.config().root_directory, PathBuf::from("/tmp/files"));
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let mut server = DownloadServer::with_config("127.0.0.1:0".to_string(), PathBuf::from("."));
        let addr = server.bind().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_get_missing_file() {
        let temp_dir = tempdir().unwrap();
        let addr = start(temp_dir.path().to_path_buf()).await;

        assert_eq!(request(addr, b"GET|missing.txt").await, b"ERR|NotFound|missing.txt");
    }

    #[tokio::test]
    async fn test_missing_file_opens_no_session() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("present.txt"), b"here").unwrap();
        let mut server = DownloadServer::with_config("127.0.0.1:0".to_string(), temp_dir.path().to_path_buf());
        let addr = server.bind().await.unwrap();
        let socket = server.socket.clone().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = client.local_addr().unwrap();
        let missing = Ok(Message::Get {
            filename: "sub/missing.txt".into(),
        });
        assert!(server.handle_new_peer(&socket, peer, missing).is_none());

        let mut buf = vec![0u8; 2048];
        let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, addr);
        assert_eq!(&buf[..n], b"ERR|NotFound|missing.txt");

        let present = Ok(Message::Get {
            filename: "present.txt".into(),
        });
        assert!(server.handle_new_peer(&socket, peer, present).is_some());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let temp_dir = tempdir().unwrap();
        let addr = start(temp_dir.path().to_path_buf()).await;

        assert_eq!(request(addr, b"HELLO").await, b"ERR|UnknownCommand");
        assert_eq!(request(addr, b"ACK|3").await, b"ERR|UnknownCommand");
        assert_eq!(request(addr, b"GET").await, b"ERR|BadHeader");
    }

    #[tokio::test]
    async fn test_get_offers_size_and_basename() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"twelve bytes").unwrap();
        let addr = start(temp_dir.path().to_path_buf()).await;

        assert_eq!(request(addr, b"GET|notes.txt").await, b"OK|12|notes.txt");
    }
}
