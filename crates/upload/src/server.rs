//! Upload Server
//!
//! A single dispatch loop owns the socket and the [`UploadSlot`]. Replies go
//! out from the same loop, so the slot is never touched from anywhere else.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use stopwait::{MAX_DATAGRAM, Message};
use tokio::net::UdpSocket;
use tokio::time::timeout_at;

use crate::slot::UploadSlot;

pub const DEFAULT_PORT: u16 = 5007;
const SESSION_IDLE_TIMEOUT_SECS: u64 = 30;

/// Upload server configuration
#[derive(Debug, Clone)]
pub struct UploadServerConfig {
    pub bind_address: String,
    pub upload_directory: PathBuf,
    /// A session whose client stays silent this long is abandoned
    pub session_idle_timeout: Duration,
}

impl Default for UploadServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{DEFAULT_PORT}"),
            upload_directory: PathBuf::from("uploads"),
            session_idle_timeout: Duration::from_secs(SESSION_IDLE_TIMEOUT_SECS),
        }
    }
}

/// Accepts one upload at a time into a flat upload directory
pub struct UploadServer {
    config: UploadServerConfig,
    socket: Option<UdpSocket>,
}

impl UploadServer {
    pub fn new(config: UploadServerConfig) -> Self {
        Self { config, socket: None }
    }

    pub fn with_defaults() -> Self {
        Self::new(UploadServerConfig::default())
    }

    /// Create a server with a custom bind address and upload directory
    pub fn with_config(bind_address: String, upload_directory: PathBuf) -> Self {
        Self::new(UploadServerConfig {
            bind_address,
            upload_directory,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &UploadServerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut UploadServerConfig {
        &mut self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Create the upload directory, bind the socket and return the local address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        tokio::fs::create_dir_all(&self.config.upload_directory)
            .await
            .with_context(|| {
                format!(
                    "Failed to create upload directory {}",
                    self.config.upload_directory.display()
                )
            })?;

        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("Failed to bind upload server socket on {}", self.config.bind_address))?;
        let local_addr = socket.local_addr().context("Failed to get local address")?;

        tracing::info!(
            "Upload server listening on {}, saving to {}",
            local_addr,
            self.config.upload_directory.display()
        );

        self.socket = Some(socket);
        Ok(local_addr)
    }

    pub async fn run(&mut self) -> Result<()> {
        self.bind().await?;
        self.serve().await
    }

    /// Main dispatch loop
    pub async fn serve(&self) -> Result<()> {
        let socket = self.socket.as_ref().context("Server must be bound before serving")?;
        let mut slot = UploadSlot::new(&self.config.upload_directory, self.config.session_idle_timeout);
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = match slot.idle_deadline() {
                Some(deadline) => match timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                    Ok(received) => received,
                    Err(_) => {
                        slot.expire().await;
                        continue;
                    }
                },
                None => socket.recv_from(&mut buffer).await,
            };

            let (len, peer) = match received {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused) => {
                    continue;
                }
                Err(e) => return Err(e).context("Upload server receive failed"),
            };

            let decoded = Message::decode(&buffer[..len]);
            if let Some(reply) = slot.handle(peer, decoded).await
                && let Err(e) = socket.send_to(&reply.encode(), peer).await
            {
                tracing::debug!("Failed to send {} to {}: {}", reply, peer, e);
            }
        }
    }
}

/// Bind and run an upload server
pub async fn run_upload_server(config: UploadServerConfig) -> Result<()> {
    let mut server = UploadServer::new(config);
    server.run().await
}
