//! Stream Upload Server
//!
//! One task per accepted connection. Each connection carries exactly one file.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use stopwait::{ErrorReason, Message, TransferError, io_reason, sanitize_basename};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, lookup_host};
use tokio::time::timeout;

use crate::{DONE, MAX_LINE};

pub const DEFAULT_PORT: u16 = 6007;
const LISTEN_BACKLOG: i32 = 128;
const IDLE_TIMEOUT_SECS: u64 = 30;
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Stream upload server configuration
#[derive(Debug, Clone)]
pub struct StreamServerConfig {
    pub bind_address: String,
    pub upload_directory: PathBuf,
    /// A connection that sends nothing for this long is dropped
    pub idle_timeout: Duration,
}

impl Default for StreamServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{DEFAULT_PORT}"),
            upload_directory: PathBuf::from("uploads"),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
        }
    }
}

/// A file stored from one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub bytes: u64,
}

pub struct StreamServer {
    config: StreamServerConfig,
    listener: Option<TcpListener>,
}

impl StreamServer {
    pub fn new(config: StreamServerConfig) -> Self {
        Self { config, listener: None }
    }

    pub fn with_defaults() -> Self {
        Self::new(StreamServerConfig::default())
    }

    pub fn config(&self) -> &StreamServerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Create the upload directory and start listening
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        tokio::fs::create_dir_all(&self.config.upload_directory)
            .await
            .with_context(|| {
                format!(
                    "Failed to create upload directory {}",
                    self.config.upload_directory.display()
                )
            })?;

        let addr = lookup_host(&self.config.bind_address)
            .await
            .with_context(|| format!("Invalid bind address {}", self.config.bind_address))?
            .next()
            .with_context(|| format!("Bind address {} did not resolve", self.config.bind_address))?;

        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr().context("Failed to get local address")?;

        tracing::info!(
            "Stream upload server listening on {}, saving to {}",
            local_addr,
            self.config.upload_directory.display()
        );

        self.listener = Some(listener);
        Ok(local_addr)
    }

    pub async fn run(&mut self) -> Result<()> {
        self.bind().await?;
        self.serve().await
    }

    /// Accept loop
    pub async fn serve(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server must be bound before serving")?;

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let upload_dir = self.config.upload_directory.clone();
            let idle_timeout = self.config.idle_timeout;
            tokio::spawn(async move {
                match handle_connection(stream, &upload_dir, idle_timeout).await {
                    Ok(stored) => tracing::info!(
                        "Stored {} ({} bytes) from {}",
                        stored.path.display(),
                        stored.bytes,
                        peer
                    ),
                    Err(e) => tracing::warn!("Stream upload from {} failed: {}", peer, e),
                }
            });
        }
    }
}

/// Bind and run a stream upload server
pub async fn run_stream_server(config: StreamServerConfig) -> Result<()> {
    let mut server = StreamServer::new(config);
    server.run().await
}

fn create_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create listener socket")?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind stream server socket on {addr}"))?;
    socket.listen(LISTEN_BACKLOG).context("Failed to listen")?;

    let std_listener: StdTcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Serve one connection: header, reply, body, `DONE`.
///
/// Every read waits at most `idle_timeout`; a silent peer fails with
/// [`TransferError::Stalled`].
pub async fn handle_connection<S>(
    stream: S,
    upload_dir: &Path,
    idle_timeout: Duration,
) -> Result<StoredFile, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let line = timeout(idle_timeout, read_line(&mut reader))
        .await
        .map_err(|_| TransferError::Stalled(idle_timeout))??;
    let (filename, size) = match Message::decode(line.as_bytes()) {
        Ok(Message::Put { filename, size }) => (filename, size),
        Ok(other) => {
            write_line(&mut writer, &Message::error(ErrorReason::UnknownCommand)).await?;
            return Err(TransferError::Unexpected(other.to_string()));
        }
        Err(e) => {
            write_line(&mut writer, &Message::error(ErrorReason::BadHeader)).await?;
            return Err(e.into());
        }
    };

    let Some(name) = sanitize_basename(&filename) else {
        write_line(&mut writer, &Message::error(ErrorReason::BadHeader)).await?;
        return Err(TransferError::Unexpected(format!("unusable file name {filename:?}")));
    };

    let path = upload_dir.join(&name);
    let file = match File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            write_line(&mut writer, &Message::error(io_reason(&e))).await?;
            return Err(e.into());
        }
    };
    write_line(&mut writer, &Message::Accept).await?;

    let mut sink = BufWriter::new(file);
    let received = copy_body(&mut reader, &mut sink, size, idle_timeout).await?;

    if received < size {
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        if let Err(e) = write_line(&mut writer, &Message::error(io_reason(&eof))).await {
            tracing::debug!("Could not report short body: {}", e);
        }
        return Err(TransferError::Incomplete { expected: size, received });
    }

    writer.write_all(format!("{DONE}\n").as_bytes()).await?;
    writer.shutdown().await?;

    Ok(StoredFile { path, bytes: received })
}

/// Copy up to `size` bytes, giving up when a single read waits `idle_timeout`
async fn copy_body<R, W>(reader: &mut R, sink: &mut W, size: u64, idle_timeout: Duration) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut received = 0u64;

    while received < size {
        let want = buf.len().min(usize::try_from(size - received).unwrap_or(usize::MAX));
        let n = timeout(idle_timeout, reader.read(&mut buf[..want]))
            .await
            .map_err(|_| TransferError::Stalled(idle_timeout))??;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).await?;
        received += n as u64;
    }

    sink.flush().await?;
    Ok(received)
}

/// Read one `\n`-terminated line, without its terminator
pub(crate) async fn read_line<R>(reader: &mut R) -> io::Result<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.take(MAX_LINE).read_line(&mut line).await?;
    if n == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

pub(crate) async fn write_line<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut wire = message.encode();
    wire.push(b'\n');
    writer.write_all(&wire).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use tokio::io::duplex;

    use super::*;

    async fn drive(request: &[u8], upload_dir: &Path) -> (Result<StoredFile, TransferError>, String) {
        let (client, server) = duplex(64 * 1024);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(request).await.unwrap();
        client_write.shutdown().await.unwrap();

        let result = handle_connection(server, upload_dir, Duration::from_secs(2)).await;
        let mut reply = String::new();
        client_read.read_to_string(&mut reply).await.unwrap();
        (result, reply)
    }

    #[tokio::test]
    async fn test_stores_exact_body() {
        let temp_dir = tempdir().unwrap();
        let (result, reply) = drive(b"PUT|notes.txt|5\nhello", temp_dir.path()).await;

        let stored = result.unwrap();
        assert_eq!(stored.bytes, 5);
        assert_eq!(reply, "OK\nDONE\n");
        assert_eq!(std::fs::read(temp_dir.path().join("notes.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_directory_components_are_stripped() {
        let temp_dir = tempdir().unwrap();
        let (result, _) = drive(b"PUT|../../etc/evil|2\nhi", temp_dir.path()).await;

        assert_eq!(result.unwrap().path, temp_dir.path().join("evil"));
        assert!(temp_dir.path().join("evil").is_file());
    }

    #[tokio::test]
    async fn test_short_body_reports_eof() {
        let temp_dir = tempdir().unwrap();
        let (result, reply) = drive(b"PUT|a.bin|10\nabc", temp_dir.path()).await;

        assert!(matches!(
            result,
            Err(TransferError::Incomplete {
                expected: 10,
                received: 3
            })
        ));
        assert_eq!(reply, "OK\nERR|UnexpectedEof\n");
    }

    #[tokio::test]
    async fn test_bad_header() {
        let temp_dir = tempdir().unwrap();
        let (result, reply) = drive(b"PUT|a.bin|lots\n", temp_dir.path()).await;
        assert!(matches!(result, Err(TransferError::Protocol(_))));
        assert_eq!(reply, "ERR|BadHeader\n");

        let (result, reply) = drive(b"GET|a.bin\n", temp_dir.path()).await;
        assert!(matches!(result, Err(TransferError::Unexpected(_))));
        assert_eq!(reply, "ERR|UnknownCommand\n");
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_before_header() {
        let temp_dir = tempdir().unwrap();
        let (_client, server) = duplex(1024);

        let result = handle_connection(server, temp_dir.path(), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(TransferError::Stalled(d)) if d == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let temp_dir = tempdir().unwrap();
        let (client, server) = duplex(1024);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"PUT|slow.bin|10\nabc").await.unwrap();

        let result = handle_connection(server, temp_dir.path(), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(TransferError::Stalled(_))));

        let mut reply = vec![0u8; 3];
        client_read.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"OK\n");
        drop(client_write);
    }

    #[tokio::test]
    async fn test_bind_sets_up_listener() {
        let temp_dir = tempdir().unwrap();
        let uploads = temp_dir.path().join("uploads");
        let mut server = StreamServer::new(StreamServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            upload_directory: uploads.clone(),
            ..StreamServerConfig::default()
        });

        assert!(server.local_addr().is_none());
        let addr = server.bind().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert!(uploads.is_dir());
    }
}
