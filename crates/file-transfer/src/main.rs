//! File Transfer Server - Main executable
//!
//! Runs the UDP download service, the UDP upload service and the TCP stream
//! upload service side by side.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use download::run_download_server;
use file_transfer::util::{get_interface_ip, service_address};
use nix::net::if_::if_nametoindex;
use stopwait::TransferConfig;
use stream::{StreamServerConfig, run_stream_server};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use upload::{UploadServerConfig, run_upload_server};

const DEFAULT_DOWNLOAD_BIND: &str = "0.0.0.0:5006";
const DEFAULT_UPLOAD_BIND: &str = "0.0.0.0:5007";
const DEFAULT_STREAM_BIND: &str = "0.0.0.0:6007";
const DEFAULT_ROOT: &str = ".";
const DEFAULT_UPLOAD_DIR: &str = "uploads";

/// Configuration for the download service
#[derive(Debug, Clone)]
pub struct DownloadServiceConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub root_directory: PathBuf,
}

/// Configuration for the UDP upload service
#[derive(Debug, Clone)]
pub struct UploadServiceConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub session_idle_timeout: Duration,
}

/// Configuration for the TCP stream upload service
#[derive(Debug, Clone)]
pub struct StreamServiceConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub idle_timeout: Duration,
}

/// Complete service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub interface: Option<String>,
    pub upload_directory: PathBuf,
    pub transfer: TransferConfig,
    pub download: DownloadServiceConfig,
    pub upload: UploadServiceConfig,
    pub stream: StreamServiceConfig,
}

#[derive(FromArgs, Debug)]
#[argh(
    description = "File Transfer Server - stop-and-wait file download and upload over UDP, upload over TCP",
    example = "Serve ./files, store uploads in ./incoming:\n  {command_name} --root ./files --uploads ./incoming",
    example = "Only the download service, bound to one interface:\n  {command_name} --interface eth0 --disable-upload --disable-stream",
    example = "Lossy links:\n  {command_name} --ack-timeout-ms 2500 --retries 20"
)]
struct CliConfig {
    #[argh(
        option,
        short = 'I',
        description = "bind every service to this interface's IPv4 address"
    )]
    interface: Option<String>,

    //
    // Download
    //
    #[argh(switch, description = "disable the download service")]
    disable_download: bool,

    #[argh(
        option,
        short = 'r',
        description = "directory served to downloaders",
        default = "PathBuf::from(DEFAULT_ROOT)"
    )]
    root: PathBuf,

    #[argh(
        option,
        short = 'd',
        description = "download service bind address",
        default = "DEFAULT_DOWNLOAD_BIND.to_string()"
    )]
    download: String,

    //
    // Upload
    //
    #[argh(switch, description = "disable the UDP upload service")]
    disable_upload: bool,

    #[argh(switch, description = "disable the TCP stream upload service")]
    disable_stream: bool,

    #[argh(
        option,
        short = 'u',
        description = "directory uploads are stored in",
        default = "PathBuf::from(DEFAULT_UPLOAD_DIR)"
    )]
    uploads: PathBuf,

    #[argh(
        option,
        short = 'U',
        description = "upload service bind address",
        default = "DEFAULT_UPLOAD_BIND.to_string()"
    )]
    upload: String,

    #[argh(
        option,
        short = 's',
        description = "stream upload service bind address",
        default = "DEFAULT_STREAM_BIND.to_string()"
    )]
    stream: String,

    #[argh(option, description = "seconds of client silence before an upload or stream connection is abandoned", default = "30")]
    session_idle_secs: u64,

    //
    // Download transfer tuning (uploads are paced by the client)
    //
    #[argh(option, description = "payload bytes per chunk", default = "1024")]
    chunk_size: usize,

    #[argh(option, description = "milliseconds to wait for each acknowledgment", default = "1000")]
    ack_timeout_ms: u64,

    #[argh(option, description = "send attempts per chunk before giving up", default = "10")]
    retries: usize,
}

impl CliConfig {
    fn into_service_config(self) -> Result<ServiceConfig> {
        let transfer = TransferConfig {
            chunk_size: self.chunk_size,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_retries: self.retries,
            ..TransferConfig::default()
        };
        transfer.validate().context("Invalid transfer settings")?;

        let (mut download, mut upload, mut stream) = (self.download, self.upload, self.stream);
        if let Some(interface) = &self.interface {
            let ip = get_interface_ip(interface)
                .with_context(|| format!("Failed to get IPv4 address of interface '{interface}'"))?;
            download = service_address(&download, ip)?;
            upload = service_address(&upload, ip)?;
            stream = service_address(&stream, ip)?;
        }

        Ok(ServiceConfig {
            interface: self.interface,
            upload_directory: self.uploads,
            transfer,
            download: DownloadServiceConfig {
                enabled: !self.disable_download,
                bind_address: download,
                root_directory: self.root,
            },
            upload: UploadServiceConfig {
                enabled: !self.disable_upload,
                bind_address: upload,
                session_idle_timeout: Duration::from_secs(self.session_idle_secs),
            },
            stream: StreamServiceConfig {
                enabled: !self.disable_stream,
                bind_address: stream,
                idle_timeout: Duration::from_secs(self.session_idle_secs),
            },
        })
    }
}

/// Trait for services that can be run
trait Service {
    fn name(&self) -> &'static str;
    fn run(self: Box<Self>) -> JoinHandle<Result<()>>;
}

struct DownloadService {
    config: DownloadServiceConfig,
    transfer: TransferConfig,
}

impl Service for DownloadService {
    fn name(&self) -> &'static str {
        "Download"
    }

    fn run(self: Box<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(run_download_server(
            self.config.bind_address,
            self.config.root_directory,
            self.transfer,
        ))
    }
}

struct UploadService {
    config: UploadServiceConfig,
    upload_directory: PathBuf,
}

impl Service for UploadService {
    fn name(&self) -> &'static str {
        "Upload"
    }

    fn run(self: Box<Self>) -> JoinHandle<Result<()>> {
        let config = UploadServerConfig {
            bind_address: self.config.bind_address,
            upload_directory: self.upload_directory,
            session_idle_timeout: self.config.session_idle_timeout,
        };
        tokio::spawn(run_upload_server(config))
    }
}

struct StreamService {
    config: StreamServiceConfig,
    upload_directory: PathBuf,
}

impl Service for StreamService {
    fn name(&self) -> &'static str {
        "Stream"
    }

    fn run(self: Box<Self>) -> JoinHandle<Result<()>> {
        let config = StreamServerConfig {
            bind_address: self.config.bind_address,
            upload_directory: self.upload_directory,
            idle_timeout: self.config.idle_timeout,
        };
        tokio::spawn(run_stream_server(config))
    }
}

/// Runs every enabled service until the first one stops
pub struct ServiceManager {
    config: ServiceConfig,
}

impl ServiceManager {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        if let Some(interface) = &config.interface {
            if_nametoindex(interface.as_str())
                .with_context(|| format!("Network interface '{interface}' not found"))?;
        }

        if !config.download.enabled && !config.upload.enabled && !config.stream.enabled {
            return Err(anyhow::anyhow!("At least one service must be enabled"));
        }

        Ok(Self { config })
    }

    pub async fn run(self) -> Result<()> {
        let mut services: Vec<Box<dyn Service>> = Vec::new();
        let mut service_descriptions = Vec::new();

        if self.config.download.enabled {
            tracing::info!(
                "Starting download server on {} with root: {}",
                self.config.download.bind_address,
                self.config.download.root_directory.display()
            );
            services.push(Box::new(DownloadService {
                config: self.config.download.clone(),
                transfer: self.config.transfer.clone(),
            }));
            service_descriptions.push(format!("download on {}", self.config.download.bind_address));
        }

        if self.config.upload.enabled {
            tracing::info!("Starting upload server on {}", self.config.upload.bind_address);
            services.push(Box::new(UploadService {
                config: self.config.upload.clone(),
                upload_directory: self.config.upload_directory.clone(),
            }));
            service_descriptions.push(format!("upload on {}", self.config.upload.bind_address));
        }

        if self.config.stream.enabled {
            tracing::info!("Starting stream upload server on {}", self.config.stream.bind_address);
            services.push(Box::new(StreamService {
                config: self.config.stream.clone(),
                upload_directory: self.config.upload_directory.clone(),
            }));
            service_descriptions.push(format!("stream upload on {}", self.config.stream.bind_address));
        }

        tracing::info!("File transfer server started - {}", service_descriptions.join(", "));

        let mut running = JoinSet::new();
        for service in services {
            let name = service.name();
            let handle = service.run();
            running.spawn(async move { (name, handle.await) });
        }

        // The first service to stop, for any reason, stops the process
        match running.join_next().await {
            Some(Ok((name, result))) => handle_service_result(name, result),
            Some(Err(e)) => Err(anyhow::anyhow!("Service supervisor failed: {}", e)),
            None => Err(anyhow::anyhow!("No services running")),
        }
    }
}

fn handle_service_result(name: &str, result: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match result {
        Ok(Ok(_)) => {
            tracing::info!("{} service completed successfully", name);
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!("{} service failed: {:#}", name, e);
            Err(e)
        }
        Err(e) => {
            tracing::error!("{} task panicked: {}", name, e);
            Err(anyhow::anyhow!("{} task panicked: {}", name, e))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli_config: CliConfig = argh::from_env();
    let service_config = cli_config.into_service_config()?;

    let service_manager = ServiceManager::new(service_config)?;
    service_manager.run().await
}
