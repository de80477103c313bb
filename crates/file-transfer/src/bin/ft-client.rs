//! File transfer client: download, upload and stream upload

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use stopwait::TransferConfig;
use tokio::net::lookup_host;

#[derive(FromArgs, Debug)]
#[argh(
    description = "File Transfer Client",
    example = "Download a file:\n  {command_name} get boot.img",
    example = "Upload a file to a remote server:\n  {command_name} --host 10.0.1.50 put ./report.pdf",
    example = "Upload over TCP:\n  {command_name} put-stream ./disk.img"
)]
struct ClientArgs {
    #[argh(
        option,
        short = 'H',
        description = "server host name or address",
        default = "\"127.0.0.1\".to_string()"
    )]
    host: String,

    #[argh(option, description = "payload bytes per chunk", default = "1024")]
    chunk_size: usize,

    #[argh(option, description = "milliseconds to wait for each acknowledgment", default = "1000")]
    ack_timeout_ms: u64,

    #[argh(option, description = "send attempts per chunk before giving up", default = "10")]
    retries: usize,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Get(GetArgs),
    Put(PutArgs),
    PutStream(PutStreamArgs),
}

/// download a file over UDP
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "get")]
struct GetArgs {
    #[argh(positional, description = "name of the file on the server")]
    filename: String,

    #[argh(
        option,
        short = 'o',
        description = "where to save the file (default: downloaded_<name>)"
    )]
    output: Option<PathBuf>,

    #[argh(option, short = 'p', description = "server port", default = "download::DEFAULT_PORT")]
    port: u16,
}

/// upload a file over UDP
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "put")]
struct PutArgs {
    #[argh(positional, description = "local file to upload")]
    path: PathBuf,

    #[argh(option, short = 'p', description = "server port", default = "upload::DEFAULT_PORT")]
    port: u16,
}

/// upload a file over TCP
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "put-stream")]
struct PutStreamArgs {
    #[argh(positional, description = "local file to upload")]
    path: PathBuf,

    #[argh(option, short = 'p', description = "server port", default = "stream::DEFAULT_PORT")]
    port: u16,
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {host}"))?
        .next()
        .with_context(|| format!("{host} has no addresses"))
}

async fn run(args: ClientArgs) -> Result<()> {
    let config = TransferConfig {
        chunk_size: args.chunk_size,
        ack_timeout: Duration::from_millis(args.ack_timeout_ms),
        max_retries: args.retries,
        ..TransferConfig::default()
    };
    config.validate().context("Invalid transfer settings")?;

    match args.command {
        Command::Get(get) => {
            let server = resolve(&args.host, get.port).await?;
            let report = download::download_file(server, &get.filename, get.output, &config)
                .await
                .with_context(|| format!("Download of {} from {} failed", get.filename, server))?;
            println!(
                "Downloaded {} bytes in {} chunks to {}",
                report.bytes,
                report.chunks,
                report.path.display()
            );
        }
        Command::Put(put) => {
            let server = resolve(&args.host, put.port).await?;
            let report = upload::upload_file(server, &put.path, &config)
                .await
                .with_context(|| format!("Upload of {} to {} failed", put.path.display(), server))?;
            println!(
                "Uploaded {} bytes in {} chunks as {}",
                report.bytes, report.chunks, report.name
            );
        }
        Command::PutStream(put) => {
            let server = resolve(&args.host, put.port).await?;
            let report = stream::upload_stream(server, &put.path, config.response_timeout)
                .await
                .with_context(|| format!("Stream upload of {} to {} failed", put.path.display(), server))?;
            println!("Uploaded {} bytes as {}", report.bytes, report.name);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args: ClientArgs = argh::from_env();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
