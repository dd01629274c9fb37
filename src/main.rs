use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use tftp_engine::{Client, ClientOptions, FileMode, Progress, Server, ServerConfig, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(name = "tftp", version, about = "TFTP client and server (RFC 1350, 2347-2349)")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve a directory until interrupted
    Serve {
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Let uploads replace existing files
        #[arg(long)]
        allow_overwrite: bool,
        /// Refuse all uploads
        #[arg(long)]
        read_only: bool,
        #[arg(long)]
        max_sessions: Option<usize>,
    },
    /// Download a file
    Get {
        server: String,
        remote: String,
        /// Defaults to the remote file name
        local: Option<PathBuf>,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Upload a file
    Put {
        server: String,
        local: PathBuf,
        /// Defaults to the local file name
        remote: Option<String>,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Ask the server for a file's size
    Size {
        server: String,
        remote: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[derive(Debug, clap::Args)]
struct TransferArgs {
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    #[arg(long)]
    blksize: Option<u16>,
    /// Retransmission timeout in seconds to negotiate
    #[arg(long)]
    timeout: Option<u8>,
    /// Negotiate the transfer size, for progress reporting
    #[arg(long)]
    tsize: bool,
    /// Transfer in netascii mode
    #[arg(long)]
    netascii: bool,
}

impl TransferArgs {
    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            mode: if self.netascii { FileMode::NetAscii } else { FileMode::Octet },
            blksize: self.blksize,
            timeout: self.timeout,
            tsize: self.tsize,
            ..ClientOptions::default()
        }
    }
}

fn resolve(server: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = (server, port)
        .to_socket_addrs()
        .with_context(|| format!("Couldn't resolve {server}"))?;
    match addrs.next() {
        Some(addr) => Ok(addr),
        None => bail!("{server} has no addresses"),
    }
}

fn report(progress: Progress) {
    match progress.total {
        Some(total) if total > 0 => log::debug!("{} / {} bytes", progress.transferred, total),
        _ => log::debug!("{} bytes", progress.transferred),
    }
}

async fn serve(
    bind: IpAddr,
    port: u16,
    root: PathBuf,
    allow_overwrite: bool,
    read_only: bool,
    max_sessions: Option<usize>,
) -> Result<()> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let config = ServerConfig { allow_writes: !read_only, allow_overwrite, max_sessions, ..ServerConfig::default() };
    let mut server = Server::new(root, config);
    server.listen(bind, port)?;

    tokio::signal::ctrl_c().await.context("Couldn't wait for Ctrl-C")?;
    server.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Serve { bind, port, root, allow_overwrite, read_only, max_sessions } => {
            serve(bind, port, root, allow_overwrite, read_only, max_sessions).await
        }
        Command::Get { server, remote, local, transfer } => {
            let client = Client::new(resolve(&server, transfer.port)?, transfer.client_options());
            let local = local.unwrap_or_else(|| PathBuf::from(remote.rsplit('/').next().unwrap_or(&remote)));
            let bytes = client.download_file(&remote, &local, report).await?;
            println!("Received {} bytes into {}", bytes, local.display());
            Ok(())
        }
        Command::Put { server, local, remote, transfer } => {
            let client = Client::new(resolve(&server, transfer.port)?, transfer.client_options());
            let remote = match remote {
                Some(remote) => remote,
                None => match local.file_name() {
                    Some(name) => name.to_string_lossy().into_owned(),
                    None => bail!("Can't derive a remote name from {}", local.display()),
                },
            };
            let bytes = client.upload_file(&remote, &local, report).await?;
            println!("Sent {} bytes as {}", bytes, remote);
            Ok(())
        }
        Command::Size { server, remote, port } => {
            let client = Client::new(resolve(&server, port)?, ClientOptions::default());
            match client.query_size(&remote).await? {
                Some(size) => println!("{size}"),
                None => bail!("Server doesn't report transfer sizes"),
            }
            Ok(())
        }
    }
}
