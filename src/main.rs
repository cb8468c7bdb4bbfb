//! Pre-shared-secret File Transfer - Main Entry Point
//!
//! One binary, two roles:
//!
//! ```text
//!   psk-transfer -i ADDR -p SECRET            responder: listen, receive files
//!   psk-transfer -i ADDR -p SECRET -f PATH    initiator: send PATH, then exit
//! ```
//!
//! Without a secret the usage text is printed and nothing else happens.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use psk_transfer::client::{Client, ClientConfig, TargetNaming};
use psk_transfer::server::{Server, ServerConfig, DEFAULT_MAX_CONNECTIONS};
use psk_transfer::tls::{
    ClientTlsConfig, Identity, IdentityPaths, ServerTlsConfig, DEFAULT_CERT_FILE,
    DEFAULT_KEY_FILE,
};

/// Secure file transfer authenticated by a pre-shared secret
///
/// Responder:  psk-transfer -i 0.0.0.0:8080 -p mysecretkey
///
/// Initiator:  psk-transfer -i 192.168.1.100:8080 -p mysecretkey -f myfile.txt
#[derive(Parser)]
#[command(name = "psk-transfer")]
#[command(version)]
#[command(about = "Secure file transfer over TLS with a pre-shared key")]
struct Cli {
    /// IP and port to bind (responder) or connect to (initiator)
    #[arg(short = 'i', long = "addr", default_value = "127.0.0.1:8080")]
    addr: String,

    /// Pre-shared key for authentication
    #[arg(short = 'p', long, env = "PSK_TRANSFER_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// File or directory to send; selects the initiator role
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    responder: ResponderArgs,

    #[command(flatten)]
    initiator: InitiatorArgs,
}

#[derive(Args)]
#[command(next_help_heading = "Responder")]
struct ResponderArgs {
    /// Certificate file, generated if missing
    #[arg(long, default_value = DEFAULT_CERT_FILE)]
    cert: PathBuf,

    /// Private key file, generated if missing
    #[arg(long, default_value = DEFAULT_KEY_FILE)]
    key: PathBuf,

    /// Directory received names are resolved against
    #[arg(long, default_value = ".")]
    storage: PathBuf,

    /// Refuse received names that are absolute or contain `..`
    #[arg(long)]
    confine: bool,

    /// Maximum number of sessions handled at once
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
}

#[derive(Args)]
#[command(next_help_heading = "Initiator")]
struct InitiatorArgs {
    /// Only accept a responder presenting this certificate (PEM)
    #[arg(long)]
    pin_cert: Option<PathBuf>,

    /// Number of files sent in parallel, one connection each
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Send names relative to the parent of the given path
    #[arg(long)]
    relative_names: bool,

    /// Name to send a single file under
    #[arg(long)]
    name: Option<String>,

    /// Hide progress bars
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let Some(secret) = cli.secret.filter(|s| !s.is_empty()) else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match cli.file {
        Some(path) => run_initiator(cli.addr, secret, path, cli.initiator).await,
        None => run_responder(cli.addr, secret, cli.responder).await,
    }
}

async fn run_responder(addr: String, secret: String, args: ResponderArgs) -> Result<()> {
    info!("🚀 Starting secure file transfer server...");

    let identity = Identity::ensure(&IdentityPaths {
        cert: args.cert,
        key: args.key,
    })?;
    let tls_config = ServerTlsConfig::from_identity(&identity)?;

    let config = ServerConfig {
        bind_addr: addr,
        secret,
        storage_dir: args.storage,
        confine: args.confine,
        max_connections: args.max_connections,
        tls_config,
    };

    Server::new(config).run().await
}

async fn run_initiator(
    addr: String,
    secret: String,
    path: PathBuf,
    args: InitiatorArgs,
) -> Result<()> {
    let tls_config = match &args.pin_cert {
        Some(cert) => ClientTlsConfig::pinned(cert)?,
        None => ClientTlsConfig::insecure()?,
    };

    let naming = if args.relative_names {
        TargetNaming::RelativeToParent
    } else {
        TargetNaming::Verbatim
    };

    let client = Client::new(ClientConfig {
        server_addr: addr,
        secret,
        tls_config,
        workers: args.workers,
        naming,
        show_progress: !args.quiet,
    })?;

    if let Some(name) = args.name {
        if path.is_dir() {
            anyhow::bail!("--name only applies to a single file");
        }
        client.send_file_as(&path, &name).await?;
        return Ok(());
    }

    let summary = client.send_path(&path).await?;
    if summary.failed > 0 {
        anyhow::bail!("{} of {} file(s) failed", summary.failed, summary.failed + summary.sent);
    }
    Ok(())
}
