//! Dispatch Driver
//!
//! Sends a file, or every regular file under a directory, to a responder.
//! Each file gets its own connection:
//!
//! ```text
//! Initiator                                  Responder
//!   |-- TCP connect + TLS handshake ---------->|
//!   |-- secret ------------------------------->|
//!   |<---------------------------- auth reply -|
//!   |-- upload <name> ------------------------>|
//!   |-- file bytes --------------------------->|
//!   |-- close_notify + FIN ------------------->|
//!   |<-------------------- close_notify + FIN -|
//! ```
//!
//! Files are taken from a shared queue by a fixed number of workers. With one
//! worker (the default) files go strictly one after another in enumeration
//! order. A failure only affects the file being sent; the worker logs it and
//! moves on to the next one.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget};
use rustls::pki_types::ServerName;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, info_span, warn, Instrument};
use walkdir::WalkDir;

use crate::protocol::{self, TransferRequest, MAX_CONTROL_MESSAGE};
use crate::tls::{server_name_for, ClientTlsConfig};
use crate::transfer::{self, create_progress_bar, TransferRecord};

/// Which name a file is sent under
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TargetNaming {
    /// The local path exactly as it was given or enumerated
    #[default]
    Verbatim,
    /// The local path relative to the parent of the path that was given,
    /// so sending `/data/photos` produces names like `photos/a.jpg`
    RelativeToParent,
}

/// Client configuration
pub struct ClientConfig {
    /// Responder address, `host:port`
    pub server_addr: String,
    /// Pre-shared secret
    pub secret: String,
    /// TLS configuration
    pub tls_config: ClientTlsConfig,
    /// Number of files sent at once
    pub workers: usize,
    /// How names are derived from local paths
    pub naming: TargetNaming,
    /// Draw progress bars on the terminal
    pub show_progress: bool,
}

/// Totals for one `send_path` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sent: usize,
    pub failed: usize,
    pub bytes: u64,
}

impl DispatchSummary {
    fn merge(&mut self, other: DispatchSummary) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.bytes += other.bytes;
    }
}

struct ClientSettings {
    server_addr: String,
    server_name: ServerName<'static>,
    secret: String,
    workers: usize,
    naming: TargetNaming,
}

/// Secure file transfer client
#[derive(Clone)]
pub struct Client {
    settings: Arc<ClientSettings>,
    connector: TlsConnector,
    progress: MultiProgress,
}

impl Client {
    /// Create a new client instance
    pub fn new(config: ClientConfig) -> Result<Self> {
        let server_name = server_name_for(&config.server_addr)?;
        let progress = if config.show_progress {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        Ok(Self {
            settings: Arc::new(ClientSettings {
                server_addr: config.server_addr,
                server_name,
                secret: config.secret,
                workers: config.workers.max(1),
                naming: config.naming,
            }),
            connector: TlsConnector::from(config.tls_config.config),
            progress,
        })
    }

    /// Send a single file, or every regular file below a directory
    pub async fn send_path(&self, path: &Path) -> Result<DispatchSummary> {
        let metadata = fs::metadata(path)
            .await
            .with_context(|| format!("Error accessing file or directory: {:?}", path))?;

        let files = if metadata.is_dir() {
            enumerate_files(path)
        } else {
            vec![path.to_path_buf()]
        };

        let jobs: VecDeque<(PathBuf, String)> = files
            .into_iter()
            .map(|file| {
                let name = target_name(self.settings.naming, path, &file);
                (file, name)
            })
            .collect();

        if jobs.is_empty() {
            info!("📁 Nothing to send under {:?}", path);
            return Ok(DispatchSummary::default());
        }

        let worker_count = self.settings.workers.min(jobs.len());
        info!("📤 Sending {} file(s) with {} worker(s)", jobs.len(), worker_count);

        let queue = Arc::new(Mutex::new(jobs));
        let mut workers = JoinSet::new();

        for id in 0..worker_count {
            let client = self.clone();
            let queue = queue.clone();
            workers.spawn(
                async move { client.drain_queue(&queue).await }.instrument(info_span!("worker", id)),
            );
        }

        let mut summary = DispatchSummary::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(partial) => summary.merge(partial),
                Err(e) => error!("Worker stopped unexpectedly: {}", e),
            }
        }

        info!(
            "Done: {} sent, {} failed, {}",
            summary.sent,
            summary.failed,
            format_size(summary.bytes)
        );
        Ok(summary)
    }

    async fn drain_queue(&self, queue: &Mutex<VecDeque<(PathBuf, String)>>) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        loop {
            let next = queue.lock().await.pop_front();
            let Some((path, name)) = next else {
                break;
            };

            match self.send_file_as(&path, &name).await {
                Ok(record) => {
                    summary.sent += 1;
                    summary.bytes += record.bytes_moved;
                }
                Err(e) => {
                    error!("Failed to send {:?}: {:#}", path, e);
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Send one file under the name the configured naming gives it
    pub async fn send_file(&self, path: &Path) -> Result<TransferRecord> {
        let name = target_name(self.settings.naming, path, path);
        self.send_file_as(path, &name).await
    }

    /// Send one file under an explicit target name: connect, authenticate,
    /// negotiate, stream, close.
    pub async fn send_file_as(&self, path: &Path, target: &str) -> Result<TransferRecord> {
        if target.contains(&['\n', '\r'][..]) {
            anyhow::bail!("Target name contains a line break: {:?}", target);
        }

        let metadata = fs::metadata(path)
            .await
            .with_context(|| format!("File does not exist: {:?}", path))?;
        if !metadata.is_file() {
            anyhow::bail!("Not a regular file: {:?}", path);
        }
        let mut file = File::open(path)
            .await
            .with_context(|| format!("Error opening file: {:?}", path))?;

        info!("Sending: {:?} as {:?}", path, target);

        let stream = self.connect().await?;

        let pb = self.progress.add(create_progress_bar(metadata.len()));
        pb.set_message(target.to_string());

        let result = transmit(
            stream,
            &self.settings.secret,
            &mut file,
            Some(metadata.len()),
            target,
            &pb,
        )
        .await;

        pb.finish_and_clear();
        self.progress.remove(&pb);

        let record = result?;
        info!(
            "✅ File sent successfully: {} ({}, sha256: {})",
            record.target,
            format_size(record.bytes_moved),
            record.digest.as_deref().unwrap_or("-")
        );
        Ok(record)
    }

    async fn connect(&self) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let addr = &self.settings.server_addr;
        debug!("🔗 Connecting to {}...", addr);

        let tcp_stream = TcpStream::connect(addr.as_str())
            .await
            .with_context(|| format!("Error connecting to server {}", addr))?;

        let tls_stream = self
            .connector
            .connect(self.settings.server_name.clone(), tcp_stream)
            .await
            .context("TLS handshake failed")?;

        let (_, conn_info) = tls_stream.get_ref();
        if let Some(protocol) = conn_info.protocol_version() {
            debug!("  Protocol: {:?}", protocol);
        }
        if let Some(cipher) = conn_info.negotiated_cipher_suite() {
            debug!("  Cipher: {:?}", cipher.suite());
        }

        Ok(tls_stream)
    }
}

/// Run the initiator half of one session over an established stream.
///
/// Fails if the responder does not accept the secret. After the source is
/// exhausted the write side is closed, which is the only end-of-file signal
/// the responder gets, and the stream is read until the responder closes too.
pub async fn transmit<S, R>(
    stream: S,
    secret: &str,
    source: &mut R,
    expected_size: Option<u64>,
    target: &str,
    progress: &ProgressBar,
) -> Result<TransferRecord>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut stream = BufReader::with_capacity(MAX_CONTROL_MESSAGE, stream);

    if !protocol::present(&mut stream, secret)
        .await
        .context("Error sending authentication key")?
    {
        anyhow::bail!("Authentication failed");
    }

    protocol::request(&mut stream, &TransferRequest::upload(target))
        .await
        .context("Error sending file metadata")?;

    let mut record = TransferRecord::new(target, expected_size);
    transfer::send(source, &mut stream, &mut record, progress)
        .await
        .with_context(|| format!("Error sending file data after {} bytes", record.bytes_moved))?;

    stream
        .shutdown()
        .await
        .context("Error closing the connection")?;

    // The responder closes once the file is on disk
    if let Err(e) = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await {
        debug!("Waiting for the responder to close: {}", e);
    }

    if let Some(percent) = record.percent().filter(|p| *p < 100.0) {
        warn!("Source shrank while sending: {:.2}% of the expected size", percent);
    }

    Ok(record)
}

/// All regular files below `root`, in file name order. Entries that cannot be
/// read are logged and skipped; symlinks are not followed.
pub fn enumerate_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Error accessing file: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

fn target_name(naming: TargetNaming, given: &Path, file: &Path) -> String {
    let name = match naming {
        TargetNaming::Verbatim => file,
        TargetNaming::RelativeToParent => {
            let base = given.parent().unwrap_or_else(|| Path::new(""));
            file.strip_prefix(base).unwrap_or(file)
        }
    };
    name.to_string_lossy().into_owned()
}

/// Format file size for display
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(10_000), "9.77 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_target_name() {
        let given = Path::new("/data/photos");
        let file = Path::new("/data/photos/2024/a.jpg");
        assert_eq!(
            target_name(TargetNaming::Verbatim, given, file),
            "/data/photos/2024/a.jpg"
        );
        assert_eq!(
            target_name(TargetNaming::RelativeToParent, given, file),
            "photos/2024/a.jpg"
        );
        assert_eq!(
            target_name(TargetNaming::RelativeToParent, Path::new("report.bin"), Path::new("report.bin")),
            "report.bin"
        );
    }

    #[test]
    fn test_enumerate_files_recurses_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b/inner")).unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("c.txt"), b"c").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b/inner/d.txt"), b"d").unwrap();

        let files: Vec<PathBuf> = enumerate_files(dir.path())
            .into_iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();

        assert_eq!(
            files,
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b/inner/d.txt"),
                PathBuf::from("c.txt"),
            ]
        );
    }

    #[tokio::test]
    async fn test_transmit_wire_format() {
        let (client, mut server) = duplex(64 * 1024);

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"topsecret\n");
            server.write_all(b"Authentication successful\n").await.unwrap();

            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            server.shutdown().await.unwrap();
            rest
        });

        let mut source: &[u8] = b"hello world";
        let record = transmit(
            client,
            "topsecret",
            &mut source,
            Some(11),
            "dir/hello.txt",
            &ProgressBar::hidden(),
        )
        .await
        .unwrap();

        assert_eq!(record.bytes_moved, 11);
        assert_eq!(responder.await.unwrap(), b"upload dir/hello.txt\nhello world");
    }

    #[tokio::test]
    async fn test_transmit_stops_after_rejection() {
        let (client, mut server) = duplex(64 * 1024);

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"Authentication failed\n").await.unwrap();
            let mut rest = Vec::new();
            let _ = server.read_to_end(&mut rest).await;
            rest
        });

        let mut source: &[u8] = b"never sent";
        let result = transmit(
            client,
            "wrong",
            &mut source,
            Some(10),
            "x",
            &ProgressBar::hidden(),
        )
        .await;

        assert!(result.is_err());
        assert!(responder.await.unwrap().is_empty());
    }
}
