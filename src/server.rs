//! Session Driver
//!
//! Accepts TLS connections and runs one session per connection:
//!
//! ```text
//! accept ──► TLS handshake ──► authenticate ──► negotiate ──► receive ──► close
//!                 │                 │               │             │
//!                 └── any failure: log, close this connection, keep accepting
//! ```
//!
//! Every connection is handled in its own task and owns its stream, buffer
//! and transfer record. Nothing is shared between sessions except the
//! read-only settings, so one session failing never touches another.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::protocol::{self, resolve_target, ProtocolError, MAX_CONTROL_MESSAGE};
use crate::tls::ServerTlsConfig;
use crate::transfer::{self, TransferRecord};

/// Default limit on concurrently handled connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Pause after a failed `accept()` before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Secret every initiator must present
    pub secret: String,
    /// Directory received names are joined onto
    pub storage_dir: PathBuf,
    /// Refuse names that are absolute or contain `..`
    pub confine: bool,
    /// Connections beyond this many are dropped on arrival
    pub max_connections: usize,
    /// TLS configuration
    pub tls_config: ServerTlsConfig,
}

/// What a session needs to know, shared read-only by all of them
#[derive(Debug)]
pub struct SessionSettings {
    pub secret: String,
    pub storage_dir: PathBuf,
    pub confine: bool,
}

/// How a session ended, when it ended without an I/O error
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Wrong secret; nothing was read past it
    Rejected,
    /// Authenticated, but the transfer request was unusable; nothing written
    InvalidRequest(String),
    /// A file was received
    Completed(TransferRecord),
}

/// Secure file transfer server
pub struct Server {
    settings: Arc<SessionSettings>,
    bind_addr: String,
    acceptor: TlsAcceptor,
    connection_semaphore: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        Self {
            settings: Arc::new(SessionSettings {
                secret: config.secret,
                storage_dir: config.storage_dir,
                confine: config.confine,
            }),
            bind_addr: config.bind_addr,
            acceptor: TlsAcceptor::from(config.tls_config.config),
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
        }
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.bind_addr))?;

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            "🔒 Secure file transfer server listening on {}",
            listener.local_addr()?
        );
        info!("📁 Storage directory: {:?}", self.settings.storage_dir);
        if !self.settings.confine {
            warn!("Received names are used as paths without validation");
        }

        loop {
            let (tcp_stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    back_off_after_accept_error(&e).await;
                    continue;
                }
            };

            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Connection limit reached, rejecting {}", peer_addr);
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let settings = self.settings.clone();
            let span = info_span!("session", peer = %peer_addr);

            tokio::spawn(
                async move {
                    let _permit = permit;

                    match handle_connection(tcp_stream, acceptor, peer_addr, &settings).await {
                        Ok(outcome) => debug!("Session ended: {:?}", outcome),
                        Err(e) => warn!("Session aborted: {:#}", e),
                    }
                }
                .instrument(span),
            );
        }
    }
}

async fn handle_connection(
    tcp_stream: TcpStream,
    acceptor: TlsAcceptor,
    peer_addr: SocketAddr,
    settings: &SessionSettings,
) -> Result<SessionOutcome> {
    info!("📥 Client connected: {}", peer_addr);

    let tls_stream = acceptor
        .accept(tcp_stream)
        .await
        .context("TLS handshake failed")?;

    debug!("🔐 TLS handshake successful");

    run_session(tls_stream, settings).await
}

/// Drive one session over an established stream, then close it.
pub async fn run_session<S>(stream: S, settings: &SessionSettings) -> Result<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::with_capacity(MAX_CONTROL_MESSAGE, stream);
    let outcome = drive(&mut stream, settings).await;

    if let Err(e) = stream.shutdown().await {
        debug!("Closing stream: {}", e);
    }
    outcome
}

async fn drive<S>(stream: &mut BufReader<S>, settings: &SessionSettings) -> Result<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !protocol::authenticate(stream, &settings.secret)
        .await
        .context("Error reading authentication key")?
    {
        warn!("Invalid authentication key, disconnecting client");
        return Ok(SessionOutcome::Rejected);
    }
    info!("Client authenticated successfully");

    let request = match protocol::negotiate(stream).await {
        Ok(request) => request,
        Err(ProtocolError::Io(e)) => {
            return Err(e).context("Error reading file metadata");
        }
        Err(e) => {
            warn!("Invalid transfer request: {}", e);
            return Ok(SessionOutcome::InvalidRequest(e.to_string()));
        }
    };

    let path = match resolve_target(&settings.storage_dir, &request.target, settings.confine) {
        Ok(path) => path,
        Err(e) => {
            warn!("Invalid transfer request: {}", e);
            return Ok(SessionOutcome::InvalidRequest(e.to_string()));
        }
    };

    info!("Receiving: {}", request.target);

    let mut record = TransferRecord::new(request.target, None);
    transfer::receive_to_file(stream, &path, &mut record, &ProgressBar::hidden())
        .await
        .with_context(|| {
            format!(
                "Error receiving file {:?} after {} bytes",
                path, record.bytes_moved
            )
        })?;

    info!(
        "✅ File received successfully: {:?} ({} bytes, sha256: {})",
        path,
        record.bytes_moved,
        record.digest.as_deref().unwrap_or("-")
    );

    Ok(SessionOutcome::Completed(record))
}

/// Log a failed `accept()` and pause before the next one.
/// Errors like EMFILE repeat until some connection closes.
async fn back_off_after_accept_error(err: &io::Error) {
    error!("Failed to accept connection: {}", err);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    fn settings(dir: &std::path::Path) -> SessionSettings {
        SessionSettings {
            secret: "topsecret".to_string(),
            storage_dir: dir.to_path_buf(),
            confine: false,
        }
    }

    async fn reply_line<S: AsyncRead + Unpin>(stream: &mut S) -> String {
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn test_session_receives_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let (mut client, server) = duplex(64 * 1024);

        let session = tokio::spawn(async move { run_session(server, &settings).await });

        client.write_all(b"topsecret\n").await.unwrap();
        assert_eq!(reply_line(&mut client).await, "Authentication successful\n");
        client.write_all(b"upload sub/report.bin\n").await.unwrap();
        client.write_all(&[7u8; 10_000]).await.unwrap();
        client.shutdown().await.unwrap();

        let outcome = session.await.unwrap().unwrap();
        match outcome {
            SessionOutcome::Completed(record) => assert_eq!(record.bytes_moved, 10_000),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let written = std::fs::read(dir.path().join("sub/report.bin")).unwrap();
        assert_eq!(written, vec![7u8; 10_000]);
    }

    #[tokio::test]
    async fn test_session_rejects_wrong_secret() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let (mut client, server) = duplex(64 * 1024);

        let session = tokio::spawn(async move { run_session(server, &settings).await });

        client.write_all(b"wrong\n").await.unwrap();
        assert_eq!(reply_line(&mut client).await, "Authentication failed\n");

        // The session is over; nothing after the secret is accepted
        let _ = client.write_all(b"upload report.bin\npayload").await;
        let _ = client.shutdown().await;

        assert_eq!(session.await.unwrap().unwrap(), SessionOutcome::Rejected);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_session_rejects_malformed_requests() {
        for request in ["upload\n", "download report.bin\n", "report.bin\n"] {
            let dir = tempfile::tempdir().unwrap();
            let settings = settings(dir.path());
            let (mut client, server) = duplex(64 * 1024);

            let session = tokio::spawn(async move { run_session(server, &settings).await });

            client.write_all(b"topsecret\n").await.unwrap();
            reply_line(&mut client).await;
            client.write_all(request.as_bytes()).await.unwrap();
            let _ = client.write_all(b"payload").await;
            let _ = client.shutdown().await;

            let outcome = session.await.unwrap().unwrap();
            assert!(
                matches!(outcome, SessionOutcome::InvalidRequest(_)),
                "{:?} gave {:?}",
                request,
                outcome
            );
            assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        }
    }

    #[tokio::test]
    async fn test_confined_session_refuses_escape() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(&dir.path().join("store"));
        settings.confine = true;
        let (mut client, server) = duplex(64 * 1024);

        let session = tokio::spawn(async move { run_session(server, &settings).await });

        client.write_all(b"topsecret\n").await.unwrap();
        reply_line(&mut client).await;
        client.write_all(b"upload ../escaped.bin\n").await.unwrap();
        let _ = client.shutdown().await;

        assert!(matches!(
            session.await.unwrap().unwrap(),
            SessionOutcome::InvalidRequest(_)
        ));
        assert!(!dir.path().join("escaped.bin").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_pauses_before_retry() {
        let start = tokio::time::Instant::now();
        let err = io::Error::new(io::ErrorKind::Other, "too many open files");

        back_off_after_accept_error(&err).await;

        assert!(start.elapsed() >= ACCEPT_BACKOFF);
    }
}
