//! Streaming Transfer Engine
//!
//! Moves bytes from a source to a sink in [`CHUNK_SIZE`] pieces until the
//! source reports end of data, keeping a running count in a
//! [`TransferRecord`].
//!
//! ## End of data
//!
//! The protocol carries no length and no end marker. The sender finishes by
//! closing its write side and the receiver treats end of stream as a complete
//! file. A TCP close without a TLS `close_notify` is accepted the same way.
//! A connection that drops halfway therefore leaves a shorter file on disk and
//! no error; the SHA-256 digest both sides log is the only way to notice.
//!
//! Partially written files are left in place after an error.

use std::io;
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Chunk size for file transfers (4 KB)
pub const CHUNK_SIZE: usize = 4096;

/// Bookkeeping for one file on one side of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    /// Name the file travels under
    pub target: String,
    /// Bytes moved so far
    pub bytes_moved: u64,
    /// Size of the source, known only to the sender
    pub expected_size: Option<u64>,
    /// Hex SHA-256 of the bytes moved, set once the transfer finishes
    pub digest: Option<String>,
}

impl TransferRecord {
    pub fn new(target: impl Into<String>, expected_size: Option<u64>) -> Self {
        Self {
            target: target.into(),
            bytes_moved: 0,
            expected_size,
            digest: None,
        }
    }

    /// Percentage done, when the total is known. An empty file is 100% done.
    pub fn percent(&self) -> Option<f64> {
        self.expected_size.map(|total| {
            if total == 0 {
                100.0
            } else {
                self.bytes_moved as f64 / total as f64 * 100.0
            }
        })
    }
}

/// How the source signals it has nothing more to give
#[derive(Debug, Clone, Copy)]
enum EndOfData {
    /// Only a clean zero-length read
    Clean,
    /// A zero-length read or an `UnexpectedEof` error from the transport
    CleanOrAbrupt,
}

/// Send mode: copy `source` (normally a local file) into `sink`.
///
/// Flushes the sink at the end but does not close it; closing the write side
/// is what tells the receiver the file is complete.
pub async fn send<R, W>(
    source: &mut R,
    sink: &mut W,
    record: &mut TransferRecord,
    progress: &ProgressBar,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pump(source, sink, record, progress, EndOfData::Clean).await
}

/// Receive mode: copy `source` (normally the network stream) into `sink`
/// until the peer stops sending.
pub async fn receive<R, W>(
    source: &mut R,
    sink: &mut W,
    record: &mut TransferRecord,
    progress: &ProgressBar,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pump(source, sink, record, progress, EndOfData::CleanOrAbrupt).await
}

/// Receive mode into a file at `path`, creating missing parent directories
/// and truncating any existing file first.
pub async fn receive_to_file<R>(
    source: &mut R,
    path: &Path,
    record: &mut TransferRecord,
    progress: &ProgressBar,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let mut file = File::create(path).await?;
    let result = receive(source, &mut file, record, progress).await;

    // Whatever arrived stays on disk, complete or not
    if result.is_err() {
        let _ = file.flush().await;
    }
    result
}

async fn pump<R, W>(
    source: &mut R,
    sink: &mut W,
    record: &mut TransferRecord,
    progress: &ProgressBar,
    end: EndOfData,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut hasher = StreamingHasher::new();

    loop {
        let bytes_read = match source.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => match end {
                EndOfData::CleanOrAbrupt => {
                    debug!("Peer closed without close_notify, treating as end of data");
                    break;
                }
                EndOfData::Clean => return Err(e),
            },
            Err(e) => return Err(e),
        };

        sink.write_all(&buffer[..bytes_read]).await?;
        hasher.update(&buffer[..bytes_read]);

        record.bytes_moved += bytes_read as u64;
        progress.set_position(record.bytes_moved);
    }

    sink.flush().await?;
    record.digest = Some(hasher.finalize());

    Ok(record.bytes_moved)
}

/// Streaming SHA-256 over the bytes of a transfer
pub struct StreamingHasher {
    hasher: Sha256,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Create progress bar for a send of known size
pub fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_percent() {
        let mut record = TransferRecord::new("a", Some(200));
        record.bytes_moved = 50;
        assert_eq!(record.percent(), Some(25.0));
        assert_eq!(TransferRecord::new("a", Some(0)).percent(), Some(100.0));
        assert_eq!(TransferRecord::new("a", None).percent(), None);
    }

    #[test]
    fn test_streaming_hasher() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"Hello, ");
        hasher.update(b"World!");
        assert_eq!(
            hasher.finalize(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[tokio::test]
    async fn test_send_then_receive_preserves_bytes() {
        for len in [0, 1, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE * 3 + 17, 10_000] {
            let data = pattern(len);
            let (mut tx, mut rx) = duplex(CHUNK_SIZE);

            let sender = {
                let data = data.clone();
                tokio::spawn(async move {
                    let mut source = data.as_slice();
                    let mut record = TransferRecord::new("x", Some(len as u64));
                    let sent = send(&mut source, &mut tx, &mut record, &ProgressBar::hidden())
                        .await
                        .unwrap();
                    tx.shutdown().await.unwrap();
                    (sent, record)
                })
            };

            let mut received = Vec::new();
            let mut record = TransferRecord::new("x", None);
            let count = receive(&mut rx, &mut received, &mut record, &ProgressBar::hidden())
                .await
                .unwrap();
            let (sent, sent_record) = sender.await.unwrap();

            assert_eq!(received, data);
            assert_eq!(count, len as u64);
            assert_eq!(sent, len as u64);
            assert_eq!(sent_record.percent(), Some(100.0));
            assert_eq!(sent_record.digest, record.digest);
        }
    }

    #[tokio::test]
    async fn test_receive_to_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/out.bin");
        let data = pattern(9000);

        let mut source = data.as_slice();
        let mut record = TransferRecord::new("out.bin", None);
        let count = receive_to_file(&mut source, &path, &mut record, &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!(count, 9000);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_early_close_truncates_silently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let data = pattern(10_000);
        let (mut tx, mut rx) = duplex(64 * 1024);

        // Only part of the file makes it before the sender goes away
        tx.write_all(&data[..6000]).await.unwrap();
        drop(tx);

        let mut record = TransferRecord::new("partial.bin", None);
        let count = receive_to_file(&mut rx, &path, &mut record, &ProgressBar::hidden())
            .await
            .unwrap();

        assert_eq!(count, 6000);
        assert_eq!(std::fs::read(&path).unwrap(), &data[..6000]);
    }

    struct AbruptEnd(Vec<u8>);

    impl AsyncRead for AbruptEnd {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            if self.0.is_empty() {
                return std::task::Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection without sending TLS close_notify",
                )));
            }
            let n = self.0.len().min(buf.remaining());
            buf.put_slice(&self.0[..n]);
            self.0.drain(..n);
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_missing_close_notify_counts_as_end() {
        let mut source = AbruptEnd(pattern(5000));
        let mut sink = Vec::new();
        let mut record = TransferRecord::new("x", None);

        let count = receive(&mut source, &mut sink, &mut record, &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(count, 5000);

        let mut source = AbruptEnd(pattern(5000));
        let mut record = TransferRecord::new("x", Some(5000));
        let err = send(&mut source, &mut Vec::new(), &mut record, &ProgressBar::hidden())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
