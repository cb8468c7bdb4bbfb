//! Protocol Definition Module
//!
//! This module defines the control half of the transfer protocol:
//! - The pre-shared secret exchange (session authentication)
//! - The single transfer request that follows it (metadata negotiation)
//! - How a received target name becomes a filesystem path
//!
//! ## Protocol Overview
//!
//! Every message is a line of text sent over an already established TLS
//! stream. There is one message per round trip and no length prefix:
//!
//! ```text
//! Initiator                                  Responder
//!   |                                          |
//!   |-- [TLS Handshake] ---------------------->|
//!   |<--------------------- [TLS Established] -|
//!   |                                          |
//!   |-- <secret>\n --------------------------->|
//!   |<------------- Authentication successful -|   (or "Authentication failed",
//!   |                                          |    then the responder closes)
//!   |-- upload <target-name>\n --------------->|
//!   |-- [raw file bytes] --------------------->|
//!   |-- [close write side] ------------------->|
//! ```
//!
//! ## Known gaps
//!
//! 1. The secret is compared for plain equality; there is no challenge, so
//!    its confidentiality rests entirely on TLS.
//! 2. The target name is used as a path without validation unless the
//!    responder is configured to confine it.
//! 3. End of file is the end of the stream (see [`crate::transfer`]).

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Upper bound on a single control message
pub const MAX_CONTROL_MESSAGE: usize = 4096;

/// Reply sent after a correct secret; also the marker the initiator looks for
pub const AUTH_SUCCESS: &str = "Authentication successful";

/// Reply sent after a wrong secret
pub const AUTH_FAILURE: &str = "Authentication failed";

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed before a control message arrived")]
    ConnectionClosed,

    #[error("Invalid transfer request: {0:?}")]
    MalformedRequest(String),

    #[error("Unsupported operation: {0:?}")]
    UnsupportedOperation(String),

    #[error("Target escapes the storage directory: {0:?}")]
    PathEscape(String),
}

/// Read one control message.
///
/// A control message is whatever the next read returns, cut at the first
/// newline and at [`MAX_CONTROL_MESSAGE`], with surrounding whitespace
/// trimmed. Bytes after the newline stay buffered for the next reader, which
/// matters because the initiator starts streaming file data right after its
/// transfer request.
pub async fn read_control_message<S>(stream: &mut S) -> Result<String, ProtocolError>
where
    S: AsyncBufRead + Unpin,
{
    let chunk = stream.fill_buf().await?;
    if chunk.is_empty() {
        return Err(ProtocolError::ConnectionClosed);
    }

    let end = chunk
        .iter()
        .position(|b| *b == b'\n')
        .map_or(chunk.len(), |newline| newline + 1)
        .min(MAX_CONTROL_MESSAGE);
    let message = String::from_utf8_lossy(&chunk[..end]).trim().to_string();
    stream.consume(end);

    Ok(message)
}

/// Write one newline-terminated control message and flush it
pub async fn write_control_message<S>(stream: &mut S, message: &str) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    let mut line = String::with_capacity(message.len() + 1);
    line.push_str(message);
    line.push('\n');

    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Responder side of authentication.
///
/// Reads exactly one message and compares it with `expected_secret`. Returns
/// `Ok(false)` after telling the peer it was rejected; there is no second
/// attempt on the same connection.
pub async fn authenticate<S>(stream: &mut S, expected_secret: &str) -> Result<bool, ProtocolError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let presented = read_control_message(stream).await?;

    if presented != expected_secret {
        // The session ends either way; a failed reply changes nothing
        if let Err(e) = write_control_message(stream, AUTH_FAILURE).await {
            debug!("Failed to send rejection: {}", e);
        }
        return Ok(false);
    }

    write_control_message(stream, AUTH_SUCCESS).await?;
    Ok(true)
}

/// Initiator side of authentication.
///
/// Only a failure to send the secret is an error. A reply without the
/// success marker, or no reply at all, is reported as `Ok(false)`.
pub async fn present<S>(stream: &mut S, secret: &str) -> Result<bool, ProtocolError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    write_control_message(stream, secret).await?;

    match read_control_message(stream).await {
        Ok(reply) if reply.contains(AUTH_SUCCESS) => Ok(true),
        Ok(reply) => {
            warn!("Authentication failed. Server response: {:?}", reply);
            Ok(false)
        }
        Err(e) => {
            warn!("Authentication failed. No server response: {}", e);
            Ok(false)
        }
    }
}

/// Operations a transfer request can name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Store the rest of the stream under the target name
    Upload,
}

impl Operation {
    pub fn keyword(self) -> &'static str {
        match self {
            Operation::Upload => "upload",
        }
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "upload" => Some(Operation::Upload),
            _ => None,
        }
    }
}

/// The control message sent right after authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub operation: Operation,
    pub target: String,
}

impl TransferRequest {
    pub fn upload(target: impl Into<String>) -> Self {
        Self {
            operation: Operation::Upload,
            target: target.into(),
        }
    }

    /// Parse `<operation> <target-name>`.
    ///
    /// Whitespace around the message is trimmed and the message is split at
    /// the first space only, so the target may itself contain spaces.
    pub fn parse(message: &str) -> Result<Self, ProtocolError> {
        let message = message.trim();
        let (keyword, target) = message
            .split_once(' ')
            .ok_or_else(|| ProtocolError::MalformedRequest(message.to_string()))?;

        let operation = Operation::from_keyword(keyword)
            .ok_or_else(|| ProtocolError::UnsupportedOperation(keyword.to_string()))?;

        Ok(Self {
            operation,
            target: target.to_string(),
        })
    }

    /// Wire form, without the line terminator
    pub fn encode(&self) -> String {
        format!("{} {}", self.operation.keyword(), self.target)
    }
}

/// Responder side of negotiation: read and parse one transfer request
pub async fn negotiate<S>(stream: &mut S) -> Result<TransferRequest, ProtocolError>
where
    S: AsyncBufRead + Unpin,
{
    let message = read_control_message(stream).await?;
    TransferRequest::parse(&message)
}

/// Initiator side of negotiation: send one transfer request
pub async fn request<S>(stream: &mut S, request: &TransferRequest) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    write_control_message(stream, &request.encode()).await
}

/// Turn a received target name into the path the file is written to.
///
/// The name is joined onto `storage_dir`, so with the default storage
/// directory of `.` the name is used as given and an absolute name replaces
/// the directory entirely. With `confine` set, absolute names and names
/// containing `..` are refused instead.
pub fn resolve_target(storage_dir: &Path, target: &str, confine: bool) -> Result<PathBuf, ProtocolError> {
    if confine {
        let escapes = Path::new(target).components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes || target.starts_with('\\') {
            return Err(ProtocolError::PathEscape(target.to_string()));
        }
    }

    Ok(storage_dir.join(target))
}
