//! Pre-shared-secret File Transfer
//!
//! Moves files from a sender to a receiver over TLS, authenticated only by a
//! secret both ends were given out of band.
//!
//! ## Features
//! - TLS 1.2/1.3 via rustls, with a self-signed identity generated on first run
//! - One connection per file: authenticate, name the file, stream it, close
//! - Directory sending with a bounded pool of workers
//! - Optional certificate pinning and path confinement
//!
//! ## Usage
//!
//! ```bash
//! # Receive (identity is created as server.crt / server.key if missing)
//! psk-transfer -i 0.0.0.0:8080 -p mysecretkey
//!
//! # Send a file or a whole directory
//! psk-transfer -i 192.168.1.100:8080 -p mysecretkey -f myfile.txt
//! ```

pub mod client;
pub mod protocol;
pub mod server;
pub mod tls;
pub mod transfer;

pub use client::{Client, ClientConfig, DispatchSummary, TargetNaming};
pub use protocol::{ProtocolError, TransferRequest};
pub use server::{Server, ServerConfig, SessionOutcome};
pub use tls::{ClientTlsConfig, Identity, IdentityPaths, ServerTlsConfig, TrustPolicy};
pub use transfer::TransferRecord;
