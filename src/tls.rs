//! Transport Bootstrap
//!
//! This module owns everything needed to turn a TCP stream into a TLS stream:
//! - The responder's identity (RSA-2048 key + self-signed certificate),
//!   generated once and persisted as PEM next to the process
//! - The responder's rustls configuration built from that identity
//! - The initiator's rustls configuration and its trust policy
//!
//! ## Trust
//!
//! The initiator never checks the responder's certificate against a root
//! store. By default it accepts any certificate, which leaves the connection
//! open to a man-in-the-middle. A certificate can be pinned instead, in which
//! case the responder must present exactly those bytes.
//!
//! Handshake signatures are verified in both modes, so the peer must at least
//! hold the private key of the certificate it presents.

use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use time::OffsetDateTime;
use tracing::{info, warn};

/// Organization name written into every generated certificate
pub const ORGANIZATION: &str = "PSK Secure File Transfer";

/// Lifetime of a generated certificate, in days
pub const VALIDITY_DAYS: i64 = 365;

/// RSA modulus size for generated identities
pub const RSA_KEY_BITS: usize = 2048;

/// Serial numbers are drawn from [0, 2^128)
const SERIAL_BYTES: usize = 16;

/// Default certificate location, relative to the working directory
pub const DEFAULT_CERT_FILE: &str = "server.crt";

/// Default private key location, relative to the working directory
pub const DEFAULT_KEY_FILE: &str = "server.key";

/// Where the responder's identity lives on disk
#[derive(Debug, Clone)]
pub struct IdentityPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for IdentityPaths {
    fn default() -> Self {
        Self {
            cert: PathBuf::from(DEFAULT_CERT_FILE),
            key: PathBuf::from(DEFAULT_KEY_FILE),
        }
    }
}

/// PEM-encoded certificate and private key
#[derive(Clone)]
pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl Identity {
    /// Load the persisted identity, or generate and persist a new one.
    ///
    /// A new identity is generated if and only if the certificate file does
    /// not exist. A certificate without its key is an error.
    pub fn ensure(paths: &IdentityPaths) -> Result<Self> {
        if paths.cert.exists() {
            info!("Reusing identity from {:?}", paths.cert);
            return Self::load(paths);
        }

        info!("No identity found at {:?}, generating one", paths.cert);
        let identity = Self::generate()?;
        identity.save(paths)?;
        Ok(identity)
    }

    /// Generate a fresh RSA key and a self-signed certificate for it
    pub fn generate() -> Result<Self> {
        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
            .context("Failed to generate RSA key")?;
        let pkcs8 = rsa_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| anyhow!("Failed to encode RSA key: {}", e))?;
        let key_pair = KeyPair::from_pem_and_sign_algo(&pkcs8, &PKCS_RSA_SHA256)
            .context("Failed to load generated key")?;

        let params = certificate_params(OffsetDateTime::now_utc(), random_serial());
        let cert = params
            .self_signed(&key_pair)
            .context("Failed to generate self-signed certificate")?;

        info!("✓ Generated self-signed certificate");
        info!("  Subject: O={}", ORGANIZATION);
        info!("  Valid for {} days", VALIDITY_DAYS);

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Read both PEM files
    pub fn load(paths: &IdentityPaths) -> Result<Self> {
        let cert_pem = fs::read_to_string(&paths.cert)
            .with_context(|| format!("Failed to read certificate: {:?}", paths.cert))?;
        let key_pem = fs::read_to_string(&paths.key)
            .with_context(|| format!("Failed to read private key: {:?}", paths.key))?;
        Ok(Self { cert_pem, key_pem })
    }

    /// Write both PEM files; the key is made owner-only on Unix
    pub fn save(&self, paths: &IdentityPaths) -> Result<()> {
        for path in [&paths.cert, &paths.key] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {:?}", parent))?;
            }
        }

        fs::write(&paths.cert, &self.cert_pem)
            .with_context(|| format!("Failed to write certificate to {:?}", paths.cert))?;
        info!("Saved certificate to {:?}", paths.cert);

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut key_file = options
            .open(&paths.key)
            .with_context(|| format!("Failed to create private key file {:?}", paths.key))?;

        // The mode above only applies to newly created files
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            key_file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        key_file
            .write_all(self.key_pem.as_bytes())
            .with_context(|| format!("Failed to write private key to {:?}", paths.key))?;

        info!("Saved private key to {:?}", paths.key);
        Ok(())
    }
}

fn certificate_params(issued_at: OffsetDateTime, serial: [u8; SERIAL_BYTES]) -> CertificateParams {
    let mut params = CertificateParams::default();

    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = name;

    params.serial_number = Some(SerialNumber::from_slice(&serial));
    params.not_before = issued_at;
    params.not_after = issued_at + time::Duration::days(VALIDITY_DAYS);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
}

/// 128 random bits. The top bit is cleared so the DER integer stays positive
/// without padding, and the value is never zero.
fn random_serial() -> [u8; SERIAL_BYTES] {
    let mut serial = [0u8; SERIAL_BYTES];
    rand::thread_rng().fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    if serial.iter().all(|b| *b == 0) {
        serial[SERIAL_BYTES - 1] = 1;
    }
    serial
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// TLS configuration for the responder
pub struct ServerTlsConfig {
    pub config: Arc<ServerConfig>,
}

impl ServerTlsConfig {
    /// Build the responder configuration from an identity
    pub fn from_identity(identity: &Identity) -> Result<Self> {
        let certs = load_certs_from_pem(&identity.cert_pem)?;
        let key = load_private_key_from_pem(&identity.key_pem)?;

        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .context("Failed to select TLS protocol versions")?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Failed to build server TLS config")?;

        Ok(Self {
            config: Arc::new(config),
        })
    }
}

/// How the initiator treats the responder's certificate
#[derive(Debug, Clone)]
pub enum TrustPolicy {
    /// Accept whatever certificate is presented
    AcceptAny,
    /// Accept only this exact certificate
    Pinned(CertificateDer<'static>),
}

/// TLS configuration for the initiator
pub struct ClientTlsConfig {
    pub config: Arc<ClientConfig>,
}

impl ClientTlsConfig {
    /// Create a client config that accepts any responder certificate
    ///
    /// # WARNING
    /// Nothing ties the connection to a particular responder. Anyone able to
    /// intercept the TCP connection can terminate TLS and read the secret.
    pub fn insecure() -> Result<Self> {
        warn!("⚠️  Responder certificate verification DISABLED");
        Self::with_policy(TrustPolicy::AcceptAny)
    }

    /// Create a client config that only accepts the certificate in `path`
    pub fn pinned(path: &Path) -> Result<Self> {
        let cert = load_certs(path)?.remove(0);
        info!("Pinned responder certificate from {:?}", path);
        Self::with_policy(TrustPolicy::Pinned(cert))
    }

    /// Create a client config pinned to the first certificate in a PEM string
    pub fn from_pinned_pem(pem: &str) -> Result<Self> {
        let cert = load_certs_from_pem(pem)?.remove(0);
        Self::with_policy(TrustPolicy::Pinned(cert))
    }

    pub fn with_policy(policy: TrustPolicy) -> Result<Self> {
        let provider = crypto_provider();
        let verifier = ResponderVerifier {
            policy,
            provider: provider.clone(),
        };

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("Failed to select TLS protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
        })
    }
}

/// Derive the TLS server name from a `host:port` address.
///
/// The name is only used for SNI; no verifier here checks it.
pub fn server_name_for(addr: &str) -> Result<ServerName<'static>> {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_owned())
        .with_context(|| format!("Invalid server name for TLS: {}", host))
}

#[derive(Debug)]
struct ResponderVerifier {
    policy: TrustPolicy,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for ResponderVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.policy {
            TrustPolicy::AcceptAny => Ok(ServerCertVerified::assertion()),
            TrustPolicy::Pinned(pinned) if pinned.as_ref() == end_entity.as_ref() => {
                Ok(ServerCertVerified::assertion())
            }
            TrustPolicy::Pinned(_) => Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Load certificates from PEM string
fn load_certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates from PEM")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in PEM data");
    }

    Ok(certs)
}

/// Load a private key from PEM string
fn load_private_key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());

    let key = private_key(&mut reader)
        .context("Failed to read private key from PEM")?
        .ok_or_else(|| anyhow!("No private key found in PEM data"))?;

    Ok(key)
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate file: {:?}", path))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {:?}", path);
    }

    Ok(certs)
}
