//! TLS trust provisioning for broker connections
//!
//! A [`TrustConfig`] declares where the trust anchors come from and which
//! protocol versions may be negotiated. [`build_trust_context`] turns it into
//! a reusable rustls client configuration, failing before any socket is
//! opened when the declaration cannot be satisfied.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const PEM_MARKER: &[u8] = b"-----BEGIN";

/// Protocol names older stacks accept but negotiation here never allows
///
/// rustls implements nothing below TLS 1.2, so these fail at configuration
/// time rather than at the handshake.
const LEGACY_VERSIONS: [&str; 4] = ["SSLv3", "TLSv1", "TLSv1.0", "TLSv1.1"];

/// TLS provisioning errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Self-signed trust requires CA certificate bytes")]
    MissingCaCertificate,
    #[error("Invalid CA certificate: {0}")]
    InvalidCaCertificate(String),
    #[error("TLS protocol version {0} is not supported; use TLSv1.2 or TLSv1.3")]
    UnsupportedVersion(String),
    #[error("Unknown TLS protocol version: {0}")]
    UnknownVersion(String),
    #[error("Platform trust store contains no usable certificates")]
    EmptyPlatformStore,
    #[error("Failed to load platform trust store")]
    PlatformStore(#[source] std::io::Error),
    #[error("Invalid client identity: {0}")]
    InvalidClientIdentity(String),
    #[error("Client identity has no private key")]
    MissingPrivateKey,
}

/// Minimum TLS protocol version offered to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

impl TlsVersion {
    const SUPPORTED: [TlsVersion; 2] = [TlsVersion::Tls12, TlsVersion::Tls13];

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }

    /// Versions that may be negotiated when this one is the configured minimum
    pub fn negotiable(&self) -> Vec<TlsVersion> {
        Self::SUPPORTED
            .into_iter()
            .filter(|version| version >= self)
            .collect()
    }

    fn rustls_version(&self) -> &'static SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TlsVersion {
    type Err = TlsConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if let Some(version) = Self::SUPPORTED
            .into_iter()
            .find(|version| version.as_str().eq_ignore_ascii_case(name))
        {
            return Ok(version);
        }
        if LEGACY_VERSIONS
            .iter()
            .any(|legacy| legacy.eq_ignore_ascii_case(name))
        {
            return Err(TlsConfigError::UnsupportedVersion(name.to_string()));
        }
        Err(TlsConfigError::UnknownVersion(name.to_string()))
    }
}

impl TryFrom<String> for TlsVersion {
    type Error = TlsConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TlsVersion> for String {
    fn from(version: TlsVersion) -> Self {
        version.as_str().to_string()
    }
}

/// Caller-supplied CA certificate bytes (PEM or DER), never empty
#[derive(Clone, PartialEq, Eq)]
pub struct CaCertificate(Vec<u8>);

impl CaCertificate {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, TlsConfigError> {
        let bytes = bytes.into();
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(TlsConfigError::MissingCaCertificate);
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CaCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CaCertificate({} bytes)", self.0.len())
    }
}

/// PEM-encoded client certificate chain and private key for mutual TLS
#[derive(Clone)]
pub struct ClientIdentity {
    pub cert_chain_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

impl ClientIdentity {
    pub fn new(cert_chain_pem: impl Into<Vec<u8>>, private_key_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            cert_chain_pem: cert_chain_pem.into(),
            private_key_pem: private_key_pem.into(),
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_chain_pem", &format!("{} bytes", self.cert_chain_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Declarative trust configuration
#[derive(Debug, Clone)]
pub enum TrustConfig {
    /// Trust anchors from the platform certificate store
    CaSigned {
        version: TlsVersion,
        client_identity: Option<ClientIdentity>,
    },
    /// A single caller-supplied CA certificate is the only trust anchor
    SelfSigned {
        ca_certificate: CaCertificate,
        version: TlsVersion,
        client_identity: Option<ClientIdentity>,
    },
}

impl TrustConfig {
    pub fn ca_signed(version: TlsVersion) -> Self {
        TrustConfig::CaSigned {
            version,
            client_identity: None,
        }
    }

    /// Fails with [`TlsConfigError::MissingCaCertificate`] on empty bytes
    pub fn self_signed(
        ca_certificate: impl Into<Vec<u8>>,
        version: TlsVersion,
    ) -> Result<Self, TlsConfigError> {
        Ok(TrustConfig::SelfSigned {
            ca_certificate: CaCertificate::new(ca_certificate)?,
            version,
            client_identity: None,
        })
    }

    pub fn with_client_identity(mut self, identity: ClientIdentity) -> Self {
        match &mut self {
            TrustConfig::CaSigned {
                client_identity, ..
            }
            | TrustConfig::SelfSigned {
                client_identity, ..
            } => *client_identity = Some(identity),
        }
        self
    }

    pub fn version(&self) -> TlsVersion {
        match self {
            TrustConfig::CaSigned { version, .. } | TrustConfig::SelfSigned { version, .. } => {
                *version
            }
        }
    }

    pub fn client_identity(&self) -> Option<&ClientIdentity> {
        match self {
            TrustConfig::CaSigned {
                client_identity, ..
            }
            | TrustConfig::SelfSigned {
                client_identity, ..
            } => client_identity.as_ref(),
        }
    }
}

/// Validated TLS client context, shareable across any number of connections
#[derive(Clone)]
pub struct TrustContext {
    config: Arc<ClientConfig>,
    versions: Vec<TlsVersion>,
    mutual: bool,
}

impl TrustContext {
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    pub fn protocol_versions(&self) -> &[TlsVersion] {
        &self.versions
    }

    pub fn is_mutual(&self) -> bool {
        self.mutual
    }

    /// rumqttc transport carrying this context
    pub fn transport(&self) -> rumqttc::Transport {
        rumqttc::Transport::tls_with_config(rumqttc::TlsConfiguration::Rustls(self.client_config()))
    }
}

impl fmt::Debug for TrustContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustContext")
            .field("versions", &self.versions)
            .field("mutual", &self.mutual)
            .finish()
    }
}

/// Build a TLS client context from a trust declaration
pub fn build_trust_context(trust: &TrustConfig) -> Result<TrustContext, TlsConfigError> {
    let roots = match trust {
        TrustConfig::CaSigned { .. } => platform_roots()?,
        TrustConfig::SelfSigned { ca_certificate, .. } => single_anchor(ca_certificate)?,
    };

    let versions = trust.version().negotiable();
    let rustls_versions: Vec<&'static SupportedProtocolVersion> = versions
        .iter()
        .map(TlsVersion::rustls_version)
        .collect();

    let builder =
        ClientConfig::builder_with_protocol_versions(&rustls_versions).with_root_certificates(roots);

    let (config, mutual) = match trust.client_identity() {
        Some(identity) => {
            let (chain, key) = load_client_identity(identity)?;
            let config = builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| TlsConfigError::InvalidClientIdentity(e.to_string()))?;
            (config, true)
        }
        None => (builder.with_no_client_auth(), false),
    };

    info!(
        versions = ?versions,
        mutual,
        self_signed = matches!(trust, TrustConfig::SelfSigned { .. }),
        "TLS trust context ready"
    );

    Ok(TrustContext {
        config: Arc::new(config),
        versions,
        mutual,
    })
}

fn platform_roots() -> Result<RootCertStore, TlsConfigError> {
    let certs = rustls_native_certs::load_native_certs().map_err(TlsConfigError::PlatformStore)?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!(ignored, "Skipped unparsable platform certificates");
    }
    if added == 0 {
        return Err(TlsConfigError::EmptyPlatformStore);
    }
    debug!(added, "Loaded platform trust anchors");
    Ok(roots)
}

fn single_anchor(ca_certificate: &CaCertificate) -> Result<RootCertStore, TlsConfigError> {
    let bytes = ca_certificate.as_bytes();
    let anchor = if is_pem(bytes) {
        rustls_pemfile::certs(&mut &bytes[..])
            .next()
            .ok_or_else(|| {
                TlsConfigError::InvalidCaCertificate("no certificate in PEM data".to_string())
            })?
            .map_err(|e| TlsConfigError::InvalidCaCertificate(e.to_string()))?
    } else {
        CertificateDer::from(bytes.to_vec())
    };

    let mut roots = RootCertStore::empty();
    roots
        .add(anchor)
        .map_err(|e| TlsConfigError::InvalidCaCertificate(e.to_string()))?;
    Ok(roots)
}

fn load_client_identity(
    identity: &ClientIdentity,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsConfigError> {
    let chain = rustls_pemfile::certs(&mut &identity.cert_chain_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::InvalidClientIdentity(e.to_string()))?;
    if chain.is_empty() {
        return Err(TlsConfigError::InvalidClientIdentity(
            "no certificates in client chain".to_string(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut &identity.private_key_pem[..])
        .map_err(|e| TlsConfigError::InvalidClientIdentity(e.to_string()))?
        .ok_or(TlsConfigError::MissingPrivateKey)?;

    Ok((chain, key))
}

fn is_pem(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    bytes[start..].starts_with(PEM_MARKER)
}
