//! Forwarder configuration
//!
//! A TOML file with `[broker]`, `[forwarding]`, `[reply]` and `[tls]`
//! sections. Credentials never appear in the file; it names the environment
//! variables holding them. Relative certificate paths are resolved against the
//! directory of the configuration file.
//!
//! ```toml
//! [broker]
//! url = "ssl://broker.example.com:8883"
//! client_id = "dock-reader-1"
//! username_env = "MQTT_USERNAME"
//! password_env = "MQTT_PASSWORD"
//! automatic_reconnect = true
//!
//! [broker.reconnect]
//! max_attempts = 5
//! backoff_ms = [250, 1000]
//! sustained_delay_ms = 3000
//!
//! [forwarding]
//! default_topic = "tags/in"
//! encoding = "PAYLOAD_PLUS_ATTRIBUTES"
//! trim_header = true
//!
//! [forwarding.attributes]
//! site = "dock-3"
//!
//! [reply]
//! subscribe_for_reply = true
//! response_topic = "tags/reply"
//! timeout_secs = 5
//!
//! [tls]
//! enabled = true
//! mode = "self_signed"
//! ca_certificate = "certs/ca.pem"
//! version = "TLSv1.2"
//! ```

use crate::protocol::{Attributes, MessageEncoding};
use crate::session::{ReplySettings, SessionConfig};
use crate::transport::mqtt::{
    BrokerAddress, Credentials, HealthMonitor, MqttSettings, ReconnectConfig,
};
use crate::transport::tls::ClientIdentity;
use crate::transport::{build_trust_context, TlsConfigError, TlsVersion, TrustConfig};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main forwarder configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwarderConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub forwarding: ForwardingSection,
    #[serde(default)]
    pub reply: ReplySection,
    #[serde(default)]
    pub tls: TlsSection,
    /// Directory relative certificate paths are resolved against
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Broker connection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// `tcp://`, `mqtt://`, `ssl://` or `mqtts://` URL
    pub url: String,
    /// Client identifier (must match [a-zA-Z0-9._-]+)
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default)]
    pub automatic_reconnect: bool,
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,
    /// Wait for PUBACK/PUBCOMP or SUBACK before failing the request
    #[serde(default = "default_timeout")]
    pub ack_timeout_secs: u64,
    /// Only used with `automatic_reconnect = true`
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Transport reconnection backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Ignore `max_attempts` and retry forever
    #[serde(default)]
    pub unlimited: bool,
    /// Delay before each attempt; the last entry is not repeated
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    /// Delay for attempts past the end of `backoff_ms`
    #[serde(default = "default_sustained_delay_ms")]
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            unlimited: false,
            backoff_ms: default_backoff_ms(),
            sustained_delay_ms: default_sustained_delay_ms(),
        }
    }
}

impl ReconnectSection {
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: (!self.unlimited).then_some(self.max_attempts),
            backoff_pattern: self.backoff_ms.clone(),
            sustained_delay: self.sustained_delay_ms,
        }
    }
}

/// Publishing section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardingSection {
    /// Topic used when a forward names none
    pub default_topic: Option<String>,
    /// Wire encoding name, e.g. "ONLY_PAYLOAD"
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Strip the 3-byte text record header from payloads
    #[serde(default)]
    pub trim_header: bool,
    #[serde(default)]
    pub qos: QosLevel,
    #[serde(default)]
    pub retain: bool,
    #[serde(default = "default_true")]
    pub automatic_disconnect_after_publish: bool,
    /// Merged into PAYLOAD_PLUS_ATTRIBUTES payloads
    #[serde(default)]
    pub attributes: Attributes,
}

impl Default for ForwardingSection {
    fn default() -> Self {
        Self {
            default_topic: None,
            encoding: default_encoding(),
            trim_header: false,
            qos: QosLevel::default(),
            retain: false,
            automatic_disconnect_after_publish: true,
            attributes: Attributes::new(),
        }
    }
}

/// Reply subscription section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplySection {
    #[serde(default)]
    pub subscribe_for_reply: bool,
    pub response_topic: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub qos: QosLevel,
    /// Carry replies on the publishing connection
    #[serde(default = "default_true")]
    pub shared_connection: bool,
}

impl Default for ReplySection {
    fn default() -> Self {
        Self {
            subscribe_for_reply: false,
            response_topic: None,
            timeout_secs: default_timeout(),
            qos: QosLevel::default(),
            shared_connection: true,
        }
    }
}

/// Source of TLS trust anchors
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Platform certificate store
    #[default]
    CaSigned,
    /// Single CA certificate loaded from `ca_certificate`
    SelfSigned,
}

/// TLS section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: TlsMode,
    /// CA certificate file (PEM or DER), required in self_signed mode
    pub ca_certificate: Option<PathBuf>,
    /// Minimum protocol version, "TLSv1.2" or "TLSv1.3"
    pub version: Option<String>,
    /// PEM client certificate chain for mutual TLS
    pub client_certificate: Option<PathBuf>,
    /// PEM private key matching `client_certificate`
    pub client_key: Option<PathBuf>,
}

/// MQTT QoS level as written in the file (0, 1 or 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct QosLevel(u8);

impl QosLevel {
    pub fn qos(&self) -> QoS {
        match self.0 {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }
}

impl Default for QosLevel {
    fn default() -> Self {
        Self(1)
    }
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        if level <= 2 {
            Ok(Self(level))
        } else {
            Err(format!("QoS must be 0, 1 or 2, got {level}"))
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(level: QosLevel) -> Self {
        level.0
    }
}

fn default_keep_alive() -> u64 {
    30
}

fn default_timeout() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    ReconnectConfig::default().max_attempts.unwrap_or(10)
}

fn default_backoff_ms() -> Vec<u64> {
    ReconnectConfig::default().backoff_pattern
}

fn default_sustained_delay_ms() -> u64 {
    ReconnectConfig::default().sustained_delay
}

fn default_true() -> bool {
    true
}

fn default_encoding() -> String {
    MessageEncoding::default().as_str().to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to read {path}: {source}")]
    CertificateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID format: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsConfigError),
}

impl ForwarderConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ForwarderConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field that can be checked without touching the filesystem
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.broker.client_id)?;

        let address = self.broker_address()?;
        match (address.tls, self.tls.enabled) {
            (true, false) => {
                return Err(ConfigError::InvalidConfig(format!(
                    "Broker URL {} requires [tls] enabled = true",
                    self.broker.url
                )))
            }
            (false, true) => {
                return Err(ConfigError::InvalidConfig(format!(
                    "TLS is enabled but broker URL {} is plaintext; use ssl:// or mqtts://",
                    self.broker.url
                )))
            }
            _ => {}
        }

        if self.broker.password_env.is_some() && self.broker.username_env.is_none() {
            return Err(ConfigError::InvalidConfig(
                "password_env requires username_env".to_string(),
            ));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.broker.ack_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "ack_timeout_secs must be greater than zero".to_string(),
            ));
        }
        HealthMonitor::validate_connection_config(&self.broker.reconnect.reconnect_config())
            .map_err(|e| ConfigError::InvalidConfig(format!("[broker.reconnect] {e}")))?;

        if let Some(topic) = &self.forwarding.default_topic {
            validate_publish_topic(topic)?;
        }
        self.encoding()?;

        if self.reply.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "reply timeout_secs must be greater than zero".to_string(),
            ));
        }
        match self.reply.response_topic.as_deref() {
            Some("") => {
                return Err(ConfigError::InvalidConfig(
                    "response_topic must not be empty".to_string(),
                ))
            }
            None if self.reply.subscribe_for_reply => {
                return Err(ConfigError::InvalidConfig(
                    "subscribe_for_reply requires a response_topic".to_string(),
                ))
            }
            _ => {}
        }

        if self.tls.enabled {
            self.tls_version()?;
            if self.tls.mode == TlsMode::SelfSigned && self.tls.ca_certificate.is_none() {
                return Err(ConfigError::Tls(TlsConfigError::MissingCaCertificate));
            }
            if self.tls.client_certificate.is_some() != self.tls.client_key.is_some() {
                return Err(ConfigError::InvalidConfig(
                    "client_certificate and client_key must be set together".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn broker_address(&self) -> Result<BrokerAddress, ConfigError> {
        BrokerAddress::parse(&self.broker.url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    pub fn encoding(&self) -> Result<MessageEncoding, ConfigError> {
        self.forwarding
            .encoding
            .parse()
            .map_err(|e: crate::protocol::EncodeError| ConfigError::InvalidConfig(e.to_string()))
    }

    fn tls_version(&self) -> Result<TlsVersion, ConfigError> {
        match &self.tls.version {
            Some(version) => Ok(version.parse::<TlsVersion>()?),
            None => Ok(TlsVersion::default()),
        }
    }

    /// Helper method to get environment variable with error propagation
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Resolve broker credentials from the named environment variables
    ///
    /// A configured variable that is not set is an error.
    pub fn mqtt_credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        let Some(username_env) = &self.broker.username_env else {
            return Ok(None);
        };
        let username = Self::get_env_var_required(username_env)?;
        let password = match &self.broker.password_env {
            Some(password_env) => Self::get_env_var_required(password_env)?,
            None => String::new(),
        };
        Ok(Some(Credentials { username, password }))
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, ConfigError> {
        let path = self.resolve_path(path);
        std::fs::read(&path).map_err(|source| ConfigError::CertificateRead { path, source })
    }

    /// Declarative trust configuration, `None` when TLS is disabled
    ///
    /// Reads the certificate files named in `[tls]`.
    pub fn trust_config(&self) -> Result<Option<TrustConfig>, ConfigError> {
        if !self.tls.enabled {
            return Ok(None);
        }
        let version = self.tls_version()?;

        let trust = match self.tls.mode {
            TlsMode::CaSigned => TrustConfig::ca_signed(version),
            TlsMode::SelfSigned => {
                let path = self
                    .tls
                    .ca_certificate
                    .as_deref()
                    .ok_or(ConfigError::Tls(TlsConfigError::MissingCaCertificate))?;
                TrustConfig::self_signed(self.read_file(path)?, version)?
            }
        };

        let identity = match (&self.tls.client_certificate, &self.tls.client_key) {
            (Some(cert), Some(key)) => {
                Some(ClientIdentity::new(self.read_file(cert)?, self.read_file(key)?))
            }
            _ => None,
        };

        Ok(Some(match identity {
            Some(identity) => trust.with_client_identity(identity),
            None => trust,
        }))
    }

    /// Build the runtime session configuration
    ///
    /// Resolves credentials and builds the TLS context, so every
    /// configuration failure surfaces here before any connection is opened.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let mut mqtt = MqttSettings::new(self.broker_address()?, self.broker.client_id.clone());
        mqtt.credentials = self.mqtt_credentials()?;
        mqtt.keep_alive = Duration::from_secs(self.broker.keep_alive_secs);
        mqtt.clean_session = self.broker.clean_session;
        mqtt.automatic_reconnect = self.broker.automatic_reconnect;
        mqtt.reconnect = self.broker.reconnect.reconnect_config();
        mqtt.trust = match self.trust_config()? {
            Some(trust) => Some(build_trust_context(&trust)?),
            None => None,
        };

        let mut session = SessionConfig::new(mqtt);
        session.default_topic = self.forwarding.default_topic.clone().unwrap_or_default();
        session.publish_qos = self.forwarding.qos.qos();
        session.subscribe_qos = self.reply.qos.qos();
        session.retain = self.forwarding.retain;
        session.connect_timeout = Duration::from_secs(self.broker.connect_timeout_secs);
        session.ack_timeout = Duration::from_secs(self.broker.ack_timeout_secs);
        session.automatic_disconnect_after_publish =
            self.forwarding.automatic_disconnect_after_publish;
        session.encoding = self.encoding()?;
        session.trim_header = self.forwarding.trim_header;
        session.attributes = self.forwarding.attributes.clone();
        session.reply = ReplySettings {
            subscribe_for_reply: self.reply.subscribe_for_reply,
            response_topic: self.reply.response_topic.clone(),
            timeout: Duration::from_secs(self.reply.timeout_secs),
            shared_connection: self.reply.shared_connection,
        };
        Ok(session)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
url = "tcp://localhost:1883"
client_id = "test-reader"

[forwarding]
default_topic = "tags/in"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Validate client id format: [a-zA-Z0-9._-]+
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

/// Publish topics must be non-empty and free of wildcards
fn validate_publish_topic(topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(ConfigError::InvalidConfig(format!(
            "Topic '{topic}' must be non-empty and must not contain wildcards"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_applies_defaults() {
        let config = ForwarderConfig::test_config();

        assert_eq!(config.broker.keep_alive_secs, 30);
        assert!(config.broker.clean_session);
        assert!(!config.broker.automatic_reconnect);
        assert_eq!(config.broker.ack_timeout_secs, 10);
        assert_eq!(
            config.broker.reconnect.reconnect_config(),
            ReconnectConfig::default()
        );
        assert_eq!(config.forwarding.encoding, "ONLY_PAYLOAD");
        assert!(config.forwarding.automatic_disconnect_after_publish);
        assert_eq!(config.forwarding.qos.qos(), QoS::AtLeastOnce);
        assert!(config.reply.shared_connection);
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("reader@dock").is_err());
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("dock-reader_1.a").is_ok());
    }

    #[test]
    fn test_publish_topic_rejects_wildcards() {
        assert!(validate_publish_topic("tags/+/in").is_err());
        assert!(validate_publish_topic("tags/#").is_err());
        assert!(validate_publish_topic("").is_err());
        assert!(validate_publish_topic("tags/in").is_ok());
    }

    #[test]
    fn test_qos_out_of_range_rejected() {
        let toml_content = r#"
[broker]
url = "tcp://localhost:1883"
client_id = "reader"

[forwarding]
qos = 3
"#;
        let result = ForwarderConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_ssl_url_requires_tls_section() {
        let toml_content = r#"
[broker]
url = "ssl://broker.example.com"
client_id = "reader"
"#;
        let result = ForwarderConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_legacy_tls_version_rejected() {
        let toml_content = r#"
[broker]
url = "mqtts://broker.example.com"
client_id = "reader"

[tls]
enabled = true
version = "TLSv1.1"
"#;
        let result = ForwarderConfig::from_toml_str(toml_content);
        assert!(matches!(
            result,
            Err(ConfigError::Tls(TlsConfigError::UnsupportedVersion(_)))
        ));
    }

    #[test]
    fn test_reconnect_section_reaches_transport_settings() {
        let toml_content = r#"
[broker]
url = "tcp://localhost:1883"
client_id = "reader"
automatic_reconnect = true
ack_timeout_secs = 4

[broker.reconnect]
max_attempts = 3
backoff_ms = [100, 200]
sustained_delay_ms = 700
"#;
        let config = ForwarderConfig::from_toml_str(toml_content).unwrap();

        let session = config.session_config().unwrap();

        assert!(session.mqtt.automatic_reconnect);
        assert_eq!(session.mqtt.reconnect.max_attempts, Some(3));
        assert_eq!(session.mqtt.reconnect.backoff_pattern, vec![100, 200]);
        assert_eq!(session.mqtt.reconnect.calculate_max_total_time(), Some(1000));
        assert_eq!(session.ack_timeout, Duration::from_secs(4));
    }

    #[test]
    fn test_unlimited_reconnect_has_no_attempt_cap() {
        let section = ReconnectSection {
            unlimited: true,
            ..ReconnectSection::default()
        };

        let reconnect = section.reconnect_config();

        assert_eq!(reconnect.max_attempts, None);
        assert_eq!(reconnect.calculate_max_total_time(), None);
    }

    #[test]
    fn test_invalid_reconnect_section_rejected() {
        for section in ["max_attempts = 0", "sustained_delay_ms = 0"] {
            let toml_content = format!(
                r#"
[broker]
url = "tcp://localhost:1883"
client_id = "reader"

[broker.reconnect]
{section}
"#
            );
            let result = ForwarderConfig::from_toml_str(&toml_content);
            assert!(
                matches!(result, Err(ConfigError::InvalidConfig(ref msg)) if msg.contains("reconnect")),
                "{section} should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_ack_timeout_rejected() {
        let toml_content = r#"
[broker]
url = "tcp://localhost:1883"
client_id = "reader"
ack_timeout_secs = 0
"#;
        let result = ForwarderConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_session_config_conversion() {
        let toml_content = r#"
[broker]
url = "tcp://localhost:1883"
client_id = "reader"
connect_timeout_secs = 3

[forwarding]
default_topic = "tags/in"
encoding = "payload-plus-attributes"
qos = 0

[forwarding.attributes]
site = "dock-3"

[reply]
subscribe_for_reply = true
response_topic = "tags/reply"
timeout_secs = 2
qos = 2
shared_connection = false
"#;
        let config = ForwarderConfig::from_toml_str(toml_content).unwrap();

        let session = config.session_config().unwrap();

        assert_eq!(session.default_topic, "tags/in");
        assert_eq!(session.encoding, MessageEncoding::PayloadPlusAttributes);
        assert_eq!(session.publish_qos, QoS::AtMostOnce);
        assert_eq!(session.subscribe_qos, QoS::ExactlyOnce);
        assert_eq!(session.connect_timeout, Duration::from_secs(3));
        assert_eq!(session.attributes.get("site").map(String::as_str), Some("dock-3"));
        assert_eq!(session.reply.response_topic.as_deref(), Some("tags/reply"));
        assert_eq!(session.reply.timeout, Duration::from_secs(2));
        assert!(!session.reply.shared_connection);
        assert!(session.mqtt.trust.is_none());
        assert!(session.mqtt.credentials.is_none());
    }
}
