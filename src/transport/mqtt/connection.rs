//! Pure connection state management for the MQTT transport
//!
//! This module contains pure functions for broker address parsing,
//! connection state tracking and client option construction.

use crate::transport::tls::TrustContext;
use crate::transport::TransportError;
use rumqttc::MqttOptions;
use std::time::Duration;
use url::Url;

pub const DEFAULT_PLAINTEXT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Connection state for an MQTT link
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Connect issued, waiting for the broker acknowledgement
    Connecting,
    /// Acknowledged and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Connection dropped, client reconnecting (attempt count)
    Reconnecting(u32),
    /// Reconnection attempts exhausted
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Custom backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            backoff_pattern: vec![250, 500, 1000, 2500],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Calculate the maximum total time for all reconnection attempts
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Backoff delay in milliseconds for the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Parsed broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Parse `tcp://`, `mqtt://` (plaintext) or `ssl://`, `mqtts://` (TLS) URLs
    pub fn parse(broker_url: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidBrokerUrl(broker_url.to_string());
        let url = Url::parse(broker_url).map_err(|_| invalid())?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" => true,
            _ => return Err(invalid()),
        };
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let port = url.port().unwrap_or(if tls {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PLAINTEXT_PORT
        });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Username and password presented on connect
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to open one MQTT connection
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub address: BrokerAddress,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub automatic_reconnect: bool,
    pub reconnect: ReconnectConfig,
    pub trust: Option<TrustContext>,
}

impl MqttSettings {
    pub fn new(address: BrokerAddress, client_id: impl Into<String>) -> Self {
        Self {
            address,
            client_id: client_id.into(),
            credentials: None,
            keep_alive: Duration::from_secs(30),
            clean_session: true,
            automatic_reconnect: false,
            reconnect: ReconnectConfig::default(),
            trust: None,
        }
    }

    /// Same connection parameters under a different client id
    pub fn with_client_id(&self, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..self.clone()
        }
    }
}

/// Pure function to build client options from settings
pub fn configure_mqtt_options(settings: &MqttSettings) -> Result<MqttOptions, TransportError> {
    let address = &settings.address;
    if settings.client_id.is_empty() || settings.client_id.starts_with(char::is_whitespace) {
        return Err(TransportError::InvalidClientId(settings.client_id.clone()));
    }
    let mut mqtt_options =
        MqttOptions::new(settings.client_id.clone(), address.host.clone(), address.port);

    if address.tls {
        let trust = settings
            .trust
            .as_ref()
            .ok_or_else(|| TransportError::TlsRequired(address.to_string()))?;
        mqtt_options.set_transport(trust.transport());
    }

    if let Some(credentials) = &settings.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    // rumqttc panics on sub-second keep-alive values other than zero
    let keep_alive = if settings.keep_alive.is_zero() {
        Duration::ZERO
    } else {
        settings.keep_alive.max(Duration::from_secs(1))
    };
    mqtt_options.set_keep_alive(keep_alive);
    mqtt_options.set_clean_session(settings.clean_session);

    Ok(mqtt_options)
}
