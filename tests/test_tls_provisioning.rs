//! TLS provisioning through configuration and session setup
//!
//! Every failure here must surface before a socket is opened.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tag_forwarder::config::{ConfigError, ForwarderConfig};
use tag_forwarder::session::{Session, SessionConfig};
use tag_forwarder::transport::mqtt::{configure_mqtt_options, BrokerAddress, MqttSettings};
use tag_forwarder::transport::{
    build_trust_context, TlsConfigError, TlsVersion, TransportError, TrustConfig,
};
use tag_forwarder::ForwarderError;
use tempfile::TempDir;

const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

fn fixture(name: &str) -> Vec<u8> {
    fs::read(Path::new(FIXTURES).join(name)).unwrap()
}

/// Write a config next to copies of the given fixtures
fn config_dir(toml: &str, files: &[(&str, Vec<u8>)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("forwarder.toml"), toml).unwrap();
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

const SELF_SIGNED_TOML: &str = r#"
[broker]
url = "ssl://broker.internal:8883"
client_id = "dock-reader"

[forwarding]
default_topic = "tags/in"

[tls]
enabled = true
mode = "self_signed"
ca_certificate = "ca.pem"
version = "TLSv1.3"
"#;

#[test]
fn test_self_signed_config_builds_trust_context() {
    let dir = config_dir(SELF_SIGNED_TOML, &[("ca.pem", fixture("ca.pem"))]);
    let config = ForwarderConfig::load_from_file(&dir.path().join("forwarder.toml")).unwrap();

    let session = config.session_config().unwrap();

    let trust = session.mqtt.trust.as_ref().unwrap();
    assert_eq!(trust.protocol_versions(), &[TlsVersion::Tls13]);
    assert!(!trust.is_mutual());
    assert!(configure_mqtt_options(&session.mqtt).is_ok());
}

#[test]
fn test_empty_ca_file_is_a_configuration_error() {
    let dir = config_dir(SELF_SIGNED_TOML, &[("ca.pem", Vec::new())]);
    let config = ForwarderConfig::load_from_file(&dir.path().join("forwarder.toml")).unwrap();

    let result = config.session_config();

    assert!(matches!(
        result,
        Err(ConfigError::Tls(TlsConfigError::MissingCaCertificate))
    ));
}

#[test]
fn test_missing_ca_file_names_the_path() {
    let dir = config_dir(SELF_SIGNED_TOML, &[]);
    let config = ForwarderConfig::load_from_file(&dir.path().join("forwarder.toml")).unwrap();

    let error = config.session_config().unwrap_err();

    assert!(matches!(error, ConfigError::CertificateRead { .. }));
    assert!(error.to_string().contains("ca.pem"));
}

#[test]
fn test_mutual_tls_with_der_anchor() {
    let toml = r#"
[broker]
url = "mqtts://broker.internal"
client_id = "dock-reader"

[tls]
enabled = true
mode = "self_signed"
ca_certificate = "ca.der"
client_certificate = "client.pem"
client_key = "client.key"
"#;
    let dir = config_dir(
        toml,
        &[
            ("ca.der", fixture("ca.der")),
            ("client.pem", fixture("client.pem")),
            ("client.key", fixture("client.key")),
        ],
    );
    let config = ForwarderConfig::load_from_file(&dir.path().join("forwarder.toml")).unwrap();

    let session = config.session_config().unwrap();

    let trust = session.mqtt.trust.as_ref().unwrap();
    assert!(trust.is_mutual());
    assert_eq!(
        trust.protocol_versions(),
        &[TlsVersion::Tls12, TlsVersion::Tls13]
    );
    assert_eq!(session.mqtt.address.port, 8883);
}

#[test]
fn test_client_key_without_certificate_rejected() {
    let toml = r#"
[broker]
url = "ssl://broker.internal"
client_id = "dock-reader"

[tls]
enabled = true
client_key = "client.key"
"#;

    let result = ForwarderConfig::from_toml_str(toml);

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_garbage_ca_certificate_rejected() {
    let trust = TrustConfig::self_signed(b"not a certificate".to_vec(), TlsVersion::Tls12).unwrap();

    let result = build_trust_context(&trust);

    assert!(matches!(result, Err(TlsConfigError::InvalidCaCertificate(_))));
}

#[test]
fn test_trust_context_is_reusable() {
    let trust = TrustConfig::self_signed(fixture("ca.pem"), TlsVersion::Tls12).unwrap();
    let context = build_trust_context(&trust).unwrap();
    let address = BrokerAddress::parse("ssl://broker.internal").unwrap();

    let mut first = MqttSettings::new(address.clone(), "reader-a");
    first.trust = Some(context.clone());
    let mut second = MqttSettings::new(address, "reader-b");
    second.trust = Some(context.clone());

    assert!(configure_mqtt_options(&first).is_ok());
    assert!(configure_mqtt_options(&second).is_ok());
    assert!(Arc::ptr_eq(
        &context.client_config(),
        &second.trust.unwrap().client_config()
    ));
}

#[tokio::test]
async fn test_session_refuses_tls_url_without_trust_context() {
    let address = BrokerAddress::parse("ssl://broker.internal").unwrap();
    let config = SessionConfig::new(MqttSettings::new(address, "dock-reader"));
    let (results_tx, _results_rx) = tokio::sync::mpsc::unbounded_channel();

    let result = Session::open(config, Arc::new(results_tx));

    match result {
        Err(error @ ForwarderError::Transport(TransportError::TlsRequired(_))) => {
            assert!(error.is_configuration());
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("session opened without a trust context"),
    }
}
