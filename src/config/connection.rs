//! Connection configuration surface.
//!
//! Field names follow the camelCase option names used by broker
//! configuration files:
//!
//! ```toml
//! timeout = 10
//! keepAlive = 30
//! caFile = "/etc/mqtt/ca.crt"
//! certFile = "/etc/mqtt/client.crt"
//! keyFile = "/etc/mqtt/client.key"
//! keyPassword = "secret"
//! username = "sensor-17"
//! password = "secret"
//! cleanSession = true
//!
//! [sslProperties]
//! alpn = "mqtt"
//! ```
//!
//! Every field is optional; an absent field leaves the client default in place.

use std::{collections::BTreeMap, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Flat, optional connection settings.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectConfig {
    /// Connection timeout in seconds.
    #[validate(range(min = 1, max = 300))]
    pub timeout: Option<u64>,

    /// Keep-alive interval in seconds.
    #[validate(range(max = 65535))]
    pub keep_alive: Option<u64>,

    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Password for an encrypted client key.
    pub key_password: Option<String>,

    #[validate(length(min = 1))]
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: Option<bool>,

    /// Raw TLS properties, passed on verbatim.
    pub ssl_properties: BTreeMap<String, String>,
}

impl ConnectConfig {
    /// True if any of the PEM file options is set.
    pub fn has_tls_material(&self) -> bool {
        self.ca_file.is_some() || self.cert_file.is_some() || self.key_file.is_some()
    }
}

impl fmt::Debug for ConnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |secret: &Option<String>| secret.as_ref().map(|_| "<redacted>");
        f.debug_struct("ConnectConfig")
            .field("timeout", &self.timeout)
            .field("keep_alive", &self.keep_alive)
            .field("ca_file", &self.ca_file)
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("key_password", &redact(&self.key_password))
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("clean_session", &self.clean_session)
            .field("ssl_properties", &self.ssl_properties)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case_keys() {
        let config: ConnectConfig = toml::from_str(
            r#"
            timeout = 10
            keepAlive = 30
            caFile = "/etc/mqtt/ca.crt"
            keyPassword = "secret"
            cleanSession = false

            [sslProperties]
            alpn = "mqtt"
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout, Some(10));
        assert_eq!(config.keep_alive, Some(30));
        assert_eq!(config.ca_file, Some(PathBuf::from("/etc/mqtt/ca.crt")));
        assert_eq!(config.key_password.as_deref(), Some("secret"));
        assert_eq!(config.clean_session, Some(false));
        assert_eq!(config.ssl_properties.get("alpn").map(String::as_str), Some("mqtt"));
        assert!(config.has_tls_material());
    }

    #[test]
    fn test_empty_config_is_valid_and_plain() {
        let config = ConnectConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.has_tls_material());
    }

    #[test]
    fn test_out_of_range_values_fail_validation() {
        let config = ConnectConfig {
            timeout: Some(0),
            keep_alive: Some(70_000),
            ..ConnectConfig::default()
        };
        let err = config.validate().unwrap_err();
        let fields = err.field_errors();
        assert!(fields.contains_key("timeout"));
        assert!(fields.contains_key("keep_alive"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = ConnectConfig {
            password: Some("broker-secret".into()),
            key_password: Some("key-secret".into()),
            ..ConnectConfig::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("broker-secret"));
        assert!(!debug.contains("key-secret"));
    }
}
