//! Mutual-TLS identity provisioning.
//!
//! Turns optional PEM material (CA certificate, client certificate, client
//! private key, key password) into a [`SocketFactory`] the MQTT transport can
//! use. The pipeline runs synchronously, before connect:
//!
//! 1. parse the CA and client certificates
//! 2. parse the client key, decrypting PKCS#8 `ENCRYPTED PRIVATE KEY` objects
//! 3. generate a fresh [`StorePassword`](store::StorePassword)
//! 4. load the CA into a [`TrustStore`](store::TrustStore) and build trust managers
//! 5. load certificate and key into a [`KeyStore`](store::KeyStore) and build
//!    key managers with the same password
//! 6. assemble the `rustls::ClientConfig`
//!
//! CA-only and certificate-only identities are valid. Without a CA the
//! bundled web PKI roots are trusted; without key managers no client
//! certificate is presented.
//!
//! ```ignore
//! let identity = TlsIdentity::new()
//!     .with_ca(PemSource::path("/etc/mqtt/ca.crt"))
//!     .with_certificate(PemSource::path("/etc/mqtt/client.crt"))
//!     .with_key(PemSource::path("/etc/mqtt/client.key"))
//!     .with_password("secret");
//!
//! let factory = build_socket_factory(&identity)?.expect("material supplied");
//! assert!(factory.has_key_managers());
//! ```

use std::{fmt, sync::Arc};

use rumqttc::{TlsConfiguration, Transport};
use rustls::{ClientConfig, RootCertStore};
use tracing::{debug, info, warn};

use crate::error::TlsError;

pub mod pem;
pub mod store;

pub use pem::PemSource;

use store::{
    KeyManagers, KeyStore, StorePassword, TrustManagers, TrustStore, CA_ALIAS, CERTIFICATE_ALIAS,
    PRIVATE_KEY_ALIAS,
};

/// Optional PEM sources that make up a client TLS identity.
#[derive(Clone, Default)]
pub struct TlsIdentity {
    pub ca: Option<PemSource>,
    pub certificate: Option<PemSource>,
    pub key: Option<PemSource>,
    pub password: Option<String>,
}

impl TlsIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca(mut self, source: PemSource) -> Self {
        self.ca = Some(source);
        self
    }

    pub fn with_certificate(mut self, source: PemSource) -> Self {
        self.certificate = Some(source);
        self
    }

    pub fn with_key(mut self, source: PemSource) -> Self {
        self.key = Some(source);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// True if no PEM source is set at all.
    pub fn is_empty(&self) -> bool {
        self.ca.is_none() && self.certificate.is_none() && self.key.is_none()
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("ca", &self.ca)
            .field("certificate", &self.certificate)
            .field("key", &self.key)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A TLS context ready to be handed to the MQTT transport.
#[derive(Clone)]
pub struct SocketFactory {
    config: Arc<ClientConfig>,
    trust_anchors: Option<usize>,
    client_auth: bool,
}

impl SocketFactory {
    /// True if trust anchors came from a supplied CA rather than the
    /// bundled web PKI roots.
    pub fn has_trust_managers(&self) -> bool {
        self.trust_anchors.is_some()
    }

    /// True if a client certificate is presented during the handshake.
    pub fn has_key_managers(&self) -> bool {
        self.client_auth
    }

    /// Number of trust anchors loaded from the supplied CA.
    pub fn trust_anchor_count(&self) -> Option<usize> {
        self.trust_anchors
    }

    pub fn tls_config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    /// Returns a copy of this factory whose TLS context advertises `protocols`
    /// through ALPN.
    pub fn with_alpn(&self, protocols: Vec<Vec<u8>>) -> Self {
        let mut config = (*self.config).clone();
        config.alpn_protocols = protocols;
        Self {
            config: Arc::new(config),
            ..self.clone()
        }
    }

    /// Wraps the TLS context into an `rumqttc` transport.
    pub fn transport(&self) -> Transport {
        Transport::Tls(TlsConfiguration::Rustls(self.config.clone()))
    }
}

impl fmt::Debug for SocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketFactory")
            .field("trust_anchors", &self.trust_anchors)
            .field("client_auth", &self.client_auth)
            .field("alpn", &self.config.alpn_protocols.len())
            .finish()
    }
}

/// Builds a socket factory from `identity`.
///
/// Returns `Ok(None)` when no PEM source is set. A key without a client
/// certificate is ignored with a warning.
///
/// # Errors
/// - `Io` if a source cannot be read
/// - `CertificateParse` if PEM input is malformed
/// - `KeyDecryption` if an encrypted key has no or the wrong password
/// - `UnsupportedKey` if the key cannot be used for signing
pub fn build_socket_factory(identity: &TlsIdentity) -> Result<Option<SocketFactory>, TlsError> {
    if identity.is_empty() {
        return Ok(None);
    }

    let ca = identity.ca.as_ref().map(pem::read_certificate).transpose()?;
    let certificate = identity
        .certificate
        .as_ref()
        .map(pem::read_certificate)
        .transpose()?;

    let key = match (&certificate, &identity.key) {
        (Some(_), Some(source)) => Some(pem::read_private_key(
            source,
            identity.password.as_deref(),
        )?),
        (Some(_), None) => {
            warn!("Client certificate supplied without a key, client authentication disabled");
            None
        }
        (None, Some(source)) => {
            warn!(
                "Client key {} supplied without a certificate, ignoring it",
                source.name()
            );
            None
        }
        (None, None) => None,
    };

    let password = StorePassword::generate();

    let trust_managers = match ca {
        Some(ca) => {
            let mut trust_store = TrustStore::new();
            trust_store.set_certificate_entry(CA_ALIAS, ca);
            Some(TrustManagers::init(&trust_store)?)
        }
        None => None,
    };

    let key_managers = match (certificate, key) {
        (Some(certificate), Some(key)) => {
            let mut key_store = KeyStore::new();
            key_store.set_certificate_entry(CERTIFICATE_ALIAS, certificate);
            let chain = key_store
                .certificate(CERTIFICATE_ALIAS)
                .cloned()
                .into_iter()
                .collect();
            key_store.set_key_entry(PRIVATE_KEY_ALIAS, key, chain, &password);
            Some(KeyManagers::init(&key_store, &password)?)
        }
        _ => None,
    };

    let trust_anchors = trust_managers.as_ref().map(TrustManagers::len);
    let roots = match trust_managers {
        Some(managers) => managers.into_roots(),
        None => {
            debug!("No CA supplied, trusting bundled web PKI roots");
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            roots
        }
    };

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let client_auth = key_managers.is_some();
    let config = match key_managers {
        Some(managers) => {
            debug!(
                "Client key algorithm: {:?}, chain of {}",
                managers.algorithm(),
                managers.chain_len()
            );
            let (chain, key) = managers.into_parts();
            builder.with_client_auth_cert(chain, key)?
        }
        None => builder.with_no_client_auth(),
    };

    info!(
        "TLS context ready (custom CA: {}, client auth: {})",
        trust_anchors.is_some(),
        client_auth
    );

    Ok(Some(SocketFactory {
        config: Arc::new(config),
        trust_anchors,
        client_auth,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_identity_builds_nothing() {
        assert!(build_socket_factory(&TlsIdentity::new()).unwrap().is_none());
    }

    #[test]
    fn test_identity_debug_redacts_password() {
        let identity = TlsIdentity::new().with_password("hunter2");
        let debug = format!("{:?}", identity);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_unreadable_ca_fails_fast() {
        let identity = TlsIdentity::new().with_ca(PemSource::path("/nonexistent/ca.crt"));
        let err = build_socket_factory(&identity).unwrap_err();
        assert!(matches!(err, TlsError::Io { .. }));
    }

    #[test]
    fn test_key_without_certificate_is_not_parsed() {
        // Garbage key content would fail if it were parsed
        let identity = TlsIdentity::new().with_key(PemSource::memory("client.key", b"nope".to_vec()));
        let factory = build_socket_factory(&identity).unwrap().unwrap();
        assert!(!factory.has_key_managers());
        assert!(!factory.has_trust_managers());
    }
}
