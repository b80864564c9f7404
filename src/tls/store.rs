//! In-memory trust and key stores used while a TLS context is assembled.
//!
//! The stores live only for the duration of one identity build. Key entries
//! are protected by an ephemeral [`StorePassword`] generated per build, so the
//! private key can only be released by the code that created the store.

use std::{collections::BTreeMap, fmt, sync::Arc};

use rand::{rngs::OsRng, RngCore};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    sign::SigningKey,
    RootCertStore,
};
use zeroize::Zeroizing;

use crate::error::TlsError;

/// Alias of the CA certificate inside the trust store.
pub const CA_ALIAS: &str = "ca-certificate";
/// Alias of the client certificate inside the key store.
pub const CERTIFICATE_ALIAS: &str = "certificate";
/// Alias of the client private key entry inside the key store.
pub const PRIVATE_KEY_ALIAS: &str = "private-key";

const PASSWORD_LEN: usize = 32;

/// One-time password protecting an in-memory key store.
///
/// Drawn from the operating system CSPRNG, wiped on drop, and never printed.
pub struct StorePassword(Zeroizing<[u8; PASSWORD_LEN]>);

impl StorePassword {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; PASSWORD_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self(bytes)
    }

    fn matches(&self, other: &[u8; PASSWORD_LEN]) -> bool {
        // Constant time
        self.0
            .iter()
            .zip(other.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for StorePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorePassword(<redacted>)")
    }
}

/// Trusted CA certificates keyed by alias.
#[derive(Debug, Default)]
pub struct TrustStore {
    certificates: BTreeMap<String, CertificateDer<'static>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_certificate_entry(&mut self, alias: &str, certificate: CertificateDer<'static>) {
        self.certificates.insert(alias.to_string(), certificate);
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

struct KeyEntry {
    key: PrivateKeyDer<'static>,
    chain: Vec<CertificateDer<'static>>,
    protection: Zeroizing<[u8; PASSWORD_LEN]>,
}

/// Client certificates and password-protected private key entries.
#[derive(Default)]
pub struct KeyStore {
    certificates: BTreeMap<String, CertificateDer<'static>>,
    keys: BTreeMap<String, KeyEntry>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_certificate_entry(&mut self, alias: &str, certificate: CertificateDer<'static>) {
        self.certificates.insert(alias.to_string(), certificate);
    }

    /// Stores `key` with its certificate chain under `alias`, protected by
    /// `password`.
    pub fn set_key_entry(
        &mut self,
        alias: &str,
        key: PrivateKeyDer<'static>,
        chain: Vec<CertificateDer<'static>>,
        password: &StorePassword,
    ) {
        self.keys.insert(
            alias.to_string(),
            KeyEntry {
                key,
                chain,
                protection: Zeroizing::new(*password.0),
            },
        );
    }

    pub fn certificate(&self, alias: &str) -> Option<&CertificateDer<'static>> {
        self.certificates.get(alias)
    }

    fn key_entry(&self, alias: &str, password: &StorePassword) -> Result<&KeyEntry, TlsError> {
        let entry = self
            .keys
            .get(alias)
            .ok_or_else(|| TlsError::KeyStore(format!("no key entry under alias '{alias}'")))?;
        if !password.matches(&entry.protection) {
            return Err(TlsError::KeyStore(format!(
                "wrong store password for alias '{alias}'"
            )));
        }
        Ok(entry)
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("certificates", &self.certificates.keys().collect::<Vec<_>>())
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Trust anchors ready for the TLS context.
#[derive(Debug, Clone)]
pub struct TrustManagers {
    roots: RootCertStore,
}

impl TrustManagers {
    /// Loads every certificate of `store` as a trust anchor.
    pub fn init(store: &TrustStore) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        for (alias, certificate) in &store.certificates {
            roots.add(certificate.clone()).map_err(|e| {
                TlsError::CertificateParse(format!("trust entry '{alias}' rejected: {e}"))
            })?;
        }
        Ok(Self { roots })
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub(crate) fn into_roots(self) -> RootCertStore {
        self.roots
    }
}

/// Client identity (certificate chain and signing key) for the TLS context.
pub struct KeyManagers {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    signer: Arc<dyn SigningKey>,
}

impl KeyManagers {
    /// Releases the private key entry from `store` using `password` and
    /// checks that the TLS engine can sign with it.
    pub fn init(store: &KeyStore, password: &StorePassword) -> Result<Self, TlsError> {
        let entry = store.key_entry(PRIVATE_KEY_ALIAS, password)?;
        let signer = rustls::crypto::ring::sign::any_supported_type(&entry.key)
            .map_err(|e| TlsError::UnsupportedKey(e.to_string()))?;

        Ok(Self {
            chain: entry.chain.clone(),
            key: entry.key.clone_key(),
            signer,
        })
    }

    /// Signature algorithm of the client key.
    pub fn algorithm(&self) -> rustls::SignatureAlgorithm {
        self.signer.algorithm()
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    pub(crate) fn into_parts(self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        (self.chain, self.key)
    }
}

impl fmt::Debug for KeyManagers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManagers")
            .field("chain_len", &self.chain.len())
            .field("algorithm", &self.signer.algorithm())
            .finish()
    }
}
