//! PEM sources and the parsers for certificates and (possibly encrypted) keys.

use std::{
    fmt, fs,
    io::{BufReader, Read},
    path::PathBuf,
};

use pkcs8::{der::Document, EncryptedPrivateKeyInfo, PrivateKeyInfo};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls_pemfile::Item;
use tracing::debug;

use crate::error::TlsError;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";
const LEGACY_ENCRYPTION_HEADER: &str = "Proc-Type: 4,ENCRYPTED";

/// Where a PEM object is read from.
#[derive(Clone)]
pub enum PemSource {
    /// A file, opened and closed around each parse.
    Path(PathBuf),
    /// PEM text already held in memory.
    Memory { name: String, pem: Vec<u8> },
}

impl PemSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        PemSource::Path(path.into())
    }

    pub fn memory(name: impl Into<String>, pem: impl Into<Vec<u8>>) -> Self {
        PemSource::Memory {
            name: name.into(),
            pem: pem.into(),
        }
    }

    /// Human-readable name used in errors and logs.
    pub fn name(&self) -> String {
        match self {
            PemSource::Path(path) => path.display().to_string(),
            PemSource::Memory { name, .. } => name.clone(),
        }
    }

    fn read_all(&self) -> Result<Vec<u8>, TlsError> {
        match self {
            PemSource::Path(path) => {
                let file = fs::File::open(path).map_err(|error| self.io_error(error))?;
                let mut reader = BufReader::new(file);
                let mut contents = Vec::new();
                reader
                    .read_to_end(&mut contents)
                    .map_err(|error| self.io_error(error))?;
                Ok(contents)
            }
            PemSource::Memory { pem, .. } => Ok(pem.clone()),
        }
    }

    fn io_error(&self, error: std::io::Error) -> TlsError {
        TlsError::Io {
            source_name: self.name(),
            error,
        }
    }
}

// Memory sources may hold key material
impl fmt::Debug for PemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PemSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            PemSource::Memory { name, pem } => f
                .debug_struct("Memory")
                .field("name", name)
                .field("len", &pem.len())
                .finish(),
        }
    }
}

/// Reads the first PEM object of `source`, which must be an X.509 certificate.
pub fn read_certificate(source: &PemSource) -> Result<CertificateDer<'static>, TlsError> {
    let contents = source.read_all()?;
    let mut reader = contents.as_slice();

    match rustls_pemfile::read_one(&mut reader) {
        Ok(Some(Item::X509Certificate(cert))) => {
            debug!("Parsed certificate from {}", source.name());
            Ok(cert)
        }
        Ok(Some(_)) => Err(TlsError::CertificateParse(format!(
            "{}: first PEM object is not a certificate",
            source.name()
        ))),
        Ok(None) => Err(TlsError::CertificateParse(format!(
            "{}: no PEM certificate found",
            source.name()
        ))),
        Err(e) => Err(TlsError::CertificateParse(format!(
            "{}: {}",
            source.name(),
            e
        ))),
    }
}

/// Reads a private key from `source`.
///
/// PKCS#8 `ENCRYPTED PRIVATE KEY` objects are decrypted with `password`;
/// PKCS#1, PKCS#8 and SEC1 keys are used as they are. Keys protected with
/// legacy OpenSSL encryption headers are rejected.
pub fn read_private_key(
    source: &PemSource,
    password: Option<&str>,
) -> Result<PrivateKeyDer<'static>, TlsError> {
    let contents = source.read_all()?;
    let text = std::str::from_utf8(&contents).map_err(|_| {
        TlsError::CertificateParse(format!("{}: key file is not PEM text", source.name()))
    })?;

    if text.contains(LEGACY_ENCRYPTION_HEADER) {
        return Err(TlsError::UnsupportedKey(format!(
            "{}: legacy OpenSSL key encryption is not supported, convert with `openssl pkcs8 -topk8`",
            source.name()
        )));
    }

    if let Some(block) = pem_block(text, ENCRYPTED_KEY_LABEL) {
        let password = password.ok_or_else(|| {
            TlsError::KeyDecryption(format!(
                "{}: key is encrypted but no password was supplied",
                source.name()
            ))
        })?;
        return decrypt_private_key(source, block, password);
    }

    let mut reader = contents.as_slice();
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(Some(Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(Some(Item::Sec1Key(key))) => return Ok(PrivateKeyDer::Sec1(key)),
            Ok(Some(Item::X509Certificate(_))) => {
                return Err(TlsError::CertificateParse(format!(
                    "{}: expected a private key, found a certificate",
                    source.name()
                )))
            }
            // Parameter blocks and other sections preceding the key
            Ok(Some(_)) => continue,
            Ok(None) => {
                return Err(TlsError::CertificateParse(format!(
                    "{}: no PEM private key found",
                    source.name()
                )))
            }
            Err(e) => {
                return Err(TlsError::CertificateParse(format!(
                    "{}: {}",
                    source.name(),
                    e
                )))
            }
        }
    }
}

fn decrypt_private_key(
    source: &PemSource,
    block: &str,
    password: &str,
) -> Result<PrivateKeyDer<'static>, TlsError> {
    let (_, document) = Document::from_pem(block).map_err(|e| {
        TlsError::CertificateParse(format!("{}: {}", source.name(), e))
    })?;
    let encrypted = EncryptedPrivateKeyInfo::try_from(document.as_bytes()).map_err(|e| {
        TlsError::CertificateParse(format!("{}: {}", source.name(), e))
    })?;

    let decrypted = encrypted.decrypt(password).map_err(|e| {
        TlsError::KeyDecryption(format!("{}: {}", source.name(), e))
    })?;

    // A wrong password can still yield well-padded garbage
    PrivateKeyInfo::try_from(decrypted.as_bytes()).map_err(|_| {
        TlsError::KeyDecryption(format!(
            "{}: decrypted data is not a private key, the password is likely wrong",
            source.name()
        ))
    })?;

    debug!("Decrypted private key from {}", source.name());
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        decrypted.as_bytes().to_vec(),
    )))
}

/// Returns the complete `-----BEGIN label-----` ... `-----END label-----`
/// block of `text`, if present.
fn pem_block<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");

    let start = text.find(&begin)?;
    let stop = text[start..].find(&end)? + start + end.len();
    Some(&text[start..stop])
}
