//! Error types for the bridge, the TLS identity pipeline and operation outcomes.
//!
//! Two families of errors exist and they travel on different paths:
//!
//! **Synchronous errors** (`BridgeError`, `TlsError`) are returned directly
//! from the call that caused them, before anything touches the network:
//! - `UnsupportedPayloadType` / `InvalidQos`: a publish value could not be
//!   turned into a message
//! - `Tls(..)`: certificate or key material is malformed, encrypted with a
//!   different password, or uses an algorithm the TLS engine cannot sign with
//! - `Config(..)`: configuration could not be read, parsed or validated
//!
//! **Asynchronous outcomes** (`OperationError`) are never returned as `Err`.
//! They are carried inside the [`Token`](crate::Token) delivered on the
//! operation's result channel, so success and failure share one delivery path:
//!
//! ```ignore
//! let token = bridge.publish("sensors/temp", payload)?.await;
//! if let Some(cause) = token.cause() {
//!     warn!("publish failed: {}", cause);
//! }
//! ```

use thiserror::Error;

use crate::config::ConfigError;

/// The unified error type for synchronous failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A publish value has no byte representation.
    ///
    /// Only raw bytes and byte buffers are accepted as payloads; text,
    /// numbers and records without a `payload` field are rejected rather
    /// than encoded implicitly.
    #[error("Unsupported payload type: {0}")]
    UnsupportedPayloadType(&'static str),

    /// A structured publish record carried a `qos` outside 0..=2.
    #[error("Invalid QoS value {0}, must be 0, 1, or 2")]
    InvalidQos(i64),

    /// TLS identity material could not be turned into a socket factory.
    #[error("TLS identity error: {0}")]
    Tls(#[from] TlsError),

    /// Configuration loading or validation failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Configuration values were rejected by validation rules.
    #[error("Configuration validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Failures of the TLS identity pipeline.
///
/// Every variant is raised while connection options are being built, before
/// `connect` is ever issued. None of them degrade silently to a plain or
/// unauthenticated connection.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM source could not be opened or read.
    #[error("Failed to read {source_name}: {error}")]
    Io {
        source_name: String,
        #[source]
        error: std::io::Error,
    },

    /// PEM input is malformed or does not contain the expected object.
    #[error("Certificate parse error: {0}")]
    CertificateParse(String),

    /// An encrypted private key could not be decrypted: the password is
    /// missing or wrong, or the ciphertext is corrupted.
    #[error("Key decryption error: {0}")]
    KeyDecryption(String),

    /// The private key uses an algorithm or encoding the TLS engine cannot use.
    #[error("Unsupported private key: {0}")]
    UnsupportedKey(String),

    /// An in-memory store rejected an operation (unknown alias or wrong
    /// store password).
    #[error("Key store error: {0}")]
    KeyStore(String),

    /// The TLS engine refused the assembled context.
    #[error("TLS context error: {0}")]
    Context(#[from] rustls::Error),
}

/// Failure cause of an asynchronous operation, carried inside a token.
///
/// Cloneable so a token can be inspected by several observers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// The broker answered CONNECT with a refusal code.
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),

    /// The network connection failed or was closed with an error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection went away while the operation was still in flight.
    #[error("Connection lost before the operation completed")]
    ConnectionLost,

    /// The broker returned a failure code for a subscription request.
    #[error("Subscription to '{0}' rejected by broker")]
    SubscriptionRejected(String),

    /// The client refused to issue the request (not connected, queue full, ...).
    #[error("Request not issued: {0}")]
    Request(String),

    /// The listener was released without ever being completed.
    #[error("Operation abandoned before completion")]
    Abandoned,
}
