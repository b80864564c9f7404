//! # mqtt-channels: channel-based async façade over MQTT
//!
//! MQTT clients built around completion callbacks are awkward to compose:
//! every operation needs its own listener, and message delivery arrives on a
//! different callback than the subscribe that caused it. This crate wraps
//! such a client behind a [`Bridge`] whose operations all return channels:
//!
//! - one-shot operations (connect, disconnect, publish, unsubscribe) return a
//!   [`TokenFuture`] that resolves exactly once with a [`Token`]
//! - subscribe returns a [`Subscription`], a `Stream` of [`Delivery`] values
//!
//! It also provisions mutual-TLS identity material (CA certificate, client
//! certificate, optionally encrypted client key) into a
//! [`SocketFactory`](tls::SocketFactory) for the transport.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use futures_util::StreamExt;
//! use mqtt_channels::{
//!     build_connect_options, Bridge, Config, RumqttClient, SubscribeOptions, Value,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("mqtt.toml".as_ref())?;
//!     let options = build_connect_options(&config.connection)?;
//!
//!     let bridge = Bridge::new(Arc::new(RumqttClient::with_generated_id("broker.local", 8883)));
//!     let token = bridge.connect(options).await;
//!     if let Some(cause) = token.cause() {
//!         return Err(cause.clone().into());
//!     }
//!
//!     let mut readings = bridge.subscribe("sensors/+", SubscribeOptions::default());
//!
//!     bridge
//!         .publish(
//!             "sensors/kitchen",
//!             Value::record([
//!                 ("payload", Value::from(vec![0x01, 0x02])),
//!                 ("qos", Value::from(1)),
//!                 ("retained", Value::from(true)),
//!             ]),
//!         )?
//!         .await;
//!
//!     while let Some(delivery) = readings.next().await {
//!         println!("{}: {:?}", delivery.topic(), delivery.message().payload());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Completion model
//!
//! ```text
//! Application ──call──▶ Bridge ──listener──▶ AsyncMqttClient ──▶ broker
//!      ▲                                           │
//!      └──── TokenFuture / Subscription ◀── I/O task invokes listener
//! ```
//!
//! Success and failure share one path: a failed operation resolves its
//! future with a token whose [`cause`](Token::cause) is set, it never panics
//! or returns `Err` from the await. Only problems detectable before anything
//! is sent (an unsupported payload, unusable TLS material) are returned
//! synchronously as [`BridgeError`].
//!
//! A subscription the broker rejects ends its stream without yielding
//! anything; [`Subscription::acknowledged`] exposes the subscribe token for
//! callers that need the cause or the granted QoS.
//!
//! # TLS identity
//!
//! ```ignore
//! let options = build_connect_options(&ConnectConfig {
//!     ca_file: Some("/etc/mqtt/ca.crt".into()),
//!     cert_file: Some("/etc/mqtt/client.crt".into()),
//!     key_file: Some("/etc/mqtt/client.key".into()),
//!     key_password: Some("secret".into()),
//!     ..ConnectConfig::default()
//! })?;
//! ```
//!
//! Encrypted keys must be PKCS#8 (`ENCRYPTED PRIVATE KEY`); keys in the legacy
//! OpenSSL format are rejected. Without a CA the bundled web PKI roots are
//! trusted.
//!
//! # Modules
//!
//! * `bridge`: the channel façade
//! * `client`: the listener-based client seam and its `rumqttc` adapter
//! * `message`: canonical messages and payload coercion
//! * `tls`: PEM parsing, in-memory stores and the socket factory
//! * `options`: connect options and the configuration mapping
//! * `config` / `logger`: TOML configuration and `tracing` setup

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod message;
pub mod options;
pub mod state;
pub mod tls;
pub mod token;

pub use bridge::{
    Bridge, Delivery, DisconnectOptions, Disconnection, SubscribeOptions, Subscription,
};
pub use client::{ActionListener, AsyncMqttClient, ClientError, MessageListener, RumqttClient};
pub use config::{Config, ConfigError, ConnectConfig};
pub use error::{BridgeError, OperationError, TlsError};
pub use message::{coerce, Message, Value};
pub use options::{build_connect_options, ConnectOptions};
pub use state::ConnectionState;
pub use token::{Token, TokenFuture};

pub use rumqttc::QoS;

/// Result type for synchronous bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
