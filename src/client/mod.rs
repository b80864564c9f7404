//! The callback-style client interface the bridge is built on.
//!
//! An [`AsyncMqttClient`] issues requests without waiting for them. Each
//! request carries an [`ActionListener`] that the client's I/O task invokes
//! exactly once, with success or failure, when the broker answers or the
//! connection goes away. Subscriptions additionally carry a
//! [`MessageListener`] that is invoked for every inbound message whose topic
//! matches the filter.
//!
//! Listeners run on the I/O task and must not block.
//!
//! [`RumqttClient`] is the production implementation over `rumqttc`.

use std::{sync::Arc, time::Duration};

use rumqttc::QoS;
use thiserror::Error;

use crate::{error::OperationError, message::Message, options::ConnectOptions, token::Token};

mod rumqtt;

pub use rumqtt::RumqttClient;

/// Completion callback of a single asynchronous operation.
pub trait ActionListener: Send + Sync {
    fn on_success(&self, token: Token);
    fn on_failure(&self, token: Token, cause: OperationError);
}

/// Inbound message callback of a subscription.
pub trait MessageListener: Send + Sync {
    fn message_arrived(&self, topic: &str, message: Message);
}

/// Errors raised synchronously when the client refuses to issue a request.
///
/// Once a request is issued, its outcome is only ever reported to the
/// listener.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client is not connected")]
    NotConnected,

    #[error("Client is already connected")]
    AlreadyConnected,

    /// The request queue to the I/O task is full or closed.
    #[error("Request rejected: {0}")]
    Request(#[from] rumqttc::ClientError),

    /// The client could not be set up for this request.
    #[error("Client setup error: {0}")]
    Setup(String),
}

/// Asynchronous MQTT client with listener-based completion.
pub trait AsyncMqttClient: Send + Sync {
    fn connect(
        &self,
        options: ConnectOptions,
        listener: Arc<dyn ActionListener>,
    ) -> Result<(), ClientError>;

    /// Lets in-flight work finish for up to `quiesce`, then disconnects.
    fn disconnect(
        &self,
        quiesce: Duration,
        listener: Arc<dyn ActionListener>,
    ) -> Result<(), ClientError>;

    /// Blocks until the connection is closed: waits up to `quiesce` for
    /// in-flight work, then up to `disconnect` for the DISCONNECT to be
    /// written, then drops the connection regardless.
    fn disconnect_forcibly(&self, quiesce: Duration, disconnect: Duration);

    fn publish(
        &self,
        topic: &str,
        message: Message,
        listener: Arc<dyn ActionListener>,
    ) -> Result<(), ClientError>;

    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        listener: Arc<dyn ActionListener>,
        messages: Arc<dyn MessageListener>,
    ) -> Result<(), ClientError>;

    fn unsubscribe(
        &self,
        filter: &str,
        listener: Arc<dyn ActionListener>,
    ) -> Result<(), ClientError>;
}
