//! Publishes a few readings to a local broker and prints them back.
//!
//! Run a broker on localhost:1883 (e.g. `mosquitto -v`), then:
//! `cargo run --example basic_publish_subscribe`

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use mqtt_channels::{
    config::LoggerConfig, logger::LoggerManager, Bridge, ConnectOptions, DisconnectOptions, QoS,
    RumqttClient, SubscribeOptions, Value,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    LoggerManager::new(LoggerConfig::default())?.init()?;

    let client = Arc::new(RumqttClient::with_generated_id("localhost", 1883));
    let bridge = Bridge::new(client.clone());

    let options = ConnectOptions::new()
        .with_keep_alive(Duration::from_secs(30))
        .with_connection_timeout(Duration::from_secs(5));
    let token = bridge.connect(options).await;
    if let Some(cause) = token.cause() {
        error!("Connect failed: {}", cause);
        return Ok(());
    }
    info!("Connected as {}", client.client_id());

    let mut readings = bridge.subscribe("sensors/+", SubscribeOptions::default().with_qos(QoS::AtLeastOnce));
    match readings.acknowledged().await {
        Some(ack) if ack.is_success() => info!("Subscribed, granted {:?}", ack.granted_qos()),
        other => {
            error!("Subscribe failed: {:?}", other);
            return Ok(());
        }
    }

    for (room, reading) in [("kitchen", 21u8), ("hall", 19), ("attic", 24)] {
        let value = Value::record([
            ("payload", Value::from(vec![reading])),
            ("qos", Value::from(1)),
            ("retained", Value::from(false)),
        ]);
        let token = bridge.publish(&format!("sensors/{room}"), value)?.await;
        info!("Published to sensors/{}: {}", room, token.is_success());
    }

    for _ in 0..3 {
        match tokio::time::timeout(Duration::from_secs(5), readings.next()).await {
            Ok(Some(delivery)) => info!(
                "{} -> {:?}",
                delivery.topic(),
                delivery.message().payload()
            ),
            Ok(None) => break,
            Err(_) => {
                error!("No delivery within 5 seconds");
                break;
            }
        }
    }

    let token = bridge.unsubscribe("sensors/+").await;
    info!("Unsubscribed: {}", token.is_success());

    bridge
        .disconnect(DisconnectOptions::default().with_quiesce_timeout(Duration::from_secs(2)))
        .finished()
        .await;
    info!("Disconnected ({})", client.state());
    Ok(())
}
