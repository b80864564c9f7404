//! Connects with a client certificate described by a TOML file.
//!
//! `cargo run --example mutual_tls -- mqtt.toml broker.example.com 8883`
//!
//! ```toml
//! [logger]
//! level = "debug"
//!
//! [connection]
//! timeout = 10
//! caFile = "/etc/mqtt/ca.crt"
//! certFile = "/etc/mqtt/client.crt"
//! keyFile = "/etc/mqtt/client.key"
//! keyPassword = "secret"
//!
//! [connection.sslProperties]
//! alpn = "mqtt"
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use mqtt_channels::{
    build_connect_options, logger::LoggerManager, Bridge, Config, DisconnectOptions, RumqttClient,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let config_path = PathBuf::from(args.next().unwrap_or_else(|| "mqtt.toml".into()));
    let host = args.next().unwrap_or_else(|| "localhost".into());
    let port = args.next().map(|p| p.parse()).transpose()?.unwrap_or(8883);

    let config = Config::load(&config_path)?;
    LoggerManager::new(config.logger.clone())?.init()?;

    // TLS material problems surface here, before anything is sent
    let options = build_connect_options(&config.connection)?;
    if let Some(factory) = options.socket_factory() {
        info!(
            "TLS ready: custom CA {}, client certificate {}",
            factory.has_trust_managers(),
            factory.has_key_managers()
        );
    }

    let client = Arc::new(RumqttClient::with_generated_id(host, port));
    let mut state_rx = client.subscribe_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            info!("State: {}", *state_rx.borrow());
        }
    });

    let bridge = Bridge::new(client);
    let token = bridge.connect(options).await;
    match token.cause() {
        None => info!("Mutual TLS connection established"),
        Some(cause) => {
            error!("Connect failed: {}", cause);
            return Ok(());
        }
    }

    let options = DisconnectOptions::forced()
        .with_quiesce_timeout(Duration::from_secs(1))
        .with_disconnect_timeout(Duration::from_secs(2));
    bridge.disconnect(options).finished().await;
    Ok(())
}
