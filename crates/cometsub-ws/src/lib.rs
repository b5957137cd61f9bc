//! cometsub-ws — WebSocket transport for cometsub.
//!
//! # Features
//! - `ws://` / `wss://` (rustls, webpki roots) via `tokio-tungstenite`
//! - Heartbeat probes as WebSocket pings; pongs count as acks
//! - Connect timeout on the opening handshake
//!
//! ```ignore
//! let config = SubscriberConfig::new("wss://rpc.cosmos.network/websocket").with_auto_reconnect(true);
//! let (subscriber, mut events) = cometsub_ws::subscriber(config)?;
//! subscriber.subscribe("tm.event='NewBlock'", |ev| println!("{ev}"))?;
//! subscriber.start();
//! ```

pub mod connector;

pub use connector::{parse_address, WsConnector};

use std::sync::Arc;

use tokio::sync::mpsc;

use cometsub_core::{ConfigError, Subscriber, SubscriberConfig, SubscriberEvent};

/// Build a [`Subscriber`] that talks WebSocket with the default connect timeout.
pub fn subscriber(
    config: SubscriberConfig,
) -> Result<(Subscriber, mpsc::UnboundedReceiver<SubscriberEvent>), ConfigError> {
    Subscriber::new(config, Arc::new(WsConnector::default()))
}
