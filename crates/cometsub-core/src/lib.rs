//! cometsub-core — resilient event subscriptions for Tendermint/CometBFT nodes.
//!
//! # Overview
//!
//! A node's `/websocket` endpoint streams events for JSON-RPC `subscribe`
//! queries. Sockets die quietly, so this crate keeps the stream healthy:
//!
//! - [`ConnectionManager`] — owns the transport, runs heartbeat and silence
//!   watchdogs, reconnects after failures
//! - [`SubscriptionManager`] — correlates request ids, dispatches events to
//!   per-query handlers, replays subscriptions after every reconnect
//! - [`Subscriber`] — the facade wiring the two together
//! - [`Connector`] / [`Transport`] — the socket seam; see `cometsub-ws` for
//!   the WebSocket adapter

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod subscriber;
pub mod subscriptions;
pub mod transport;

pub use config::SubscriberConfig;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use envelope::{InboundEnvelope, Method, RpcErrorObject, SubscriptionRequest};
pub use error::{ConfigError, ConnectionError, SubscriberError, SubscriptionError, TransportError};
pub use subscriber::{Subscriber, SubscriberEvent};
pub use subscriptions::{EventHandler, RequestSink, SubscriptionManager};
pub use transport::{Connector, Transport, TransportEvent, TransportEvents};
