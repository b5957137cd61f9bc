//! The application-facing subscriber.
//!
//! Wires the connection manager to the subscription manager: every new
//! connection generation triggers a restore cycle, and only once that cycle
//! succeeds is the connection announced as [`SubscriberEvent::Connected`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::SubscriberConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::{ConfigError, SubscriberError, SubscriptionError};
use crate::subscriptions::{EventHandler, SubscriptionManager};
use crate::transport::Connector;

/// Connection-level events surfaced to the application.
///
/// Subscription events go to the per-query handlers instead.
#[derive(Debug, Clone)]
pub enum SubscriberEvent {
    /// Connected and every registered query was re-subscribed.
    Connected { address: String },
    /// The transport that was connected has gone away.
    Disconnected,
    /// The node answered a heartbeat probe.
    HeartbeatAck,
    Error(SubscriberError),
}

type RestoreOutcome = (u64, Result<(), SubscriptionError>);

/// Resilient pub/sub client for a Tendermint/CometBFT node.
///
/// ```ignore
/// let (subscriber, mut events) = Subscriber::new(config, connector)?;
/// subscriber
///     .subscribe("tm.event='NewBlock'", |ev| println!("{ev}"))?
///     .subscribe("tm.event='Tx'", |ev| println!("{ev}"))?;
/// subscriber.start();
/// ```
///
/// Dropping the subscriber stops its background tasks.
pub struct Subscriber {
    connection: ConnectionManager,
    subscriptions: SubscriptionManager,
}

impl Subscriber {
    /// Validate `config` and start the background tasks.
    ///
    /// Must be called from within a Tokio runtime. Nothing connects until
    /// [`start`](Self::start).
    pub fn new(
        config: SubscriberConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SubscriberEvent>), ConfigError> {
        let request_timeout = config.request_timeout();
        let (connection, connection_events) = ConnectionManager::spawn(config, connector)?;
        let subscriptions =
            SubscriptionManager::new(Arc::new(connection.clone()), request_timeout);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_events(
            connection_events,
            connection.clone(),
            subscriptions.clone(),
            event_tx,
        ));

        Ok((
            Self {
                connection,
                subscriptions,
            },
            event_rx,
        ))
    }

    /// Open the connection.
    pub fn start(&self) {
        self.connection.connect();
    }

    /// Close the connection. No reconnect follows; registered queries are kept
    /// and replayed by a later [`start`](Self::start).
    pub fn stop(&self) {
        self.connection.disconnect();
    }

    /// Register `handler` for `query`.
    ///
    /// The query is subscribed on the next (re)connect. Returns `self` so
    /// registrations can be chained before [`start`](Self::start).
    pub fn subscribe<F>(&self, query: impl Into<String>, handler: F) -> Result<&Self, SubscriptionError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.subscriptions.add(query, Arc::new(handler))?;
        Ok(self)
    }

    /// Like [`subscribe`](Self::subscribe), but decodes each event envelope
    /// into `T` first. Events that fail to decode are logged and dropped.
    pub fn subscribe_decoded<T, F>(
        &self,
        query: impl Into<String>,
        handler: F,
    ) -> Result<&Self, SubscriptionError>
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let query = query.into();
        let handler = decoding_handler(query.clone(), handler);
        self.subscriptions.add(query, handler)?;
        Ok(self)
    }

    /// Register `handler` for `query` and, if already connected, subscribe
    /// on the node right away.
    pub async fn subscribe_live<F>(&self, query: impl Into<String>, handler: F) -> Result<(), SubscriptionError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.subscriptions.subscribe(query, Arc::new(handler)).await
    }

    /// Unsubscribe `query`. Its handler stops receiving events immediately.
    pub async fn unsubscribe(&self, query: &str) -> Result<(), SubscriptionError> {
        self.subscriptions.remove(query).await
    }

    /// Unsubscribe every registered query, one at a time.
    pub async fn unsubscribe_all(&self) -> Result<(), SubscriptionError> {
        self.subscriptions.remove_all().await
    }

    /// Registered queries in registration order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.queries()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn address(&self) -> &str {
        self.connection.address()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.connection.shutdown();
    }
}

fn decoding_handler<T, F>(query: String, handler: F) -> EventHandler
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync + 'static,
{
    Arc::new(move |value: Value| match serde_json::from_value::<T>(value) {
        Ok(decoded) => handler(decoded),
        Err(e) => warn!(query = %query, error = %e, "dropping event that failed to decode"),
    })
}

/// Single consumer of connection events.
///
/// Restore cycles run in their own task so that the responses they wait for
/// can still be routed through this loop.
async fn run_events(
    mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    connection: ConnectionManager,
    subscriptions: SubscriptionManager,
    events: mpsc::UnboundedSender<SubscriberEvent>,
) {
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<RestoreOutcome>();
    // Generation whose restore may still announce `Connected`.
    let mut current: Option<u64> = None;
    let mut restore: Option<JoinHandle<()>> = None;
    let emit = |event: SubscriberEvent| {
        let _ = events.send(event);
    };

    loop {
        tokio::select! {
            event = connection_events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnectionEvent::Connected { generation } => {
                        current = Some(generation);
                        if let Some(task) = restore.take() {
                            task.abort();
                        }
                        debug!(generation, "restoring subscriptions");
                        let subscriptions = subscriptions.clone();
                        let outcome_tx = outcome_tx.clone();
                        restore = Some(tokio::spawn(async move {
                            let result = subscriptions.restore_all().await;
                            let _ = outcome_tx.send((generation, result));
                        }));
                    }
                    ConnectionEvent::Message(raw) => subscriptions.handle_message(&raw),
                    ConnectionEvent::HeartbeatAck => emit(SubscriberEvent::HeartbeatAck),
                    ConnectionEvent::Disconnected => {
                        current = None;
                        if let Some(task) = restore.take() {
                            task.abort();
                        }
                        subscriptions.abandon_pending();
                        emit(SubscriberEvent::Disconnected);
                    }
                    ConnectionEvent::Error(e) => emit(SubscriberEvent::Error(e.into())),
                }
            }
            Some((generation, result)) = outcome_rx.recv() => {
                if current != Some(generation) {
                    debug!(generation, ?current, "ignoring stale restore outcome");
                    continue;
                }
                current = None;
                restore = None;
                match result {
                    Ok(()) => emit(SubscriberEvent::Connected {
                        address: connection.address().to_owned(),
                    }),
                    Err(e) => {
                        error!(error = %e, "subscription restore failed, dropping connection");
                        connection.disconnect();
                        subscriptions.abandon_pending();
                        emit(SubscriberEvent::Error(SubscriberError::Restore(e)));
                    }
                }
            }
        }
    }

    if let Some(task) = restore {
        task.abort();
    }
    debug!("subscriber event loop exiting");
}
