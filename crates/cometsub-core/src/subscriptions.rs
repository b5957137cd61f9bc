//! Subscription registry and request correlation.
//!
//! Tracks the active queries with their handlers, and the table of in-flight
//! subscribe/unsubscribe requests keyed by JSON-RPC id. Inbound frames are fed
//! to [`SubscriptionManager::handle_message`], which is the single place that
//! resolves pending requests and dispatches events.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::config::millis;
use crate::envelope::{InboundEnvelope, Method, SubscriptionRequest};
use crate::error::{ConnectionError, SubscriptionError};

/// Callback invoked with the full event envelope of a matching query.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Where outbound subscribe/unsubscribe requests go.
///
/// [`ConnectionManager`](crate::connection::ConnectionManager) implements this;
/// tests substitute a channel.
pub trait RequestSink: Send + Sync + 'static {
    fn send_request(&self, request: &SubscriptionRequest) -> Result<(), ConnectionError>;
}

type Reply = oneshot::Sender<Result<(), SubscriptionError>>;

struct PendingRequest {
    query: String,
    method: Method,
    reply: Reply,
}

#[derive(Default)]
struct Registry {
    active: IndexMap<String, EventHandler>,
    pending: HashMap<u64, PendingRequest>,
    /// Queries the running restore cycle has already sent. A removal takes
    /// the query out again, so re-adding it mid-cycle gets it re-subscribed.
    restored: HashSet<String>,
    /// Set once a restore cycle has confirmed every active query; cleared
    /// when a new cycle starts or the connection goes away.
    live: bool,
}

/// Manages active subscriptions and their request/response exchanges.
#[derive(Clone)]
pub struct SubscriptionManager {
    registry: Arc<Mutex<Registry>>,
    sink: Arc<dyn RequestSink>,
    next_id: Arc<AtomicU64>,
    request_timeout: Duration,
}

impl SubscriptionManager {
    pub fn new(sink: Arc<dyn RequestSink>, request_timeout: Duration) -> Self {
        Self {
            registry: Arc::default(),
            sink,
            next_id: Arc::new(AtomicU64::new(1)),
            request_timeout,
        }
    }

    /// Register `handler` for `query` without sending anything.
    ///
    /// The query is subscribed by the next [`restore_all`](Self::restore_all).
    /// Fails if the query already has a handler; the existing one is kept.
    pub fn add(&self, query: impl Into<String>, handler: EventHandler) -> Result<(), SubscriptionError> {
        let query = query.into();
        let mut registry = self.lock();
        if registry.active.contains_key(&query) {
            return Err(SubscriptionError::Duplicate { query });
        }
        debug!(query = %query, "subscription registered");
        registry.active.insert(query, handler);
        Ok(())
    }

    /// Register `handler` for `query` and subscribe right away if the
    /// subscription set is live.
    ///
    /// A request abandoned by a connection teardown is not an error here: the
    /// query stays registered and the next restore cycle subscribes it. Any
    /// other failure unregisters the query.
    pub async fn subscribe(
        &self,
        query: impl Into<String>,
        handler: EventHandler,
    ) -> Result<(), SubscriptionError> {
        let query = query.into();
        let live = {
            let mut registry = self.lock();
            if registry.active.contains_key(&query) {
                return Err(SubscriptionError::Duplicate { query });
            }
            registry.active.insert(query.clone(), handler);
            registry.live
        };
        if !live {
            debug!(query = %query, "subscription registered, waiting for restore");
            return Ok(());
        }

        match self.request(Method::Subscribe, &query).await {
            Ok(()) => Ok(()),
            Err(SubscriptionError::ConnectionClosed { .. }) => {
                debug!(query = %query, "connection dropped mid-subscribe, left for restore");
                Ok(())
            }
            Err(e) => {
                self.lock().unregister(&query);
                Err(e)
            }
        }
    }

    /// Unsubscribe `query`.
    ///
    /// The handler stops receiving events immediately, before the node
    /// confirms. Rejects with the node's error detail on an error response.
    pub async fn remove(&self, query: &str) -> Result<(), SubscriptionError> {
        if self.lock().unregister(query) {
            debug!(query, "subscription removed");
        }
        self.request(Method::Unsubscribe, query).await
    }

    /// Unsubscribe every active query, one at a time.
    ///
    /// Stops at the first failure; queries already processed stay removed.
    pub async fn remove_all(&self) -> Result<(), SubscriptionError> {
        loop {
            let next = self.lock().active.keys().next().cloned();
            let Some(query) = next else {
                return Ok(());
            };
            self.remove(&query).await?;
        }
    }

    /// Replay every active query as a fresh subscribe request, one at a time.
    ///
    /// Pending requests from an earlier cycle are rejected first. Queries
    /// added while the cycle runs are picked up before it completes. The first
    /// failure aborts the cycle and is returned.
    pub async fn restore_all(&self) -> Result<(), SubscriptionError> {
        let abandoned = {
            let mut registry = self.lock();
            registry.live = false;
            registry.restored.clear();
            std::mem::take(&mut registry.pending)
        };
        reject_all(abandoned);

        let mut count = 0usize;
        loop {
            let next = {
                let mut registry = self.lock();
                let Registry {
                    active,
                    restored,
                    live,
                    ..
                } = &mut *registry;
                let next = active.keys().find(|q| !restored.contains(*q)).cloned();
                match &next {
                    Some(query) => {
                        restored.insert(query.clone());
                    }
                    None => *live = true,
                }
                next
            };
            let Some(query) = next else {
                break;
            };
            self.request(Method::Subscribe, &query).await?;
            count += 1;
        }

        info!(count, "subscriptions restored");
        Ok(())
    }

    /// Reject every in-flight request with `ConnectionClosed`.
    ///
    /// Called when the connection generation they were sent on ends.
    pub fn abandon_pending(&self) {
        let abandoned = {
            let mut registry = self.lock();
            registry.live = false;
            registry.restored.clear();
            std::mem::take(&mut registry.pending)
        };
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "abandoning pending requests");
        }
        reject_all(abandoned);
    }

    /// Correlate or dispatch one raw inbound frame.
    ///
    /// Malformed frames and events for unknown queries are dropped.
    pub fn handle_message(&self, raw: &str) {
        let Some(envelope) = InboundEnvelope::parse(raw) else {
            trace!("dropping malformed frame");
            return;
        };
        let error = envelope.error();

        if let Some(id) = envelope.id() {
            if error.is_some() || envelope.has_result() {
                let pending = self.lock().pending.remove(&id);
                if let Some(pending) = pending {
                    let outcome = match &error {
                        Some(err) => {
                            let detail = err.detail();
                            warn!(
                                id,
                                method = %pending.method,
                                query = %pending.query,
                                detail = %detail,
                                "request rejected by node"
                            );
                            Err(SubscriptionError::Remote {
                                query: pending.query.clone(),
                                detail,
                            })
                        }
                        None => {
                            debug!(id, method = %pending.method, query = %pending.query, "request confirmed");
                            Ok(())
                        }
                    };
                    // The caller may have given up (timeout); nothing to do then.
                    let _ = pending.reply.send(outcome);
                    return;
                }
            }
        }

        if let Some(err) = error {
            debug!(detail = %err.detail(), "uncorrelated error response");
            return;
        }

        let Some(query) = envelope.query() else {
            return;
        };
        let Some(handler) = self.lock().active.get(query).cloned() else {
            trace!(query, "no handler for event");
            return;
        };
        handler(envelope.into_value());
    }

    /// Active queries in registration order.
    pub fn queries(&self) -> Vec<String> {
        self.lock().active.keys().cloned().collect()
    }

    pub fn contains(&self, query: &str) -> bool {
        self.lock().active.contains_key(query)
    }

    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of requests awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Returns `true` once a restore cycle has completed on the current connection.
    pub fn is_live(&self) -> bool {
        self.lock().live
    }

    async fn request(&self, method: Method, query: &str) -> Result<(), SubscriptionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().pending.insert(
            id,
            PendingRequest {
                query: query.to_owned(),
                method,
                reply: tx,
            },
        );

        let request = SubscriptionRequest::new(id, method, query);
        debug!(id, method = %method, query, "sending request");
        if let Err(e) = self.sink.send_request(&request) {
            self.lock().pending.remove(&id);
            return Err(e.into());
        }

        match time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SubscriptionError::ConnectionClosed {
                query: query.to_owned(),
            }),
            Err(_) => {
                self.lock().pending.remove(&id);
                let ms = millis(self.request_timeout);
                warn!(id, method = %method, query, "request timed out after {ms}ms");
                Err(SubscriptionError::Timeout {
                    query: query.to_owned(),
                    ms,
                })
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Registry {
    /// Drop `query` from dispatch and from the running restore cycle.
    fn unregister(&mut self, query: &str) -> bool {
        self.restored.remove(query);
        self.active.shift_remove(query).is_some()
    }
}

fn reject_all(pending: HashMap<u64, PendingRequest>) {
    for (_, request) in pending {
        let _ = request.reply.send(Err(SubscriptionError::ConnectionClosed {
            query: request.query,
        }));
    }
}
