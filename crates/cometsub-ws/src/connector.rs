//! `tokio-tungstenite` implementation of the transport seam.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use cometsub_core::error::TransportError;
use cometsub_core::transport::{Connector, Transport, TransportEvent, TransportEvents};

/// Opens WebSocket connections to a node's `/websocket` endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up on a handshake that takes longer than `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Connector for WsConnector {
    fn open(
        &self,
        address: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let url = parse_address(address)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(socket_task(url, self.connect_timeout, cmd_rx, events));
        Ok(Box::new(WsTransport { cmd_tx }))
    }
}

/// Validate a node address. Only `ws://` and `wss://` URLs with a host are accepted.
pub fn parse_address(address: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    let url = Url::parse(address).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(invalid(format!("unsupported scheme '{other}', expected ws or wss"))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".into()));
    }
    Ok(url)
}

enum Outbound {
    Frame(String),
    Ping,
    Close,
}

/// Handle to one socket task.
struct WsTransport {
    cmd_tx: mpsc::UnboundedSender<Outbound>,
}

impl Transport for WsTransport {
    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.cmd_tx
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn probe(&mut self) -> Result<(), TransportError> {
        self.cmd_tx
            .send(Outbound::Ping)
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        // Already gone is as good as closed.
        let _ = self.cmd_tx.send(Outbound::Close);
        Ok(())
    }
}

/// Resolves once the owner closes the transport or drops its handle.
async fn close_requested(outbound: &mut mpsc::UnboundedReceiver<Outbound>) {
    loop {
        match outbound.recv().await {
            None | Some(Outbound::Close) => return,
            Some(_) => trace!("dropping outbound message, socket not open yet"),
        }
    }
}

/// Background task that owns one WebSocket connection.
async fn socket_task(
    url: Url,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: TransportEvents,
) {
    info!(url = %url, "connecting via WebSocket");

    let ws_stream = tokio::select! {
        conn = time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str())) => {
            match conn {
                Ok(Ok((ws_stream, _))) => ws_stream,
                Ok(Err(e)) => {
                    warn!(url = %url, error = %e, "WS connect failed");
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    let _ = events.send(TransportEvent::Closed);
                    return;
                }
                Err(_) => {
                    warn!(url = %url, "WS connect timed out after {connect_timeout:?}");
                    let _ = events.send(TransportEvent::Error(format!(
                        "connect timed out after {}ms",
                        connect_timeout.as_millis()
                    )));
                    let _ = events.send(TransportEvent::Closed);
                    return;
                }
            }
        }
        () = close_requested(&mut outbound) => {
            debug!(url = %url, "closed before the handshake finished");
            return;
        }
    };

    let _ = events.send(TransportEvent::Opened);
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            cmd = outbound.recv() => {
                let result = match cmd {
                    None | Some(Outbound::Close) => {
                        debug!(url = %url, "closing WebSocket");
                        if let Err(e) = sink.close().await {
                            debug!(error = %e, "error sending close frame");
                        }
                        // The owner has moved on; no events are expected.
                        return;
                    }
                    Some(Outbound::Frame(text)) => sink.send(Message::Text(text.into())).await,
                    Some(Outbound::Ping) => sink.send(Message::Ping(Vec::new())).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "WS send error");
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "WS receive error");
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Frame(text.to_string()));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        let _ = events.send(TransportEvent::HeartbeatAck);
                    }
                    // tungstenite queues the pong; push it out now.
                    Some(Ok(Message::Ping(_))) => {
                        let _ = sink.flush().await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "close frame received");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!(url = %url, "WS disconnected");
    let _ = events.send(TransportEvent::Closed);
}
