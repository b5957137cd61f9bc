//! The transport seam between the connection manager and a concrete socket.
//!
//! An adapter owns its own I/O (usually a spawned task) and reports what
//! happens on the socket through the [`TransportEvent`] channel it was opened
//! with. The connection manager hands every adapter a fresh channel, so events
//! from a torn-down transport can never reach a later generation.

use tokio::sync::mpsc;

use crate::error::TransportError;

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket is open and can carry frames.
    Opened,
    /// A text frame arrived.
    Frame(String),
    /// The peer acknowledged a heartbeat probe.
    HeartbeatAck,
    /// The socket is closed. No further events follow.
    Closed,
    /// A socket-level failure. Usually followed by [`TransportEvent::Closed`].
    Error(String),
}

/// Sender half handed to an adapter when it is opened.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// A live socket owned by the connection manager.
///
/// Methods queue work and return immediately; delivery failures show up later
/// as [`TransportEvent::Error`].
pub trait Transport: Send + 'static {
    /// Queue a text frame.
    fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Queue a heartbeat probe. The peer answers with [`TransportEvent::HeartbeatAck`].
    fn probe(&mut self) -> Result<(), TransportError>;

    /// Close the socket. Called exactly once, when the manager tears this
    /// transport down.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory for transports.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; the manager keeps one as
/// `Arc<dyn Connector>` for the lifetime of its task.
pub trait Connector: Send + Sync + 'static {
    /// Start opening a socket to `address`.
    ///
    /// Completion is reported as [`TransportEvent::Opened`] on `events`; an
    /// `Err` here means the attempt could not even be started.
    fn open(
        &self,
        address: &str,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError>;
}
