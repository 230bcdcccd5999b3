//! Transport abstraction for handler/proxy communication
//!
//! A transport is a duplex byte stream carrying newline-delimited frames.
//! Connecting yields a [`TransportEvents`] pair of channels: one ordered
//! stream of inbound messages and one disconnect notification that always
//! fires after the last message of that connection.

mod endpoint;
mod framing;
mod tcp;

pub use endpoint::{Endpoint, DEFAULT_PORT};
pub use framing::{encode_frame, FrameDecoder, FRAME_DELIMITER};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Errors that can occur with transports
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport already connected")]
    AlreadyConnected,

    #[error("Transport not connected")]
    NotConnected,

    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Why a connection instance ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the stream (zero-length read)
    PeerClosed,
    /// `disconnect()` was called locally
    Local,
    /// A read or write failed
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "peer closed the connection"),
            DisconnectReason::Local => write!(f, "closed locally"),
            DisconnectReason::Error(e) => write!(f, "I/O error: {e}"),
        }
    }
}

/// Receiving side of a connection's event channels
#[derive(Debug)]
pub struct TransportEvents {
    messages: mpsc::UnboundedReceiver<String>,
    disconnected: oneshot::Receiver<DisconnectReason>,
}

impl TransportEvents {
    /// Create a connected emitter/receiver pair
    pub fn channel() -> (EventEmitter, TransportEvents) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (dc_tx, dc_rx) = oneshot::channel();
        (
            EventEmitter {
                messages: msg_tx,
                disconnected: Some(dc_tx),
            },
            TransportEvents {
                messages: msg_rx,
                disconnected: dc_rx,
            },
        )
    }

    /// Next inbound message; `None` once the connection has ended and every
    /// message has been drained
    pub async fn next_message(&mut self) -> Option<String> {
        self.messages.recv().await
    }

    /// Wait for the disconnect notification
    pub async fn disconnected(self) -> DisconnectReason {
        self.disconnected.await.unwrap_or(DisconnectReason::Local)
    }
}

/// Sending side used by transport implementations
#[derive(Debug)]
pub struct EventEmitter {
    messages: mpsc::UnboundedSender<String>,
    disconnected: Option<oneshot::Sender<DisconnectReason>>,
}

impl EventEmitter {
    /// Publish an inbound message. Returns false if nobody is listening.
    pub fn message(&self, message: String) -> bool {
        self.messages.send(message).is_ok()
    }

    /// Publish the disconnect notification. Consumes the emitter so no
    /// message can follow it.
    pub fn disconnect(mut self, reason: DisconnectReason) {
        if let Some(tx) = self.disconnected.take() {
            let _ = tx.send(reason);
        }
    }
}

impl Drop for EventEmitter {
    fn drop(&mut self) {
        if let Some(tx) = self.disconnected.take() {
            let _ = tx.send(DisconnectReason::Local);
        }
    }
}

/// A duplex message channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection and start receiving. Does not retry.
    async fn connect(&self, endpoint: &Endpoint) -> Result<TransportEvents, TransportError>;

    /// Write one message as a single frame
    async fn send(&self, message: &str) -> Result<(), TransportError>;

    /// Close the connection. Safe to call repeatedly.
    async fn disconnect(&self);

    /// Whether the current connection is open
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_precede_disconnect() {
        let (emitter, mut events) = TransportEvents::channel();
        assert!(emitter.message("one".to_string()));
        assert!(emitter.message("two".to_string()));
        emitter.disconnect(DisconnectReason::PeerClosed);

        assert_eq!(events.next_message().await.as_deref(), Some("one"));
        assert_eq!(events.next_message().await.as_deref(), Some("two"));
        assert_eq!(events.next_message().await, None);
        assert_eq!(events.disconnected().await, DisconnectReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_dropped_emitter_reports_local_disconnect() {
        let (emitter, events) = TransportEvents::channel();
        drop(emitter);
        assert_eq!(events.disconnected().await, DisconnectReason::Local);
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(
            DisconnectReason::PeerClosed.to_string(),
            "peer closed the connection"
        );
        assert_eq!(
            DisconnectReason::Error("reset".into()).to_string(),
            "I/O error: reset"
        );
    }
}
