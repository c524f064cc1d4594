//! Transport seam
//!
//! The engine hands finished frame text to a [`Transport`] and never waits on
//! the network. Retry and backpressure are the transport's concern.

use tokio::sync::mpsc;

use crate::error::TransportError;

/// Outbound half of a connection
pub trait Transport: Send + Sync {
    /// Queue one text frame for sending
    fn send_frame(&self, text: String) -> Result<(), TransportError>;
}

/// In-memory transport backed by an unbounded channel.
///
/// The receiving half is drained by the WebSocket writer task, or by a test
/// that wires two endpoints back to back.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    /// Create a transport and the receiver that yields its frames
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Transport for ChannelTransport {
    fn send_frame(&self, text: String) -> Result<(), TransportError> {
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_delivers_in_order() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send_frame("[]".to_string()).unwrap();
        transport.send_frame(r#"[3,"a",{}]"#.to_string()).unwrap();

        assert_eq!(rx.recv().await.unwrap(), "[]");
        assert_eq!(rx.recv().await.unwrap(), r#"[3,"a",{}]"#);
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);

        assert!(transport.is_closed());
        assert_eq!(
            transport.send_frame("[]".to_string()),
            Err(TransportError::Closed)
        );
    }
}
