//! Outbound frame transport
//!
//! The message queue only needs a best-effort, non-blocking `send`. A
//! failed send is handled by the queue's own retry path.

pub mod websocket;

use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;

pub use websocket::{ConnectionEvent, ConnectivityManager, CsmsConnectionConfig};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected to the CSMS")]
    NotConnected,

    #[error("Connection channel closed")]
    ChannelClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid CSMS endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("CSMS did not accept subprotocol {requested} (got {accepted:?})")]
    SubprotocolRejected {
        requested: &'static str,
        accepted: Option<String>,
    },
}

pub trait Transport: Send + Sync {
    fn send(&self, message: &str) -> Result<(), TransportError>;
}

/// Transport writing into an unbounded channel drained by a socket writer task.
#[derive(Debug)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::UnboundedSender<String>) -> Self {
        Self { sender }
    }

    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: &str) -> Result<(), TransportError> {
        self.sender
            .send(message.to_string())
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Transport whose channel is swapped on every (re)connect. Sends fail
/// with [`TransportError::NotConnected`] while no connection is attached.
#[derive(Debug, Default)]
pub struct SwitchableTransport {
    current: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl SwitchableTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sender: mpsc::UnboundedSender<String>) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(sender);
        }
    }

    pub fn detach(&self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
    }

    pub fn is_attached(&self) -> bool {
        self.current
            .lock()
            .map(|c| c.as_ref().is_some_and(|s| !s.is_closed()))
            .unwrap_or(false)
    }
}

impl Transport for SwitchableTransport {
    fn send(&self, message: &str) -> Result<(), TransportError> {
        let current = self
            .current
            .lock()
            .map_err(|_| TransportError::ChannelClosed)?;
        match current.as_ref() {
            Some(sender) => sender
                .send(message.to_string())
                .map_err(|_| TransportError::ChannelClosed),
            None => Err(TransportError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_transport_forwards_frames() {
        let (transport, mut rx) = ChannelTransport::pair();
        transport.send(r#"[2,"1","Heartbeat",{}]"#).unwrap();
        assert_eq!(rx.try_recv().unwrap(), r#"[2,"1","Heartbeat",{}]"#);
    }

    #[test]
    fn channel_transport_fails_when_receiver_dropped() {
        let (transport, rx) = ChannelTransport::pair();
        drop(rx);
        assert!(matches!(
            transport.send("x"),
            Err(TransportError::ChannelClosed)
        ));
    }

    #[test]
    fn switchable_transport_follows_attachment() {
        let transport = SwitchableTransport::new();
        assert!(matches!(transport.send("x"), Err(TransportError::NotConnected)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.attach(tx);
        assert!(transport.is_attached());
        transport.send("hello").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "hello");

        transport.detach();
        assert!(!transport.is_attached());
        assert!(matches!(transport.send("x"), Err(TransportError::NotConnected)));
    }
}
