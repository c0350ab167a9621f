//! Connection to the remote ordering agent

pub mod protocol;
pub mod websocket;

pub use protocol::{Cart, CartItem, DisplayItem, Order, OutboundMessage};
pub use websocket::TransportSession;

use crate::recorder::Utterance;
use crate::Result;
use serde::Deserialize;
use std::sync::Arc;

/// Agent endpoint settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket URL of the voice endpoint
    pub url: String,

    /// Give up on a connection attempt after this long
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws/voice".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

/// Inbound events, delivered in receive order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection established
    ConnectionOpened,

    /// Decoded agent speech
    AgentAudio(Vec<u8>),

    /// Products to show alongside the reply
    ShowItems(Vec<DisplayItem>),

    CartUpdate(Cart),

    OrderConfirmed(Order),

    /// Error reported by the agent or an unusable frame
    ServerError(String),

    /// Connection failed or was lost; no reconnect is attempted
    Disconnected { reason: String },
}

/// Callback receiving transport events
pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Persistent bidirectional connection to the agent
pub trait Transport: Send {
    /// Start connecting without blocking
    ///
    /// The outcome is reported through `events` as `ConnectionOpened` or
    /// `Disconnected`. Events of an earlier connection stop once this is
    /// called again.
    fn connect(&mut self, events: EventSink) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Queue one frame for sending
    fn send(&mut self, message: OutboundMessage) -> Result<()>;

    /// Drop the connection without reporting `Disconnected`
    fn close(&mut self);

    fn send_start_session(&mut self) -> Result<()> {
        self.send(OutboundMessage::StartSession)
    }

    /// Upload one utterance; the utterance is consumed
    fn send_utterance(&mut self, utterance: Utterance) -> Result<()> {
        self.send(OutboundMessage::audio(&utterance))
    }
}
