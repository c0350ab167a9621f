//! Wire protocol between the client and the ordering agent
//!
//! Every frame is a JSON text message with a `type` discriminator. Audio is
//! carried base64-encoded (standard alphabet) in both directions.

use crate::recorder::Utterance;
use crate::transport::TransportEvent;
use crate::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Frames sent to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Begin a new order
    StartSession,

    /// One user utterance
    Audio { audio: String },
}

impl OutboundMessage {
    /// Audio frame carrying an utterance
    pub fn audio(utterance: &Utterance) -> Self {
        OutboundMessage::Audio {
            audio: STANDARD.encode(&utterance.audio_bytes),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Product card shown while the agent talks about it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayItem {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub image: String,
}

/// One cart line
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CartItem {
    pub name: String,
    pub price: f64,
    pub quantity: u32,
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cart {
    pub items: Vec<CartItem>,
    pub total: f64,
}

impl Cart {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item_count(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }
}

/// Confirmed order receipt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Order {
    pub id: String,
    pub items: Vec<CartItem>,
    pub total: f64,
    pub status: Option<String>,
}

/// Frames received from the agent
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Audio { audio: String },
    ShowItems { items: Vec<DisplayItem> },
    CartUpdate { cart: Cart },
    OrderConfirmed { order: Order },
    Error { message: String },
}

/// Message types this client understands
const KNOWN_TYPES: [&str; 5] = ["audio", "show_items", "cart_update", "order_confirmed", "error"];

/// Turn one text frame into a transport event
///
/// Returns `None` for frames that are not JSON objects or carry an unknown
/// `type`; those are logged and dropped. A frame with a known type that fails
/// to parse, or audio that is not valid base64, becomes `ServerError`.
pub fn parse_inbound(text: &str) -> Option<TransportEvent> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            let preview: String = text.chars().take(100).collect();
            warn!("Invalid JSON from agent: {}", preview);
            return None;
        }
    };

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    if !KNOWN_TYPES.contains(&kind.as_str()) {
        debug!("Ignoring message of unknown type {:?}", kind);
        return None;
    }

    let message = match serde_json::from_value::<InboundMessage>(value) {
        Ok(message) => message,
        Err(e) => {
            warn!("Malformed {} message: {}", kind, e);
            return Some(TransportEvent::ServerError(format!(
                "malformed {} message: {}",
                kind, e
            )));
        }
    };

    Some(match message {
        InboundMessage::Audio { audio } => match STANDARD.decode(audio.as_bytes()) {
            Ok(bytes) => TransportEvent::AgentAudio(bytes),
            Err(e) => TransportEvent::ServerError(format!("invalid audio payload: {}", e)),
        },
        InboundMessage::ShowItems { items } => TransportEvent::ShowItems(items),
        InboundMessage::CartUpdate { cart } => TransportEvent::CartUpdate(cart),
        InboundMessage::OrderConfirmed { order } => TransportEvent::OrderConfirmed(order),
        InboundMessage::Error { message } => TransportEvent::ServerError(message),
    })
}
