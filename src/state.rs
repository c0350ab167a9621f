//! Conversation state as seen by observers
//!
//! The controller is the single writer. Observers (the presentation layer,
//! tests, the binary's logger) only ever see immutable
//! [`ConversationSnapshot`]s, either by reading [`SharedSnapshot`] or by
//! draining the snapshot stream of a client handle.

use crate::transport::{Cart, DisplayItem, Order};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Status texts shown to the user
pub mod status {
    pub const READY: &str = "Click to start conversation";
    pub const CONNECTING: &str = "Connecting...";
    pub const CONNECTED: &str = "Connected! Starting...";
    pub const LISTENING: &str = "Listening... (speak now)";
    pub const INTERRUPTED: &str = "Listening...";
    pub const AGENT_SPEAKING: &str = "Agent speaking... (speak to interrupt)";
    pub const YOUR_TURN: &str = "Your turn - speak now...";
    pub const NOT_HEARD: &str = "I didn't hear anything, speak now...";
    pub const PROCESSING: &str = "Processing...";
    pub const ORDER_COMPLETE: &str = "Order complete!";
    pub const DISCONNECTED: &str = "Disconnected";
    pub const CONNECTION_ERROR: &str = "Connection error";
    pub const MIC_DENIED: &str = "Microphone access denied";
    pub const AUDIO_ERROR: &str = "Audio error";

    /// Status for an error reported by the agent
    pub fn server_error(message: &str) -> String {
        format!("Error: {}", message)
    }
}

/// Turn-taking state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConversationState {
    /// No conversation running
    #[default]
    Idle,
    /// Waiting for the agent connection
    Connecting,
    /// Microphone open (or about to be), waiting for the user to speak
    ArmedListening,
    /// User speech confirmed, utterance being captured
    Recording,
    /// Utterance sent, waiting for the agent
    AwaitingReply,
    /// Agent reply playing; user may barge in
    AgentSpeaking,
    /// Order confirmed
    Ended,
}

impl ConversationState {
    /// Check if the user currently holds the turn
    pub fn is_listening(&self) -> bool {
        matches!(
            self,
            ConversationState::ArmedListening | ConversationState::Recording
        )
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, ConversationState::Recording)
    }

    pub fn is_agent_speaking(&self) -> bool {
        matches!(self, ConversationState::AgentSpeaking)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ConversationState::Idle)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, ConversationState::Ended)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationState::Idle => write!(f, "Idle"),
            ConversationState::Connecting => write!(f, "Connecting"),
            ConversationState::ArmedListening => write!(f, "ArmedListening"),
            ConversationState::Recording => write!(f, "Recording"),
            ConversationState::AwaitingReply => write!(f, "AwaitingReply"),
            ConversationState::AgentSpeaking => write!(f, "AgentSpeaking"),
            ConversationState::Ended => write!(f, "Ended"),
        }
    }
}

/// Immutable view of the conversation
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationSnapshot {
    pub state: ConversationState,
    /// User intends the conversation to run
    pub conversation_active: bool,
    /// Agent connection is open
    pub connected: bool,
    /// Tag of the current (or last) conversation
    pub conversation_id: Option<Uuid>,
    pub cart: Cart,
    pub display_items: Vec<DisplayItem>,
    pub order: Option<Order>,
    pub status_text: String,
}

impl Default for ConversationSnapshot {
    fn default() -> Self {
        Self {
            state: ConversationState::Idle,
            conversation_active: false,
            connected: false,
            conversation_id: None,
            cart: Cart::default(),
            display_items: Vec::new(),
            order: None,
            status_text: status::READY.to_string(),
        }
    }
}

/// Thread-safe, read-only view of the latest snapshot
#[derive(Clone, Default)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<ConversationSnapshot>>,
}

impl SharedSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot; only the controller publishes
    pub(crate) fn publish(&self, snapshot: ConversationSnapshot) {
        *self.inner.write() = snapshot;
    }

    /// Get a copy of the latest snapshot (no lock held after return)
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.inner.read().clone()
    }

    // === Convenience read methods ===

    pub fn state(&self) -> ConversationState {
        self.inner.read().state
    }

    pub fn status_text(&self) -> String {
        self.inner.read().status_text.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.read().conversation_active
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read().connected
    }

    pub fn cart(&self) -> Cart {
        self.inner.read().cart.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot() {
        let snapshot = ConversationSnapshot::default();
        assert!(snapshot.state.is_idle());
        assert!(!snapshot.conversation_active);
        assert_eq!(snapshot.status_text, status::READY);
    }

    #[test]
    fn test_state_helpers() {
        assert!(ConversationState::ArmedListening.is_listening());
        assert!(ConversationState::Recording.is_listening());
        assert!(!ConversationState::AgentSpeaking.is_listening());
        assert!(ConversationState::AgentSpeaking.is_agent_speaking());
        assert_eq!(ConversationState::AwaitingReply.to_string(), "AwaitingReply");
    }

    #[test]
    fn test_shared_snapshot_publish() {
        let shared = SharedSnapshot::new();
        let reader = shared.clone();

        shared.publish(ConversationSnapshot {
            state: ConversationState::Recording,
            conversation_active: true,
            status_text: status::LISTENING.to_string(),
            ..Default::default()
        });

        assert_eq!(reader.state(), ConversationState::Recording);
        assert!(reader.is_active());
        assert_eq!(reader.status_text(), status::LISTENING);
    }

    #[test]
    fn test_server_error_status() {
        assert_eq!(status::server_error("kitchen closed"), "Error: kitchen closed");
    }
}
