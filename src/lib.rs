//! Ordervoice - hands-free voice ordering client
//!
//! This crate provides the client core of a spoken ordering conversation:
//! microphone capture with spectrum-based voice activity detection,
//! utterance packaging, agent audio playback with barge-in, and the
//! WebSocket transport to the ordering agent.

pub mod audio;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod playback;
pub mod recorder;
pub mod state;
pub mod transport;
pub mod vad;

// Re-export error types
pub use error::{Discarded, Result, VoiceError};

// Re-export the client surface
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ClientConfig;
pub use controller::{
    ClientHandle, ClientParts, ControlEvent, ConversationController, ListenConfig,
};
pub use state::{status, ConversationSnapshot, ConversationState, SharedSnapshot};

// Re-export component types
pub use audio::{
    AudioRingBuffer, CaptureDevice, CaptureStream, LevelMeter, LoudnessSample, PlaybackBackend,
};
pub use playback::{PlaybackEngine, PlaybackEvent, PlaybackHandle};
pub use recorder::{Utterance, UtteranceRecorder};
pub use transport::{Transport, TransportEvent, TransportSession};
pub use vad::{ListenMode, VadEvent, VoiceActivityDetector};
