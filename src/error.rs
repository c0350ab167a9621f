//! Error types for the voice client
//!
//! `VoiceError` covers genuine failures. Capture sessions that end without a
//! usable utterance are reported as [`Discarded`], which is an expected outcome
//! of turn-taking rather than an error.

use thiserror::Error;

/// Voice client errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    /// Microphone permission denied, no input device, or stream setup failed
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Agent audio could not be decoded or played
    #[error("Playback failed: {0}")]
    PlaybackFailed(String),

    /// Connection to the agent could not be established or was lost
    #[error("Transport error: {0}")]
    TransportError(String),

    /// A frame did not match the wire protocol
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Captured audio could not be encoded
    #[error("Encoding error: {0}")]
    EncodingError(String),

    /// Internal channel closed unexpectedly
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// File system I/O error
    #[error("IO error: {0}")]
    IOError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for VoiceError {
    fn from(e: std::io::Error) -> Self {
        VoiceError::IOError(e.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(e: serde_json::Error) -> Self {
        VoiceError::ProtocolError(e.to_string())
    }
}

impl VoiceError {
    /// Check if this error is recoverable
    ///
    /// Recoverable errors are absorbed by the state machine, which re-arms
    /// listening on its own. Non-recoverable errors are surfaced as status and
    /// need an explicit user action (toggling the conversation) to resume.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Permission or hardware problems need the user
            VoiceError::DeviceUnavailable(_) => false,
            // A single bad reply does not end the conversation
            VoiceError::PlaybackFailed(_) => true,
            // Connection loss halts the conversation until restart
            VoiceError::TransportError(_) => false,
            VoiceError::ProtocolError(_) => true,
            VoiceError::EncodingError(_) => true,
            VoiceError::ChannelError(_) => false,
            VoiceError::IOError(_) => false,
            VoiceError::ConfigError(_) => false,
        }
    }

    /// Get a user-friendly description of the error
    pub fn user_message(&self) -> String {
        match self {
            VoiceError::DeviceUnavailable(_) => "Microphone access denied".to_string(),
            VoiceError::PlaybackFailed(_) => "Audio error".to_string(),
            VoiceError::TransportError(_) => "Connection error".to_string(),
            VoiceError::ProtocolError(_) => "Unexpected message from server".to_string(),
            VoiceError::EncodingError(_) => "Could not prepare recorded audio".to_string(),
            VoiceError::ChannelError(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            VoiceError::IOError(_) => "File system error occurred.".to_string(),
            VoiceError::ConfigError(_) => "Configuration error. Please check settings.".to_string(),
        }
    }
}

/// Why a capture session produced no utterance
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discarded {
    /// Speech was never confirmed by the VAD during the session
    #[error("no speech detected")]
    NoSpeech,

    /// Session was shorter than the minimum utterance duration
    #[error("recording too short ({duration_ms}ms < {min_ms}ms)")]
    TooShort { duration_ms: u64, min_ms: u64 },

    /// Encoded audio was smaller than the minimum utterance size
    #[error("audio too small ({size_bytes} bytes < {min_bytes} bytes)")]
    TooSmall { size_bytes: usize, min_bytes: usize },
}

/// Result type alias for voice client operations
pub type Result<T> = std::result::Result<T, VoiceError>;
