pub mod audio;
pub mod integration;
pub mod messages;
pub mod session;
pub mod utils;

pub use integration::{SessionConfig, SessionSignals, VoiceSession};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParleyError {
    #[error("Audio device acquisition failed: {0}")]
    Acquisition(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session fault: {0}")]
    SessionFault(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audio processing error: {0}")]
    AudioProcessing(String),
}

impl From<std::io::Error> for ParleyError {
    fn from(e: std::io::Error) -> Self {
        ParleyError::Transport(e.to_string())
    }
}

impl From<audio::codec::CodecError> for ParleyError {
    fn from(e: audio::codec::CodecError) -> Self {
        ParleyError::Codec(e.to_string())
    }
}

impl ParleyError {
    /// Check if this error is recoverable without tearing the session down
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Microphone/speaker problems need the user to act
            ParleyError::Acquisition(_) => false,
            // A single bad server payload is dropped, the session continues
            ParleyError::Protocol(_) => true,
            ParleyError::Codec(_) => true,
            ParleyError::AudioProcessing(_) => true,
            // The remote side is gone, a fresh connect() is required
            ParleyError::SessionFault(_) => false,
            ParleyError::Transport(_) => false,
            ParleyError::Config(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            ParleyError::Acquisition(_) => {
                "Could not access the microphone or speakers. Please check permissions and devices."
                    .to_string()
            }
            ParleyError::Protocol(_) => {
                "Received an unexpected message from the voice service.".to_string()
            }
            ParleyError::SessionFault(_) => {
                "The voice session ended. Please reconnect.".to_string()
            }
            ParleyError::Codec(_) => "Audio data could not be decoded.".to_string(),
            ParleyError::Transport(_) => {
                "Could not reach the voice service. Please check your connection.".to_string()
            }
            ParleyError::Config(_) => "Configuration error. Please check settings.".to_string(),
            ParleyError::AudioProcessing(_) => "Audio processing failed.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
