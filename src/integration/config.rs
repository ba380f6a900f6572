//! Configuration for a voice session
//!
//! Everything the calling layer decides (persona, voice, endpoint) plus the
//! tunables of the capture and playback pipelines.

use crate::{ParleyError, Result};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_VOICE: &str = "Kore";

/// Microphone side of the session
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Wire rate of outbound audio
    pub sample_rate: u32,

    /// Samples per outbound frame
    pub block_size: usize,

    /// Multiplier applied to block RMS before clamping to [0, 1]
    pub level_gain: f32,

    /// Device chunks buffered between the audio thread and the session loop
    pub chunk_queue: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            block_size: 2048,
            level_gain: 5.0,
            chunk_queue: 64,
        }
    }
}

/// Speaker side of the session
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Rate of inbound audio when the server does not say otherwise
    pub source_rate: u32,

    /// Channels of inbound audio
    pub source_channels: u16,

    /// Rate to open the output device at, when the device supports it
    pub device_rate: u32,

    /// Seconds past the end of scheduled audio before speaking ends
    pub settle_epsilon: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            source_rate: 24000,
            source_channels: 1,
            device_rate: 24000,
            settle_epsilon: 0.1,
        }
    }
}

/// Configuration for one voice session
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Behavioral policy handed to the model as its system instruction
    pub persona_instructions: String,

    /// Server-side voice profile
    pub voice: String,

    /// Model resource name
    pub model: String,

    /// WebSocket endpoint of the live API
    pub endpoint: String,

    /// API key, normally taken from the environment
    #[serde(skip)]
    pub api_key: Option<String>,

    /// Ask the server for input/output transcriptions
    pub enable_transcripts: bool,

    pub capture: CaptureConfig,

    pub playback: PlaybackConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persona_instructions: String::new(),
            voice: DEFAULT_VOICE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            enable_transcripts: false,
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration with the given persona
    pub fn with_persona(persona_instructions: impl Into<String>) -> Self {
        Self {
            persona_instructions: persona_instructions.into(),
            ..Self::default()
        }
    }

    /// Load from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ParleyError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ParleyError::Config(format!("Invalid config: {}", e)))
    }

    /// Set the voice; an empty name keeps the default voice
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        let voice = voice.into();
        if !voice.trim().is_empty() {
            self.voice = voice;
        }
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Request text transcripts alongside the audio
    pub fn with_transcripts(mut self) -> Self {
        self.enable_transcripts = true;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.voice.trim().is_empty() {
            return Err(ParleyError::Config("Voice name must not be empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(ParleyError::Config("Model name must not be empty".into()));
        }
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(ParleyError::Config(format!(
                "Endpoint must be a ws:// or wss:// URL: {}",
                self.endpoint
            )));
        }
        if self.capture.sample_rate == 0 || self.playback.source_rate == 0 {
            return Err(ParleyError::Config(
                "Sample rates must be greater than 0".into(),
            ));
        }
        if self.playback.device_rate == 0 {
            return Err(ParleyError::Config(
                "Device sample rate must be greater than 0".into(),
            ));
        }
        if self.capture.block_size == 0 {
            return Err(ParleyError::Config(
                "Capture block size must be greater than 0".into(),
            ));
        }
        if self.playback.source_channels == 0 {
            return Err(ParleyError::Config(
                "Playback channels must be greater than 0".into(),
            ));
        }
        if self.playback.settle_epsilon.is_nan() || self.playback.settle_epsilon < 0.0 {
            return Err(ParleyError::Config(
                "Settle epsilon must be non-negative".into(),
            ));
        }
        Ok(())
    }
}
