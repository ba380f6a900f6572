//! Wiring of devices, pipelines and the remote session

pub mod config;
pub mod coordinator;

pub use config::{CaptureConfig, PlaybackConfig, SessionConfig};
pub use coordinator::{ConnectionPhase, SessionEvent, SessionSignals, VoiceSession};
