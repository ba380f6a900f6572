pub mod types;

pub use types::{AudioData, Role, TranscriptEntry};
