pub mod buffer;
pub mod capture;
pub mod codec;
#[cfg(feature = "audio-io")]
pub mod device;
pub mod playback;
pub mod resampler;

pub use buffer::BlockAssembler;
pub use capture::{input_level, CapturePipeline, CapturedFrame};
pub use codec::CodecError;
#[cfg(feature = "audio-io")]
pub use device::CpalBackend;
pub use playback::{PlaybackScheduler, PlaybackUnit};
pub use resampler::AudioResampler;

use crate::messages::AudioData;
use crate::Result;
use tokio::sync::mpsc::{Sender, UnboundedSender};

/// Identifies one scheduled unit on an output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

/// An opened speaker/output context with its own clock.
///
/// Units are scheduled against the device clock and the device reports each
/// unit that played to completion on the `completions` channel it was opened
/// with. Stopped units are never reported.
pub trait OutputDevice {
    /// Native rate the device renders at
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Device clock in seconds since the context was opened
    fn now(&self) -> f64;

    /// Queue `audio` to start at device time `start_at`
    fn start_unit(&mut self, id: UnitId, audio: AudioData, start_at: f64) -> Result<()>;

    /// Stop a unit immediately. Unknown or finished units are a no-op.
    fn stop_unit(&mut self, id: UnitId) -> Result<()>;

    /// Stop everything and release the device
    fn close(&mut self) -> Result<()>;
}

/// An opened microphone stream.
///
/// The stream delivers mono chunks at `sample_rate()` on the channel it was
/// opened with, but only while forwarding is enabled; audio captured while
/// the gate is closed is discarded at the source.
pub trait InputDevice {
    fn sample_rate(&self) -> u32;

    fn set_forwarding(&mut self, enabled: bool);

    fn is_forwarding(&self) -> bool;

    /// Stop all tracks and release the device
    fn close(&mut self) -> Result<()>;
}

/// Source of audio devices for a session
pub trait AudioBackend {
    /// Open the output context, preferring `preferred_rate` when supported
    fn open_output(
        &mut self,
        preferred_rate: u32,
        completions: UnboundedSender<UnitId>,
    ) -> Result<Box<dyn OutputDevice>>;

    /// Acquire the microphone, preferring `preferred_rate` when supported
    fn open_input(
        &mut self,
        preferred_rate: u32,
        chunks: Sender<Vec<f32>>,
    ) -> Result<Box<dyn InputDevice>>;
}
