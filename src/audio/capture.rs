//! Microphone block processing
//!
//! Raw device chunks come in at whatever rate the microphone was opened
//! with. They are resampled to the wire rate when needed, re-chunked into
//! fixed blocks, metered and encoded. Each finished frame goes to the sink
//! supplied by the caller.

use crate::audio::buffer::BlockAssembler;
use crate::audio::codec::encode_frame;
use crate::audio::resampler::AudioResampler;
use crate::integration::config::CaptureConfig;
use crate::Result;
use tracing::{debug, warn};

/// One encoded block ready for the wire
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    /// Base64 PCM16 mono at the wire rate
    pub data: String,
    /// Input level of this block in [0, 1]
    pub level: f32,
    /// Samples in the block
    pub samples: usize,
}

/// RMS of `block` scaled by `gain` and clamped to [0, 1]
pub fn input_level(block: &[f32], gain: f32) -> f32 {
    if block.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = block.iter().map(|&s| s * s).sum();
    let rms = (sum_squares / block.len() as f32).sqrt();

    if rms.is_nan() {
        return 0.0;
    }
    (rms * gain).clamp(0.0, 1.0)
}

pub struct CapturePipeline {
    resampler: Option<AudioResampler>,
    assembler: BlockAssembler,
    level_gain: f32,
    frames_emitted: u64,
}

impl CapturePipeline {
    /// Build the processing graph for a microphone opened at `device_rate`
    pub fn new(device_rate: u32, config: &CaptureConfig) -> Result<Self> {
        let resampler = if device_rate != config.sample_rate {
            debug!(
                "Microphone runs at {} Hz, resampling to {} Hz",
                device_rate, config.sample_rate
            );
            Some(AudioResampler::new(device_rate, config.sample_rate, 1)?)
        } else {
            None
        };

        Ok(Self {
            resampler,
            assembler: BlockAssembler::new(config.block_size, config.block_size * 8),
            level_gain: config.level_gain,
            frames_emitted: 0,
        })
    }

    /// Process one device chunk, handing every completed frame to `sink`.
    ///
    /// Returns the number of frames emitted.
    pub fn process<F>(&mut self, chunk: &[f32], mut sink: F) -> Result<usize>
    where
        F: FnMut(CapturedFrame),
    {
        let evicted = match self.resampler {
            Some(ref mut resampler) => {
                let resampled = resampler.process(chunk)?;
                self.assembler.push(&resampled)
            }
            None => self.assembler.push(chunk),
        };

        if evicted > 0 {
            warn!("Capture backlog overflowed, dropped {} samples", evicted);
        }

        let mut emitted = 0;
        while let Some(block) = self.assembler.next_block() {
            sink(CapturedFrame {
                data: encode_frame(&block),
                level: input_level(&block, self.level_gain),
                samples: block.len(),
            });
            emitted += 1;
        }

        self.frames_emitted += emitted as u64;
        Ok(emitted)
    }

    /// Forget buffered audio, e.g. before the session starts forwarding
    pub fn reset(&mut self) {
        self.assembler.clear();
        if let Some(ref mut resampler) = self.resampler {
            resampler.reset();
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn block_size(&self) -> usize {
        self.assembler.block_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{bytes_to_pcm16, decode_base64};

    fn config(block_size: usize) -> CaptureConfig {
        CaptureConfig {
            block_size,
            ..CaptureConfig::default()
        }
    }

    #[test]
    fn test_silence_has_zero_level() {
        assert_eq!(input_level(&[0.0; 2048], 5.0), 0.0);
        assert_eq!(input_level(&[], 5.0), 0.0);
    }

    #[test]
    fn test_level_scaled_and_clamped() {
        let quiet = vec![0.1f32; 2048];
        assert!((input_level(&quiet, 5.0) - 0.5).abs() < 1e-5);

        let loud = vec![0.9f32; 2048];
        assert_eq!(input_level(&loud, 5.0), 1.0);
    }

    #[test]
    fn test_emits_one_frame_per_block() {
        let mut pipeline = CapturePipeline::new(16000, &config(2048)).unwrap();
        let mut frames = Vec::new();

        let emitted = pipeline.process(&[0.0; 1000], |f| frames.push(f)).unwrap();
        assert_eq!(emitted, 0);

        let emitted = pipeline.process(&[0.0; 3200], |f| frames.push(f)).unwrap();
        assert_eq!(emitted, 2);
        assert_eq!(frames.len(), 2);
        assert_eq!(pipeline.frames_emitted(), 2);

        let pcm = bytes_to_pcm16(&decode_base64(&frames[0].data).unwrap()).unwrap();
        assert_eq!(pcm.len(), 2048);
    }

    #[test]
    fn test_frames_preserve_capture_order() {
        let mut pipeline = CapturePipeline::new(16000, &config(4)).unwrap();
        let mut frames = Vec::new();
        pipeline
            .process(&[0.5, 0.5, 0.5, 0.5, -0.5, -0.5, -0.5, -0.5], |f| {
                frames.push(f)
            })
            .unwrap();

        let first = bytes_to_pcm16(&decode_base64(&frames[0].data).unwrap()).unwrap();
        let second = bytes_to_pcm16(&decode_base64(&frames[1].data).unwrap()).unwrap();
        assert!(first.iter().all(|&s| s > 0));
        assert!(second.iter().all(|&s| s < 0));
    }

    #[test]
    fn test_resamples_foreign_device_rate() {
        let mut pipeline = CapturePipeline::new(48000, &config(2048)).unwrap();
        let mut count = 0;
        // one second at 48 kHz is 16000 wire samples, i.e. seven full blocks
        for _ in 0..48 {
            pipeline.process(&[0.2; 1000], |_| count += 1).unwrap();
        }
        assert!(count >= 6 && count <= 7, "got {} frames", count);
    }

    #[test]
    fn test_reset_discards_partial_block() {
        let mut pipeline = CapturePipeline::new(16000, &config(2048)).unwrap();
        pipeline.process(&[0.3; 2000], |_| {}).unwrap();
        pipeline.reset();
        let emitted = pipeline.process(&[0.3; 100], |_| {}).unwrap();
        assert_eq!(emitted, 0);
    }
}
