use crate::{ParleyError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Frames per channel handed to the sinc resampler per call
const CHUNK_FRAMES: usize = 1024;

/// Sample rate converter usable both as a stream stage and for one-shot buffers
pub struct AudioResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    /// Planar input waiting for a full chunk
    pending: Vec<Vec<f32>>,
}

impl AudioResampler {
    /// Create a new audio resampler
    ///
    /// # Arguments
    /// * `input_rate` - Input sample rate
    /// * `output_rate` - Output sample rate
    /// * `channels` - Number of audio channels
    pub fn new(input_rate: u32, output_rate: u32, channels: u16) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(ParleyError::Config(
                "Sample rates must be greater than 0".into(),
            ));
        }

        if channels == 0 {
            return Err(ParleyError::Config(
                "Number of channels must be greater than 0".into(),
            ));
        }

        let resample_ratio = output_rate as f64 / input_rate as f64;

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(
            resample_ratio,
            2.0,
            params,
            CHUNK_FRAMES,
            channels as usize,
        )
        .map_err(|e| {
            ParleyError::AudioProcessing(format!("Failed to create resampler: {}", e))
        })?;

        debug!(
            "Created resampler: {} Hz -> {} Hz, {} channels",
            input_rate, output_rate, channels
        );

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            channels: channels as usize,
            pending: vec![Vec::with_capacity(CHUNK_FRAMES * 2); channels as usize],
        })
    }

    /// Feed interleaved samples and return whatever output is ready.
    ///
    /// Frames that do not fill a whole chunk stay buffered for the next call.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        for frame in input.chunks_exact(self.channels) {
            for (ch, &sample) in frame.iter().enumerate() {
                self.pending[ch].push(sample);
            }
        }

        let mut output = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if needed == 0 || self.pending[0].len() < needed {
                break;
            }

            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();

            let planar = self.resampler.process(&chunk, None).map_err(|e| {
                ParleyError::AudioProcessing(format!("Resampling failed: {}", e))
            })?;
            interleave_into(&planar, planar[0].len(), &mut output);
        }

        Ok(output)
    }

    /// Resample a complete buffer, including its final partial chunk.
    ///
    /// The output holds exactly `ceil(frames * ratio)` frames so that the
    /// duration of the result matches the duration of the input.
    pub fn resample(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        self.reset();

        let total_frames = input.len() / self.channels;
        let ratio = self.output_rate as f64 / self.input_rate as f64;
        let expected_frames = (total_frames as f64 * ratio).ceil() as usize;

        let mut output = self.process(input)?;

        if !self.pending[0].is_empty() {
            // SincFixedIn requires exactly one chunk per call, pad the tail with silence
            let needed = self.resampler.input_frames_next();
            let tail: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| {
                    let mut padded: Vec<f32> = channel.drain(..).collect();
                    padded.resize(needed, 0.0);
                    padded
                })
                .collect();

            let planar = self.resampler.process(&tail, None).map_err(|e| {
                ParleyError::AudioProcessing(format!("Resampling failed: {}", e))
            })?;
            interleave_into(&planar, planar[0].len(), &mut output);
        }

        output.resize(expected_frames * self.channels, 0.0);

        debug!(
            "Resampled {} frames -> {} frames",
            total_frames, expected_frames
        );

        Ok(output)
    }

    /// Get the input sample rate
    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Get the output sample rate
    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Get the number of channels
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Drop buffered input and reset the filter state
    pub fn reset(&mut self) {
        self.resampler.reset();
        for channel in &mut self.pending {
            channel.clear();
        }
    }
}

fn interleave_into(planar: &[Vec<f32>], frames: usize, output: &mut Vec<f32>) {
    output.reserve(frames * planar.len());
    for frame_idx in 0..frames {
        for channel in planar {
            output.push(channel[frame_idx]);
        }
    }
}

/// Resample audio in one step, passing it through untouched when rates match
pub fn resample_audio(
    input: &[f32],
    input_rate: u32,
    output_rate: u32,
    channels: u16,
) -> Result<Vec<f32>> {
    if input_rate == output_rate {
        return Ok(input.to_vec());
    }

    let mut resampler = AudioResampler::new(input_rate, output_rate, channels)?;
    resampler.resample(input)
}
