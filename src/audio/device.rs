//! cpal-backed microphone and speaker contexts
//!
//! The output side keeps a shared timeline of scheduled units. The render
//! callback mixes whatever overlaps the block being rendered, advances the
//! frame clock and reports units that played out. Stopping a unit removes it
//! from the timeline under the same lock the callback takes, so a stopped
//! unit can never start afterwards.

use crate::audio::{AudioBackend, InputDevice, OutputDevice, UnitId};
use crate::messages::AudioData;
use crate::{ParleyError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, Host, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    SupportedStreamConfig,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{Sender, UnboundedSender};
use tracing::{debug, error, info, warn};

/// Audio backend using the platform's default cpal host
pub struct CpalBackend {
    host: Host,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn open_output(
        &mut self,
        preferred_rate: u32,
        completions: UnboundedSender<UnitId>,
    ) -> Result<Box<dyn OutputDevice>> {
        let device = self
            .host
            .default_output_device()
            .ok_or_else(|| ParleyError::Acquisition("No output device available".into()))?;

        info!(
            "Using output device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let supported = pick_output_config(&device, preferred_rate)?;
        Ok(Box::new(CpalOutput::open(&device, supported, completions)?))
    }

    fn open_input(
        &mut self,
        preferred_rate: u32,
        chunks: Sender<Vec<f32>>,
    ) -> Result<Box<dyn InputDevice>> {
        let device = self
            .host
            .default_input_device()
            .ok_or_else(|| ParleyError::Acquisition("No input device available".into()))?;

        info!(
            "Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let supported = pick_input_config(&device, preferred_rate)?;
        Ok(Box::new(CpalInput::open(&device, supported, chunks)?))
    }
}

fn usable_format(format: SampleFormat) -> bool {
    matches!(format, SampleFormat::F32 | SampleFormat::I16)
}

fn pick_output_config(device: &Device, preferred_rate: u32) -> Result<SupportedStreamConfig> {
    let preferred = device.supported_output_configs().ok().and_then(|mut ranges| {
        ranges.find(|range| {
            usable_format(range.sample_format())
                && range.min_sample_rate().0 <= preferred_rate
                && range.max_sample_rate().0 >= preferred_rate
        })
    });

    match preferred {
        Some(range) => Ok(range.with_sample_rate(SampleRate(preferred_rate))),
        None => device.default_output_config().map_err(|e| {
            ParleyError::Acquisition(format!("Failed to get output config: {}", e))
        }),
    }
}

fn pick_input_config(device: &Device, preferred_rate: u32) -> Result<SupportedStreamConfig> {
    let preferred = device.supported_input_configs().ok().and_then(|mut ranges| {
        ranges.find(|range| {
            usable_format(range.sample_format())
                && range.min_sample_rate().0 <= preferred_rate
                && range.max_sample_rate().0 >= preferred_rate
        })
    });

    match preferred {
        Some(range) => Ok(range.with_sample_rate(SampleRate(preferred_rate))),
        None => device.default_input_config().map_err(|e| {
            ParleyError::Acquisition(format!("Failed to get input config: {}", e))
        }),
    }
}

struct TimelineUnit {
    id: UnitId,
    start_frame: u64,
    samples: Vec<f32>,
    channels: usize,
}

impl TimelineUnit {
    fn end_frame(&self) -> u64 {
        self.start_frame + (self.samples.len() / self.channels) as u64
    }
}

#[derive(Default)]
struct Timeline {
    units: Vec<TimelineUnit>,
}

impl Timeline {
    /// Mix every unit overlapping `[block_start, block_start + frames)` into `out`
    fn render(
        &mut self,
        out: &mut [f32],
        out_channels: usize,
        block_start: u64,
        completions: &UnboundedSender<UnitId>,
    ) {
        out.fill(0.0);
        let frames = (out.len() / out_channels) as u64;
        let block_end = block_start + frames;

        self.units.retain(|unit| {
            let unit_end = unit.end_frame();
            if unit.start_frame < block_end && unit_end > block_start {
                let from = unit.start_frame.max(block_start);
                let to = unit_end.min(block_end);
                for frame in from..to {
                    let dst = (frame - block_start) as usize * out_channels;
                    let src = (frame - unit.start_frame) as usize * unit.channels;
                    for ch in 0..out_channels {
                        out[dst + ch] += unit.samples[src + ch % unit.channels];
                    }
                }
            }

            if unit_end <= block_end {
                let _ = completions.send(unit.id);
                false
            } else {
                true
            }
        });

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }
}

pub struct CpalOutput {
    stream: Option<Stream>,
    timeline: Arc<Mutex<Timeline>>,
    frames_rendered: Arc<AtomicU64>,
    sample_rate: u32,
    channels: u16,
}

impl CpalOutput {
    fn open(
        device: &Device,
        supported: SupportedStreamConfig,
        completions: UnboundedSender<UnitId>,
    ) -> Result<Self> {
        let config: StreamConfig = supported.config();
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let frames_rendered = Arc::new(AtomicU64::new(0));

        let stream = match supported.sample_format() {
            SampleFormat::I16 => build_output::<i16>(
                device,
                &config,
                Arc::clone(&timeline),
                Arc::clone(&frames_rendered),
                completions,
            )?,
            _ => build_output::<f32>(
                device,
                &config,
                Arc::clone(&timeline),
                Arc::clone(&frames_rendered),
                completions,
            )?,
        };

        stream.play().map_err(|e| {
            ParleyError::Acquisition(format!("Failed to start output stream: {}", e))
        })?;

        info!(
            "Started audio output at {} Hz, {} channels",
            config.sample_rate.0, config.channels
        );

        Ok(Self {
            stream: Some(stream),
            timeline,
            frames_rendered,
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        })
    }
}

fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
    frames_rendered: Arc<AtomicU64>,
    completions: UnboundedSender<UnitId>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    let err_fn = |err| {
        error!("Audio output stream error: {}", err);
    };

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                let block_start = frames_rendered.load(Ordering::Acquire);

                timeline
                    .lock()
                    .render(&mut scratch, channels, block_start, &completions);

                for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                    *dst = T::from_sample(src);
                }
                frames_rendered.fetch_add((data.len() / channels) as u64, Ordering::Release);
            },
            err_fn,
            None,
        )
        .map_err(|e| ParleyError::Acquisition(format!("Failed to build output stream: {}", e)))
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn now(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn start_unit(&mut self, id: UnitId, audio: AudioData, start_at: f64) -> Result<()> {
        if self.stream.is_none() {
            return Err(ParleyError::AudioProcessing("Output device is closed".into()));
        }
        if audio.sample_rate != self.sample_rate {
            return Err(ParleyError::AudioProcessing(format!(
                "Unit at {} Hz on a {} Hz device",
                audio.sample_rate, self.sample_rate
            )));
        }

        let requested = (start_at * self.sample_rate as f64).round() as u64;
        // a start time already in the past plays immediately
        let start_frame = requested.max(self.frames_rendered.load(Ordering::Acquire));

        self.timeline.lock().units.push(TimelineUnit {
            id,
            start_frame,
            channels: audio.channels.max(1) as usize,
            samples: audio.samples,
        });

        debug!("Scheduled unit {:?} at frame {}", id, start_frame);
        Ok(())
    }

    fn stop_unit(&mut self, id: UnitId) -> Result<()> {
        self.timeline.lock().units.retain(|unit| unit.id != id);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.timeline.lock().units.clear();
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause output stream: {}", e);
            }
            drop(stream);
            info!("Stopped audio output");
        }
        Ok(())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

pub struct CpalInput {
    stream: Option<Stream>,
    forwarding: Arc<AtomicBool>,
    sample_rate: u32,
}

impl CpalInput {
    fn open(
        device: &Device,
        supported: SupportedStreamConfig,
        chunks: Sender<Vec<f32>>,
    ) -> Result<Self> {
        let config: StreamConfig = supported.config();
        let forwarding = Arc::new(AtomicBool::new(false));

        let stream = match supported.sample_format() {
            SampleFormat::I16 => {
                build_input::<i16>(device, &config, Arc::clone(&forwarding), chunks)?
            }
            _ => build_input::<f32>(device, &config, Arc::clone(&forwarding), chunks)?,
        };

        // the stream is dropped on the error path, releasing the microphone
        stream.play().map_err(|e| {
            ParleyError::Acquisition(format!("Failed to start input stream: {}", e))
        })?;

        info!(
            "Started audio capture at {} Hz, {} channels",
            config.sample_rate.0, config.channels
        );

        Ok(Self {
            stream: Some(stream),
            forwarding,
            sample_rate: config.sample_rate.0,
        })
    }
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    forwarding: Arc<AtomicBool>,
    chunks: Sender<Vec<f32>>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;

    let err_fn = |err| {
        error!("Audio input stream error: {}", err);
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !forwarding.load(Ordering::Acquire) {
                    return;
                }

                // Average all channels to create mono
                let samples: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / channels as f32
                    })
                    .collect();

                if let Err(e) = chunks.try_send(samples) {
                    debug!("Dropped capture chunk: {}", e);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| ParleyError::Acquisition(format!("Failed to build input stream: {}", e)))
}

impl InputDevice for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_forwarding(&mut self, enabled: bool) {
        self.forwarding.store(enabled, Ordering::Release);
    }

    fn is_forwarding(&self) -> bool {
        self.forwarding.load(Ordering::Acquire)
    }

    fn close(&mut self) -> Result<()> {
        self.forwarding.store(false, Ordering::Release);
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause input stream: {}", e);
            }
            drop(stream);
            info!("Stopped audio capture");
        }
        Ok(())
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
