//! Gap-free scheduling of server audio on the output device
//!
//! Every decoded chunk is placed at `max(next_start_time, now)` on the device
//! clock and the cursor advances by the chunk duration, so consecutive chunks
//! butt up against each other without gaps or overlaps. Units stay in the
//! live set until the device reports them finished; an interruption stops
//! all of them and pulls the cursor back to the present.

use crate::audio::codec::decode_chunk;
use crate::audio::{OutputDevice, UnitId};
use crate::integration::config::PlaybackConfig;
use crate::messages::AudioData;
use crate::Result;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A chunk of server audio placed on the device timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackUnit {
    pub id: UnitId,
    /// Device time in seconds the unit starts at
    pub scheduled_start: f64,
    /// Length in seconds
    pub duration: f64,
}

impl PlaybackUnit {
    pub fn scheduled_end(&self) -> f64 {
        self.scheduled_start + self.duration
    }
}

pub struct PlaybackScheduler {
    device: Box<dyn OutputDevice>,
    next_start_time: f64,
    live: BTreeMap<UnitId, PlaybackUnit>,
    next_id: u64,
    speaking: bool,
    settle_epsilon: f64,
    source_channels: u16,
}

impl PlaybackScheduler {
    /// Take ownership of an opened output device and seed the cursor from its clock
    pub fn new(device: Box<dyn OutputDevice>, config: &PlaybackConfig) -> Self {
        let next_start_time = device.now();
        debug!(
            "Playback scheduler ready at {} Hz, cursor {:.3}s",
            device.sample_rate(),
            next_start_time
        );

        Self {
            device,
            next_start_time,
            live: BTreeMap::new(),
            next_id: 0,
            speaking: false,
            settle_epsilon: config.settle_epsilon,
            source_channels: config.source_channels,
        }
    }

    /// Decode a base64 PCM16 chunk and schedule it.
    ///
    /// A payload that fails to decode is returned as an error without
    /// touching the cursor or the live set.
    pub fn schedule_chunk(
        &mut self,
        payload: &str,
        source_rate: u32,
    ) -> Result<Option<PlaybackUnit>> {
        let audio = decode_chunk(
            payload,
            source_rate,
            self.device.sample_rate(),
            self.source_channels,
        )?;
        self.schedule(audio)
    }

    /// Place decoded audio right after everything already scheduled.
    ///
    /// Empty audio schedules nothing.
    pub fn schedule(&mut self, audio: AudioData) -> Result<Option<PlaybackUnit>> {
        let duration = audio.duration_seconds();
        if audio.is_empty() || duration <= 0.0 {
            debug!("Skipping empty audio chunk");
            return Ok(None);
        }

        let now = self.device.now();
        let scheduled_start = self.next_start_time.max(now);
        let id = UnitId(self.next_id);

        self.device.start_unit(id, audio, scheduled_start)?;

        self.next_id += 1;
        self.next_start_time = scheduled_start + duration;

        let unit = PlaybackUnit {
            id,
            scheduled_start,
            duration,
        };
        self.live.insert(id, unit);

        if !self.speaking {
            debug!("Model started speaking at {:.3}s", scheduled_start);
        }
        self.speaking = true;

        Ok(Some(unit))
    }

    /// Handle a completion reported by the device.
    ///
    /// Returns true when this ended the speaking state.
    pub fn on_unit_finished(&mut self, id: UnitId) -> bool {
        if self.live.remove(&id).is_none() {
            // already stopped by an interruption or teardown
            return false;
        }
        self.settle()
    }

    /// Re-evaluate the speaking flag against the device clock.
    ///
    /// Speaking ends only once nothing is live and the clock has run past the
    /// cursor by `settle_epsilon`, so back-to-back chunks of one utterance do
    /// not flicker the flag. Returns true when the flag flipped to false.
    pub fn settle(&mut self) -> bool {
        if !self.speaking || !self.live.is_empty() {
            return false;
        }

        if self.device.now() >= self.next_start_time + self.settle_epsilon {
            self.speaking = false;
            debug!("Model stopped speaking");
            return true;
        }
        false
    }

    /// Drop all in-flight audio and restart the timeline at the present.
    ///
    /// Returns the number of units that were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.stop_all();
        self.next_start_time = self.device.now();
        self.speaking = false;
        info!("Playback interrupted, stopped {} units", stopped);
        stopped
    }

    /// Stop every live unit, best-effort
    pub fn stop_all(&mut self) -> usize {
        let units = std::mem::take(&mut self.live);
        for id in units.keys() {
            if let Err(e) = self.device.stop_unit(*id) {
                warn!("Failed to stop playback unit {:?}: {}", id, e);
            }
        }
        units.len()
    }

    /// Stop all audio and release the output device
    pub fn close(&mut self) {
        self.stop_all();
        self.speaking = false;
        self.next_start_time = 0.0;
        if let Err(e) = self.device.close() {
            warn!("Failed to close output device: {}", e);
        }
    }

    pub fn speaking(&self) -> bool {
        self.speaking
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn now(&self) -> f64 {
        self.device.now()
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, id: UnitId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn device_rate(&self) -> u32 {
        self.device.sample_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode_frame;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct FakeClock {
        now: f64,
        started: Vec<(UnitId, f64)>,
        stopped: Vec<UnitId>,
        closed: bool,
    }

    struct FakeOutput(Rc<RefCell<FakeClock>>);

    impl OutputDevice for FakeOutput {
        fn sample_rate(&self) -> u32 {
            24000
        }
        fn channels(&self) -> u16 {
            1
        }
        fn now(&self) -> f64 {
            self.0.borrow().now
        }
        fn start_unit(&mut self, id: UnitId, _audio: AudioData, start_at: f64) -> Result<()> {
            self.0.borrow_mut().started.push((id, start_at));
            Ok(())
        }
        fn stop_unit(&mut self, id: UnitId) -> Result<()> {
            self.0.borrow_mut().stopped.push(id);
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            self.0.borrow_mut().closed = true;
            Ok(())
        }
    }

    fn scheduler_at(now: f64) -> (PlaybackScheduler, Rc<RefCell<FakeClock>>) {
        let clock = Rc::new(RefCell::new(FakeClock {
            now,
            ..FakeClock::default()
        }));
        let scheduler =
            PlaybackScheduler::new(Box::new(FakeOutput(clock.clone())), &PlaybackConfig::default());
        (scheduler, clock)
    }

    /// Silence lasting `seconds` at 24 kHz
    fn chunk(seconds: f64) -> AudioData {
        AudioData::new(vec![0.0; (seconds * 24000.0) as usize], 24000, 1)
    }

    #[test]
    fn test_consecutive_chunks_are_gap_free() {
        let (mut scheduler, _clock) = scheduler_at(1.5);
        let durations = [0.25, 0.5, 0.125, 0.375];

        let mut expected_start = 1.5;
        for d in durations {
            let unit = scheduler.schedule(chunk(d)).unwrap().unwrap();
            assert!((unit.scheduled_start - expected_start).abs() < 1e-9);
            assert!((unit.duration - d).abs() < 1e-9);
            expected_start += d;
        }
        assert!((scheduler.next_start_time() - expected_start).abs() < 1e-9);
        assert_eq!(scheduler.live_len(), 4);
        assert!(scheduler.speaking());
    }

    #[test]
    fn test_late_chunk_starts_now() {
        let (mut scheduler, clock) = scheduler_at(0.0);
        scheduler.schedule(chunk(0.5)).unwrap();
        clock.borrow_mut().now = 2.0;

        let unit = scheduler.schedule(chunk(0.5)).unwrap().unwrap();
        assert_eq!(unit.scheduled_start, 2.0);
        assert_eq!(scheduler.next_start_time(), 2.5);
    }

    #[test]
    fn test_schedule_chunk_decodes_payload() {
        let (mut scheduler, _clock) = scheduler_at(0.0);
        let payload = encode_frame(&vec![0.25; 2400]);
        let unit = scheduler.schedule_chunk(&payload, 24000).unwrap().unwrap();
        assert!((unit.duration - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_bad_payload_leaves_state_untouched() {
        let (mut scheduler, _clock) = scheduler_at(0.5);
        assert!(scheduler.schedule_chunk("%%%", 24000).is_err());
        assert_eq!(scheduler.live_len(), 0);
        assert_eq!(scheduler.next_start_time(), 0.5);
        assert!(!scheduler.speaking());
    }

    #[test]
    fn test_interrupt_stops_everything_and_resets_cursor() {
        let (mut scheduler, clock) = scheduler_at(0.0);
        let a = scheduler.schedule(chunk(1.0)).unwrap().unwrap();
        let b = scheduler.schedule(chunk(1.0)).unwrap().unwrap();
        let c = scheduler.schedule(chunk(1.0)).unwrap().unwrap();

        // first unit done, second mid-playback
        clock.borrow_mut().now = 1.4;
        scheduler.on_unit_finished(a.id);

        let stopped = scheduler.interrupt();
        assert_eq!(stopped, 2);
        assert_eq!(scheduler.live_len(), 0);
        assert!(!scheduler.speaking());
        assert_eq!(scheduler.next_start_time(), 1.4);
        assert_eq!(clock.borrow().stopped, vec![b.id, c.id]);

        let next = scheduler.schedule(chunk(0.5)).unwrap().unwrap();
        assert_eq!(next.scheduled_start, 1.4);
    }

    #[test]
    fn test_completion_after_interrupt_is_ignored() {
        let (mut scheduler, _clock) = scheduler_at(0.0);
        let unit = scheduler.schedule(chunk(0.5)).unwrap().unwrap();
        scheduler.interrupt();
        assert!(!scheduler.on_unit_finished(unit.id));
        assert_eq!(scheduler.live_len(), 0);
    }

    #[test]
    fn test_speaking_survives_short_gap() {
        let (mut scheduler, clock) = scheduler_at(0.0);
        let first = scheduler.schedule(chunk(0.5)).unwrap().unwrap();

        clock.borrow_mut().now = 0.5;
        assert!(!scheduler.on_unit_finished(first.id));
        assert!(scheduler.speaking());

        clock.borrow_mut().now = 0.55;
        assert!(!scheduler.settle());
        assert!(scheduler.speaking());

        scheduler.schedule(chunk(0.5)).unwrap();
        assert!(scheduler.speaking());
    }

    #[test]
    fn test_speaking_ends_after_long_gap() {
        let (mut scheduler, clock) = scheduler_at(0.0);
        let unit = scheduler.schedule(chunk(0.5)).unwrap().unwrap();

        clock.borrow_mut().now = 0.5;
        scheduler.on_unit_finished(unit.id);
        assert!(scheduler.speaking());

        clock.borrow_mut().now = 0.7;
        assert!(scheduler.settle());
        assert!(!scheduler.speaking());
    }

    #[test]
    fn test_empty_audio_is_skipped() {
        let (mut scheduler, _clock) = scheduler_at(0.0);
        assert!(scheduler.schedule(chunk(0.0)).unwrap().is_none());
        assert!(!scheduler.speaking());
    }

    #[test]
    fn test_close_releases_device() {
        let (mut scheduler, clock) = scheduler_at(0.0);
        scheduler.schedule(chunk(0.5)).unwrap();
        scheduler.close();
        assert!(clock.borrow().closed);
        assert_eq!(scheduler.live_len(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);
    }
}
