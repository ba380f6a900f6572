//! Lifecycle coordinator for one voice session
//!
//! Connects all components: Microphone -> Capture -> Session -> Playback
//!
//! All state lives in [`VoiceSession`] and is only touched from the task
//! that drives it. Device callbacks and the network reader feed per
//! connection channels; [`VoiceSession::next_event`] waits on them and
//! [`VoiceSession::dispatch`] applies one event at a time.

use crate::audio::capture::CapturePipeline;
use crate::audio::playback::PlaybackScheduler;
use crate::audio::{AudioBackend, InputDevice, UnitId};
use crate::integration::config::SessionConfig;
use crate::messages::TranscriptEntry;
use crate::session::{DuplexSession, ServerEvent, SessionState, Transport, TransportEvent};
use crate::utils::channels::{ConnectionChannels, ConnectionReceivers};
use crate::{ParleyError, Result};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often the speaking flag is re-evaluated against the device clock
const SETTLE_INTERVAL: Duration = Duration::from_millis(20);

/// Observable state of the session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSignals {
    /// The server accepted the session and audio is flowing
    pub connected: bool,

    /// Model audio is playing or about to
    pub speaking: bool,

    /// Level of the last captured block in [0, 1]
    pub input_level: f32,

    /// Last error surfaced to the user, kept until the next connect
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    /// Devices acquired, waiting for the server to accept the setup
    Connecting,
    Connected,
}

/// One unit of work for the session loop
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Raw microphone samples at the device rate
    Capture(Vec<f32>),

    /// The output device finished playing a unit
    UnitFinished(UnitId),

    /// Something happened on the connection
    Transport(TransportEvent),

    /// Periodic speaking re-evaluation
    Tick,
}

/// Channels and timer of the current connection
struct Wiring {
    receivers: ConnectionReceivers,
    settle_tick: Interval,
}

/// Coordinates the devices and the duplex session of one voice conversation
pub struct VoiceSession<B: AudioBackend, T: Transport> {
    config: SessionConfig,
    backend: B,
    transport: T,
    phase: ConnectionPhase,
    session: Option<DuplexSession>,
    capture: Option<CapturePipeline>,
    microphone: Option<Box<dyn InputDevice>>,
    playback: Option<PlaybackScheduler>,
    wiring: Option<Wiring>,
    signals: watch::Sender<SessionSignals>,
    transcript_callback: Option<Box<dyn FnMut(TranscriptEntry)>>,
}

impl<B: AudioBackend, T: Transport> VoiceSession<B, T> {
    pub fn new(config: SessionConfig, backend: B, transport: T) -> Self {
        let (signals, _) = watch::channel(SessionSignals::default());

        Self {
            config,
            backend,
            transport,
            phase: ConnectionPhase::Disconnected,
            session: None,
            capture: None,
            microphone: None,
            playback: None,
            wiring: None,
            signals,
            transcript_callback: None,
        }
    }

    /// Deliver transcripts of both sides to `callback`.
    ///
    /// Installing a callback also asks the server for transcriptions.
    pub fn with_transcript_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(TranscriptEntry) + 'static,
    {
        self.set_transcript_callback(callback);
        self
    }

    pub fn set_transcript_callback<F>(&mut self, callback: F)
    where
        F: FnMut(TranscriptEntry) + 'static,
    {
        self.transcript_callback = Some(Box::new(callback));
    }

    /// Watch connected/speaking/input level and the last error
    pub fn subscribe(&self) -> watch::Receiver<SessionSignals> {
        self.signals.subscribe()
    }

    pub fn signals(&self) -> SessionSignals {
        self.signals.borrow().clone()
    }

    pub fn connected(&self) -> bool {
        self.signals.borrow().connected
    }

    pub fn speaking(&self) -> bool {
        self.signals.borrow().speaking
    }

    pub fn input_level(&self) -> f32 {
        self.signals.borrow().input_level
    }

    pub fn last_error(&self) -> Option<String> {
        self.signals.borrow().last_error.clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(DuplexSession::state)
    }

    /// Schedule cursor of the output device, 0 while disconnected
    pub fn next_start_time(&self) -> f64 {
        self.playback
            .as_ref()
            .map_or(0.0, PlaybackScheduler::next_start_time)
    }

    /// Units scheduled on the output device and not yet finished
    pub fn live_units(&self) -> usize {
        self.playback.as_ref().map_or(0, PlaybackScheduler::live_len)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Acquire the devices and open the session.
    ///
    /// Returns once the setup message is on the wire; `connected` turns true
    /// when the server accepts it. Does nothing while a connection is live.
    /// If this future is dropped before it finishes, call [`disconnect`]
    /// to release what was already acquired.
    ///
    /// [`disconnect`]: VoiceSession::disconnect
    pub async fn connect(&mut self) -> Result<()> {
        if self.phase != ConnectionPhase::Disconnected {
            debug!("Connect ignored, already {:?}", self.phase);
            return Ok(());
        }

        self.publish(|signals| signals.last_error = None);

        if let Err(e) = self.config.validate() {
            error!("Refusing to connect: {}", e);
            self.record_error(&e);
            return Err(e);
        }

        self.phase = ConnectionPhase::Connecting;
        info!("Connecting voice session");

        match self.acquire().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Connect failed: {}", e);
                self.disconnect();
                self.record_error(&e);
                Err(e)
            }
        }
    }

    async fn acquire(&mut self) -> Result<()> {
        let ConnectionChannels { senders, receivers } =
            ConnectionChannels::new(self.config.capture.chunk_queue);

        let mut settle_tick = tokio::time::interval(SETTLE_INTERVAL);
        settle_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.wiring = Some(Wiring {
            receivers,
            settle_tick,
        });

        // Output first so the schedule cursor is seeded before any audio can arrive
        let output = self
            .backend
            .open_output(self.config.playback.device_rate, senders.completion_tx)?;
        info!(
            "Output device open at {} Hz, {} channels",
            output.sample_rate(),
            output.channels()
        );
        self.playback = Some(PlaybackScheduler::new(output, &self.config.playback));

        let microphone = self
            .backend
            .open_input(self.config.capture.sample_rate, senders.capture_tx)?;
        let device_rate = microphone.sample_rate();
        self.microphone = Some(microphone);
        info!("Microphone open at {} Hz", device_rate);

        self.capture = Some(CapturePipeline::new(device_rate, &self.config.capture)?);

        let transcripts = self.config.enable_transcripts || self.transcript_callback.is_some();
        let mut session = DuplexSession::new(&self.config);
        let opened = session
            .open(
                &mut self.transport,
                &self.config,
                transcripts,
                senders.transport_tx,
            )
            .await;
        self.session = Some(session);
        opened
    }

    /// Tear everything down in reverse order of acquisition.
    ///
    /// Safe to call at any time and any number of times.
    pub fn disconnect(&mut self) {
        let active = self.phase != ConnectionPhase::Disconnected
            || self.session.is_some()
            || self.microphone.is_some()
            || self.playback.is_some();

        if let Some(mut session) = self.session.take() {
            session.close();
        }

        if let Some(mut capture) = self.capture.take() {
            capture.reset();
        }

        if let Some(mut microphone) = self.microphone.take() {
            microphone.set_forwarding(false);
            if let Err(e) = microphone.close() {
                warn!("Failed to close microphone: {}", e);
            }
        }

        if let Some(mut playback) = self.playback.take() {
            playback.close();
        }

        // Late traffic from this connection has nowhere to go now
        self.wiring = None;
        self.phase = ConnectionPhase::Disconnected;

        self.publish(|signals| {
            signals.connected = false;
            signals.speaking = false;
            signals.input_level = 0.0;
        });

        if active {
            info!("Voice session disconnected");
        }
    }

    /// Wait for the next event of the current connection.
    ///
    /// Returns `None` while disconnected.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let wiring = self.wiring.as_mut()?;
        let receivers = &mut wiring.receivers;

        let event = tokio::select! {
            biased;
            Some(event) = receivers.transport_rx.recv() => SessionEvent::Transport(event),
            Some(id) = receivers.completion_rx.recv() => SessionEvent::UnitFinished(id),
            Some(chunk) = receivers.capture_rx.recv() => SessionEvent::Capture(chunk),
            _ = wiring.settle_tick.tick() => SessionEvent::Tick,
        };
        Some(event)
    }

    /// Take the next pending event without waiting
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        let receivers = &mut self.wiring.as_mut()?.receivers;

        if let Ok(event) = receivers.transport_rx.try_recv() {
            return Some(SessionEvent::Transport(event));
        }
        if let Ok(id) = receivers.completion_rx.try_recv() {
            return Some(SessionEvent::UnitFinished(id));
        }
        if let Ok(chunk) = receivers.capture_rx.try_recv() {
            return Some(SessionEvent::Capture(chunk));
        }
        None
    }

    /// Handle everything pending, then re-evaluate the speaking flag.
    ///
    /// Returns the number of events handled before the tick.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.try_next_event() {
            self.dispatch(event);
            handled += 1;
        }
        self.dispatch(SessionEvent::Tick);
        handled
    }

    /// Drive the session until it disconnects
    pub async fn run(&mut self) {
        while let Some(event) = self.next_event().await {
            self.dispatch(event);
        }
    }

    pub fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Capture(chunk) => self.on_capture(&chunk),
            SessionEvent::UnitFinished(id) => {
                let stopped = self
                    .playback
                    .as_mut()
                    .is_some_and(|playback| playback.on_unit_finished(id));
                if stopped {
                    self.publish(|signals| signals.speaking = false);
                }
            }
            SessionEvent::Transport(event) => self.on_transport(event),
            SessionEvent::Tick => {
                let stopped = self
                    .playback
                    .as_mut()
                    .is_some_and(PlaybackScheduler::settle);
                if stopped {
                    self.publish(|signals| signals.speaking = false);
                }
            }
        }
    }

    fn on_capture(&mut self, chunk: &[f32]) {
        if self.phase != ConnectionPhase::Connected {
            return;
        }
        let (Some(capture), Some(session)) = (self.capture.as_mut(), self.session.as_mut()) else {
            return;
        };

        let mut level = None;
        let result = capture.process(chunk, |frame| {
            level = Some(frame.level);
            session.send(&frame);
        });

        if let Err(e) = result {
            warn!("Dropping microphone chunk: {}", e);
        }
        if let Some(level) = level {
            self.publish(|signals| signals.input_level = level);
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        for event in session.receive(event) {
            self.on_server_event(event);
            if self.phase == ConnectionPhase::Disconnected {
                break;
            }
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SetupComplete => {
                info!("Session accepted, microphone live");
                self.phase = ConnectionPhase::Connected;
                if let Some(capture) = self.capture.as_mut() {
                    capture.reset();
                }
                if let Some(microphone) = self.microphone.as_mut() {
                    microphone.set_forwarding(true);
                }
                self.publish(|signals| signals.connected = true);
            }
            ServerEvent::AudioChunk { data, sample_rate } => {
                let Some(playback) = self.playback.as_mut() else {
                    return;
                };
                match playback.schedule_chunk(&data, sample_rate) {
                    Ok(Some(unit)) => {
                        debug!(
                            "Scheduled unit {:?} at {:.3}s for {:.3}s",
                            unit.id, unit.scheduled_start, unit.duration
                        );
                        self.publish(|signals| signals.speaking = true);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping audio chunk: {}", e),
                }
            }
            ServerEvent::Interrupted => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.interrupt();
                }
                self.publish(|signals| signals.speaking = false);
            }
            ServerEvent::TurnComplete => debug!("Model turn complete"),
            ServerEvent::Transcript { role, text } => {
                if let Some(callback) = self.transcript_callback.as_mut() {
                    callback(TranscriptEntry::new(role, text));
                }
            }
            ServerEvent::GoAway { time_left } => {
                warn!(
                    "Server is going away (time left: {})",
                    time_left.as_deref().unwrap_or("unknown")
                );
            }
            ServerEvent::Closed { reason } => {
                info!(
                    "Server closed the session: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.disconnect();
            }
            ServerEvent::Fault(e) => {
                error!("Session fault: {}", e);
                self.disconnect();
                self.record_error(&ParleyError::SessionFault(e));
            }
        }
    }

    fn record_error(&self, e: &ParleyError) {
        let message = e.user_message();
        self.publish(|signals| signals.last_error = Some(message));
    }

    fn publish(&self, update: impl FnOnce(&mut SessionSignals)) {
        self.signals.send_if_modified(|signals| {
            let before = signals.clone();
            update(signals);
            *signals != before
        });
    }
}

impl<B: AudioBackend, T: Transport> Drop for VoiceSession<B, T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
