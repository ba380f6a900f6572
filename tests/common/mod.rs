//! In-memory devices and transport for driving a session without hardware

#![allow(dead_code)]

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use parley::audio::codec::encode_frame;
use parley::audio::{AudioBackend, InputDevice, OutputDevice, UnitId};
use parley::messages::AudioData;
use parley::session::{Transport, TransportEvent, TransportLink};
use parley::{ParleyError, Result, SessionConfig, VoiceSession};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::mpsc::{Sender, UnboundedSender};

pub type Shared<T> = Rc<RefCell<T>>;

/// Everything the fake devices observed
#[derive(Default)]
pub struct DeviceLog {
    /// Device clock in seconds, moved by the test
    pub clock: f64,
    /// Acquisition and release calls in order
    pub calls: Vec<&'static str>,
    /// (id, start, duration) of every started unit
    pub started: Vec<(UnitId, f64, f64)>,
    pub stopped: Vec<UnitId>,
    pub forwarding: bool,
    pub fail_output: bool,
    pub fail_input: bool,
    pub completions: Option<UnboundedSender<UnitId>>,
    pub chunks: Option<Sender<Vec<f32>>>,
}

impl DeviceLog {
    pub fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| **c == call).count()
    }
}

pub struct FakeBackend {
    pub log: Shared<DeviceLog>,
}

struct FakeOutput {
    log: Shared<DeviceLog>,
    rate: u32,
}

struct FakeInput {
    log: Shared<DeviceLog>,
    rate: u32,
}

impl AudioBackend for FakeBackend {
    fn open_output(
        &mut self,
        preferred_rate: u32,
        completions: UnboundedSender<UnitId>,
    ) -> Result<Box<dyn OutputDevice>> {
        let mut log = self.log.borrow_mut();
        if log.fail_output {
            return Err(ParleyError::Acquisition("no speakers".into()));
        }
        log.calls.push("open_output");
        log.completions = Some(completions);
        Ok(Box::new(FakeOutput {
            log: self.log.clone(),
            rate: preferred_rate,
        }))
    }

    fn open_input(
        &mut self,
        preferred_rate: u32,
        chunks: Sender<Vec<f32>>,
    ) -> Result<Box<dyn InputDevice>> {
        let mut log = self.log.borrow_mut();
        if log.fail_input {
            return Err(ParleyError::Acquisition("microphone permission denied".into()));
        }
        log.calls.push("open_input");
        log.chunks = Some(chunks);
        Ok(Box::new(FakeInput {
            log: self.log.clone(),
            rate: preferred_rate,
        }))
    }
}

impl OutputDevice for FakeOutput {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> u16 {
        1
    }

    fn now(&self) -> f64 {
        self.log.borrow().clock
    }

    fn start_unit(&mut self, id: UnitId, audio: AudioData, start_at: f64) -> Result<()> {
        self.log
            .borrow_mut()
            .started
            .push((id, start_at, audio.duration_seconds()));
        Ok(())
    }

    fn stop_unit(&mut self, id: UnitId) -> Result<()> {
        self.log.borrow_mut().stopped.push(id);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.log.borrow_mut().calls.push("close_output");
        Ok(())
    }
}

impl InputDevice for FakeInput {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn set_forwarding(&mut self, enabled: bool) {
        self.log.borrow_mut().forwarding = enabled;
    }

    fn is_forwarding(&self) -> bool {
        self.log.borrow().forwarding
    }

    fn close(&mut self) -> Result<()> {
        self.log.borrow_mut().calls.push("close_input");
        Ok(())
    }
}

/// Everything the fake transport observed
#[derive(Default)]
pub struct WireLog {
    pub setups: Vec<String>,
    pub sent: Vec<String>,
    pub closed: usize,
    pub fail: bool,
    /// Never finish opening
    pub hang: bool,
    pub events: Option<Sender<TransportEvent>>,
}

pub struct FakeTransport {
    pub wire: Shared<WireLog>,
}

struct FakeLink {
    wire: Shared<WireLog>,
}

impl Transport for FakeTransport {
    fn open<'a>(
        &'a mut self,
        _config: &'a SessionConfig,
        setup: String,
        events: Sender<TransportEvent>,
    ) -> LocalBoxFuture<'a, Result<Box<dyn TransportLink>>> {
        let wire = self.wire.clone();
        async move {
            let (fail, hang) = {
                let wire = wire.borrow();
                (wire.fail, wire.hang)
            };
            if hang {
                futures::future::pending::<()>().await;
            }
            if fail {
                return Err(ParleyError::Transport("connection refused".into()));
            }
            {
                let mut log = wire.borrow_mut();
                log.setups.push(setup);
                log.events = Some(events);
            }
            Ok(Box::new(FakeLink { wire }) as Box<dyn TransportLink>)
        }
        .boxed_local()
    }
}

impl TransportLink for FakeLink {
    fn send_text(&mut self, text: String) -> Result<()> {
        self.wire.borrow_mut().sent.push(text);
        Ok(())
    }

    fn close(&mut self) {
        self.wire.borrow_mut().closed += 1;
    }
}

pub type TestSession = VoiceSession<FakeBackend, FakeTransport>;

pub struct Harness {
    pub session: TestSession,
    pub devices: Shared<DeviceLog>,
    pub wire: Shared<WireLog>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::with_persona("You are a helpful front desk agent."))
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let devices: Shared<DeviceLog> = Rc::default();
        let wire: Shared<WireLog> = Rc::default();
        let session = VoiceSession::new(
            config,
            FakeBackend {
                log: devices.clone(),
            },
            FakeTransport { wire: wire.clone() },
        );
        Self {
            session,
            devices,
            wire,
        }
    }

    /// Connect and complete the setup handshake
    pub async fn connected() -> Self {
        let mut harness = Self::new();
        harness.session.connect().await.unwrap();
        harness.server(r#"{"setupComplete":{}}"#);
        harness.session.poll();
        harness
    }

    /// Deliver a raw server message
    pub fn server(&self, json: &str) {
        self.transport(TransportEvent::Message(json.to_string()));
    }

    pub fn transport(&self, event: TransportEvent) {
        let wire = self.wire.borrow();
        let events = wire.events.as_ref().expect("transport not opened");
        events.try_send(event).expect("session stopped listening");
    }

    /// Deliver `samples` of model audio at 24 kHz
    pub fn model_audio(&self, samples: usize) {
        self.server(&audio_message(&encode_frame(&vec![0.25; samples])));
    }

    pub fn microphone(&self, samples: Vec<f32>) {
        let devices = self.devices.borrow();
        let chunks = devices.chunks.as_ref().expect("microphone not opened");
        chunks.try_send(samples).expect("session stopped listening");
    }

    pub fn finish_unit(&self, id: u64) {
        let devices = self.devices.borrow();
        let completions = devices.completions.as_ref().expect("output not opened");
        completions.send(UnitId(id)).expect("session stopped listening");
    }

    pub fn set_clock(&self, seconds: f64) {
        self.devices.borrow_mut().clock = seconds;
    }
}

pub fn audio_message(data: &str) -> String {
    format!(
        r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}]}}}}}}"#,
        data
    )
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {}, got {}",
        expected,
        actual
    );
}
