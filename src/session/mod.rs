//! The duplex session with the remote speech model
//!
//! A [`DuplexSession`] walks `Idle -> Opening -> Open -> Closed`. Only an
//! open session forwards audio or surfaces server events; frames offered
//! earlier are dropped rather than queued. `Closed` is terminal, reconnecting
//! means building a new session.

pub mod protocol;
pub mod transport;

pub use protocol::{ClientMessage, ServerEvent};
pub use transport::{Transport, TransportEvent, TransportLink, WebSocketTransport};

use crate::audio::capture::CapturedFrame;
use crate::integration::config::SessionConfig;
use crate::{ParleyError, Result};
use protocol::parse_server_message;
use std::fmt;
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Open,
    Closed,
}

/// Identifies one session handle for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped,
}

pub struct DuplexSession {
    id: SessionId,
    state: SessionState,
    link: Option<Box<dyn TransportLink>>,
    wire_rate: u32,
    default_source_rate: u32,
    frames_sent: u64,
    frames_dropped: u64,
    protocol_errors: u64,
}

impl DuplexSession {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            id: SessionId::new(),
            state: SessionState::Idle,
            link: None,
            wire_rate: config.capture.sample_rate,
            default_source_rate: config.playback.source_rate,
            frames_sent: 0,
            frames_dropped: 0,
            protocol_errors: 0,
        }
    }

    /// Open the connection and send the setup message.
    ///
    /// The session stays `Opening` until the server acknowledges the setup.
    /// Any failure leaves it `Closed`.
    pub async fn open(
        &mut self,
        transport: &mut dyn Transport,
        config: &SessionConfig,
        transcripts: bool,
        events: Sender<TransportEvent>,
    ) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(ParleyError::SessionFault(format!(
                "Session {} cannot be reopened from {:?}",
                self.id, self.state
            )));
        }

        self.state = SessionState::Opening;
        info!("Opening session {} with voice {}", self.id, config.voice);

        let setup = match ClientMessage::setup(config, transcripts).to_json() {
            Ok(setup) => setup,
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e);
            }
        };

        match transport.open(config, setup, events).await {
            Ok(link) => {
                self.link = Some(link);
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Forward one captured frame, or drop it unless the session is open
    pub fn send(&mut self, frame: &CapturedFrame) -> SendOutcome {
        if self.state != SessionState::Open {
            self.frames_dropped += 1;
            debug!("Dropping frame while session is {:?}", self.state);
            return SendOutcome::Dropped;
        }

        let Some(link) = self.link.as_mut() else {
            self.frames_dropped += 1;
            return SendOutcome::Dropped;
        };

        let message = match ClientMessage::audio(frame.data.clone(), self.wire_rate).to_json() {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to encode frame: {}", e);
                self.frames_dropped += 1;
                return SendOutcome::Dropped;
            }
        };

        match link.send_text(message) {
            Ok(()) => {
                self.frames_sent += 1;
                SendOutcome::Sent
            }
            Err(e) => {
                warn!("Dropping frame: {}", e);
                self.frames_dropped += 1;
                SendOutcome::Dropped
            }
        }
    }

    /// Turn one transport observation into the server events the session accepts.
    ///
    /// Malformed messages are dropped with a warning. A close or error moves
    /// the session to `Closed` and is reported exactly once.
    pub fn receive(&mut self, event: TransportEvent) -> Vec<ServerEvent> {
        match event {
            TransportEvent::Message(text) => self.receive_message(&text),
            TransportEvent::Closed(reason) => self
                .finish()
                .then(|| ServerEvent::Closed { reason })
                .into_iter()
                .collect(),
            TransportEvent::Error(e) => self
                .finish()
                .then(|| ServerEvent::Fault(e))
                .into_iter()
                .collect(),
        }
    }

    fn receive_message(&mut self, text: &str) -> Vec<ServerEvent> {
        let events = match parse_server_message(text, self.default_source_rate) {
            Ok(events) => events,
            Err(e) => {
                self.protocol_errors += 1;
                warn!("Dropping server message: {}", e);
                return Vec::new();
            }
        };

        let mut accepted = Vec::with_capacity(events.len());
        for event in events {
            match (self.state, &event) {
                (SessionState::Opening, ServerEvent::SetupComplete) => {
                    info!("Session {} open", self.id);
                    self.state = SessionState::Open;
                    accepted.push(event);
                }
                (SessionState::Open, ServerEvent::SetupComplete) => {
                    debug!("Ignoring repeated setup acknowledgement");
                }
                (SessionState::Open, _) => accepted.push(event),
                (state, _) => debug!("Ignoring {:?} while session is {:?}", event, state),
            }
        }
        accepted
    }

    /// Mark the session closed, returns false if it already was
    fn finish(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        self.link = None;
        true
    }

    /// Close the connection, best-effort. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        if self.state != SessionState::Closed {
            info!(
                "Session {} closed ({} frames sent, {} dropped)",
                self.id, self.frames_sent, self.frames_dropped
            );
        }
        self.state = SessionState::Closed;
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors
    }
}
