//! Network transport for the duplex session
//!
//! A transport opens one connection, writes the setup message and then runs
//! two background tasks: a reader that forwards every server frame as a
//! [`TransportEvent`] and a writer that drains a small bounded queue of
//! outbound messages. The reader stops as soon as nobody listens to its
//! events any more, so a torn-down session never adopts late traffic.

use crate::integration::config::SessionConfig;
use crate::{ParleyError, Result};
use futures::future::LocalBoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError, Sender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// What the transport observed on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One text message (binary frames are decoded as UTF-8)
    Message(String),

    /// The connection was closed, with the peer's reason if any
    Closed(Option<String>),

    /// The connection failed
    Error(String),
}

/// The sending half of an open connection
pub trait TransportLink {
    /// Hand a message to the wire without waiting.
    ///
    /// Fails instead of blocking when the connection cannot take it.
    fn send_text(&mut self, text: String) -> Result<()>;

    /// Close the connection, best-effort
    fn close(&mut self);
}

/// Opens connections to the remote model
pub trait Transport {
    /// Connect, write `setup` and start delivering server frames to `events`
    fn open<'a>(
        &'a mut self,
        config: &'a SessionConfig,
        setup: String,
        events: Sender<TransportEvent>,
    ) -> LocalBoxFuture<'a, Result<Box<dyn TransportLink>>>;
}

/// WebSocket transport to the live API
pub struct WebSocketTransport {
    outbound_queue: usize,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self { outbound_queue: 32 }
    }

    /// Limit how many outbound messages may wait for the socket
    pub fn with_outbound_queue(mut self, outbound_queue: usize) -> Self {
        self.outbound_queue = outbound_queue.max(1);
        self
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn connection_url(config: &SessionConfig) -> String {
    match &config.api_key {
        Some(key) => format!("{}?key={}", config.endpoint, key),
        None => config.endpoint.clone(),
    }
}

impl Transport for WebSocketTransport {
    fn open<'a>(
        &'a mut self,
        config: &'a SessionConfig,
        setup: String,
        events: Sender<TransportEvent>,
    ) -> LocalBoxFuture<'a, Result<Box<dyn TransportLink>>> {
        async move {
            info!("Connecting to {}", config.endpoint);

            let (socket, _response) = connect_async(connection_url(config))
                .await
                .map_err(|e| ParleyError::Transport(format!("WebSocket connect failed: {}", e)))?;

            let (mut sink, mut stream) = socket.split();

            sink.send(Message::Text(setup))
                .await
                .map_err(|e| ParleyError::Transport(format!("Failed to send setup: {}", e)))?;

            let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(self.outbound_queue);

            let writer = tokio::spawn(async move {
                while let Some(message) = outbound_rx.recv().await {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = sink.send(message).await {
                        warn!("WebSocket write failed: {}", e);
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                let _ = sink.close().await;
                debug!("WebSocket writer stopped");
            });

            let reader = tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    let event = match frame {
                        Ok(Message::Text(text)) => TransportEvent::Message(text),
                        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                            Ok(text) => TransportEvent::Message(text),
                            Err(e) => {
                                warn!("Dropping non UTF-8 binary frame: {}", e);
                                continue;
                            }
                        },
                        Ok(Message::Close(frame)) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .filter(|r| !r.is_empty());
                            let _ = events.send(TransportEvent::Closed(reason)).await;
                            return;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            error!("WebSocket read failed: {}", e);
                            let _ = events.send(TransportEvent::Error(e.to_string())).await;
                            return;
                        }
                    };

                    if events.send(event).await.is_err() {
                        debug!("Session gone, stopping WebSocket reader");
                        return;
                    }
                }
                let _ = events.send(TransportEvent::Closed(None)).await;
            });

            info!("WebSocket connected, setup sent");

            Ok(Box::new(WebSocketLink {
                outbound: outbound_tx,
                reader,
                writer,
            }) as Box<dyn TransportLink>)
        }
        .boxed_local()
    }
}

struct WebSocketLink {
    outbound: Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TransportLink for WebSocketLink {
    fn send_text(&mut self, text: String) -> Result<()> {
        self.outbound
            .try_send(Message::Text(text))
            .map_err(|e| match e {
                TrySendError::Full(_) => ParleyError::Transport("Outbound queue full".into()),
                TrySendError::Closed(_) => ParleyError::Transport("Connection closed".into()),
            })
    }

    fn close(&mut self) {
        if self.outbound.try_send(Message::Close(None)).is_err() {
            // writer is gone or stuck, do not wait for it
            self.writer.abort();
        }
        self.reader.abort();
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
