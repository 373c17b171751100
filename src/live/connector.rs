//! # WebSocket Connector
//!
//! Opens transport sessions over a WebSocket using tokio-tungstenite.
//!
//! ## Connection Flow:
//! 1. **Handshake**: open the socket and send the setup message
//! 2. **Acknowledgement**: wait for `setupComplete` (bounded by the connect timeout)
//! 3. **Split**: a writer task drains outbound frames, a reader task decodes
//!    inbound messages into ordered events
//!
//! The session is returned only after step 2, so no microphone frame can be
//! sent into a half-open channel.

use crate::audio::codec::AudioFormat;
use crate::config::AppConfig;
use crate::error::CallError;
use crate::live::protocol::{RealtimeInputMessage, ServerEvent, ServerMessage, SessionSetup, SetupMessage};
use crate::live::transport::{
    LiveConnector, Outbound, TransportLink, TransportSession, TransportState, TransportStatus, OUTBOUND_QUEUE_DEPTH,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the speech service over a WebSocket.
///
/// One connector makes one connection; its [`TransportState`] follows that
/// connection from `Idle` to `Closed`.
#[derive(Debug)]
pub struct WebSocketConnector {
    url: String,
    input_format: AudioFormat,
    connect_timeout: Duration,
    status: TransportStatus,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, input_format: AudioFormat, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            input_format,
            connect_timeout,
            status: TransportStatus::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.service_url(), config.input_format(), config.connect_timeout())
    }

    pub fn state(&self) -> TransportState {
        self.status.get()
    }

    /// URL without the query string, safe to log.
    fn display_url(&self) -> &str {
        self.url.split('?').next().unwrap_or_default()
    }

    async fn handshake(&self, setup: &SessionSetup) -> Result<WsStream, CallError> {
        let (mut ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| CallError::Connect(e.to_string()))?;

        let setup_json = serde_json::to_string(&SetupMessage::new(setup))
            .map_err(|e| CallError::Connect(format!("failed to encode setup: {}", e)))?;
        ws.send(Message::Text(setup_json))
            .await
            .map_err(|e| CallError::Connect(e.to_string()))?;

        while let Some(message) = ws.next().await {
            let payload = match message.map_err(|e| CallError::Connect(e.to_string()))? {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(frame) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Err(CallError::Connect(format!("closed during setup: {}", reason)));
                }
                _ => continue,
            };

            match ServerMessage::parse(&payload) {
                Ok(message) if message.is_setup_complete() => return Ok(ws),
                Ok(_) => debug!("Ignoring message received before setup completed"),
                Err(err) => warn!(error = %err, "Unparseable message during setup"),
            }
        }

        Err(CallError::Connect("connection ended before setup completed".to_string()))
    }
}

impl LiveConnector for WebSocketConnector {
    async fn connect(&self, setup: &SessionSetup) -> Result<TransportSession, CallError> {
        info!(
            url = %self.display_url(),
            model = %setup.model,
            voice = %setup.voice_name,
            "Connecting to speech service"
        );
        self.status.begin_connect()?;

        let ws = match tokio::time::timeout(self.connect_timeout, self.handshake(setup)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(err)) => {
                self.status.connect_failed();
                return Err(err);
            }
            Err(_) => {
                self.status.connect_failed();
                return Err(CallError::Connect(format!(
                    "no setup acknowledgement within {}ms",
                    self.connect_timeout.as_millis()
                )));
            }
        };

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = TransportSession::with_status(self.status.clone(), outbound_tx, events_rx);
        tokio::spawn(write_loop(sink, outbound_rx, self.input_format));
        tokio::spawn(read_loop(stream, events_tx, session.link()));

        info!("Speech service session open");
        Ok(session)
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    format: AudioFormat,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Audio(data) => {
                let json = match serde_json::to_string(&RealtimeInputMessage::audio(data, format)) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(error = %err, "Failed to encode audio frame");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(json)).await {
                    warn!(error = %err, "Failed to send audio frame, stopping writer");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }

    let _ = sink.close().await;
    debug!("Transport writer finished");
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<ServerEvent>,
    link: TransportLink,
) {
    let mut lost = Some("connection lost".to_string());

    while let Some(message) = stream.next().await {
        let payload = match message {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(frame)) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                lost = Some(format!("service closed the connection: {}", reason));
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                lost = Some(err.to_string());
                break;
            }
        };

        if !link.is_open() {
            lost = None;
            break;
        }

        match ServerMessage::parse(&payload) {
            Ok(message) => {
                for event in message.into_events() {
                    if events.send(event).is_err() {
                        // Receiver gone: the call already tore down
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = events.send(ServerEvent::Error {
                    detail: format!("unparseable service message: {}", err),
                    fatal: false,
                });
            }
        }
    }

    // A close we asked for is not an error
    if let Some(detail) = lost.filter(|_| link.is_open()) {
        let _ = events.send(ServerEvent::Error { detail, fatal: true });
    }
    debug!("Transport reader finished");
}
