//! # Transport Session
//!
//! One bidirectional streaming connection to the speech service, seen from
//! the controller as two decoupled halves:
//!
//! - **Outbound**: [`TransportLink::send_audio`], callable from the capture task
//! - **Inbound**: an ordered channel of [`ServerEvent`]s
//!
//! ## State Machine:
//! ```text
//! Idle ──▶ Connecting ──▶ Open ──▶ Closed
//!               └──────────────────▲ (connect error)
//! ```
//!
//! A [`LiveConnector`] only hands out a session once the service acknowledged
//! setup, so every session starts in `Open`. The earlier states live on the
//! [`TransportStatus`] the connector tracks while connecting.
//!
//! ## Backpressure:
//! The outbound queue holds at most [`OUTBOUND_QUEUE_DEPTH`] messages. When
//! the socket writer falls behind, new audio frames are dropped; one slot is
//! always left free for the close request.

use crate::error::CallError;
use crate::live::protocol::{ServerEvent, SessionSetup};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Outbound messages buffered for the socket writer.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Shared lifecycle state of one connection.
#[derive(Debug, Clone, Default)]
pub struct TransportStatus(Arc<Mutex<TransportState>>);

impl TransportStatus {
    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self) -> TransportState {
        *self.lock()
    }

    /// `Idle → Connecting`. A connection is attempted once.
    pub fn begin_connect(&self) -> Result<(), CallError> {
        let mut state = self.lock();
        if *state != TransportState::Idle {
            return Err(CallError::InvalidState(format!("transport already {:?}", *state)));
        }
        *state = TransportState::Connecting;
        Ok(())
    }

    /// `Connecting → Closed` after a failed attempt.
    pub fn connect_failed(&self) {
        let mut state = self.lock();
        if *state == TransportState::Connecting {
            *state = TransportState::Closed;
        }
    }
}

/// Messages for the socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// One encoded microphone frame
    Audio(String),
    /// Close the connection
    Close,
}

/// Opens transport sessions.
pub trait LiveConnector {
    /// Resolves once the remote acknowledged the session as open.
    fn connect(&self, setup: &SessionSetup) -> impl Future<Output = Result<TransportSession, CallError>>;
}

/// Cloneable sending half of a session.
#[derive(Debug, Clone)]
pub struct TransportLink {
    status: TransportStatus,
    outbound: mpsc::Sender<Outbound>,
}

impl TransportLink {
    pub fn state(&self) -> TransportState {
        self.status.get()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Send one microphone frame.
    ///
    /// Only valid while open. After close, or while the writer is backed up,
    /// the frame is dropped with a debug log; both are expected while a call
    /// runs on a slow link or tears down.
    pub fn send_audio(&self, data: String) {
        if let Err(err) = self.try_send_audio(data) {
            debug!(error = %err, "Dropped outbound audio frame");
        }
    }

    /// Like [`TransportLink::send_audio`] but reports the drop.
    pub fn try_send_audio(&self, data: String) -> Result<(), CallError> {
        let state = self.status.lock();
        if *state != TransportState::Open {
            return Err(CallError::TransportClosed);
        }
        // Keep the last slot for Close; senders are serialized by the state lock
        if self.outbound.capacity() <= 1 {
            return Err(CallError::OutboundFull);
        }
        self.outbound
            .try_send(Outbound::Audio(data))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => CallError::OutboundFull,
                mpsc::error::TrySendError::Closed(_) => CallError::TransportClosed,
            })
    }

    /// Move to `Closed` and ask the writer to close the socket. Idempotent.
    pub fn close(&self) {
        let mut state = self.status.lock();
        if *state == TransportState::Closed {
            return;
        }
        *state = TransportState::Closed;
        // The writer may already be gone if the remote hung up first
        let _ = self.outbound.try_send(Outbound::Close);
        info!("Transport session closed");
    }
}

/// An open session with the speech service.
#[derive(Debug)]
pub struct TransportSession {
    link: TransportLink,
    events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl TransportSession {
    /// Wrap the channels of an acknowledged connection.
    pub fn open(outbound: mpsc::Sender<Outbound>, events: mpsc::UnboundedReceiver<ServerEvent>) -> Self {
        Self::with_status(TransportStatus::default(), outbound, events)
    }

    /// Like [`TransportSession::open`], moving an existing status to `Open`.
    pub fn with_status(
        status: TransportStatus,
        outbound: mpsc::Sender<Outbound>,
        events: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Self {
        *status.lock() = TransportState::Open;
        Self {
            link: TransportLink { status, outbound },
            events: Some(events),
        }
    }

    pub fn link(&self) -> TransportLink {
        self.link.clone()
    }

    pub fn state(&self) -> TransportState {
        self.link.state()
    }

    pub fn send_audio(&self, data: String) {
        self.link.send_audio(data);
    }

    /// Take the inbound event stream. Only the first call gets it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events.take()
    }

    /// Close the session and stop delivering events. Idempotent.
    pub fn close(&mut self) {
        self.link.close();
        if let Some(mut events) = self.events.take() {
            events.close();
        }
    }
}
