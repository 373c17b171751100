//! # Session Controller
//!
//! Orchestrates one live voice call: opens the devices, connects the
//! transport, wires microphone capture to the transport and the transport's
//! events to playback and transcript assembly, and tears everything down.
//!
//! ## Call Lifecycle:
//! ```text
//! Idle ──start()──▶ Connecting ──connected──▶ Connected ──end()/fatal──▶ Closed
//!                       ├── microphone refused / no device ──▶ Failed
//!                       └── connect error / end() ──────────▶ Closed
//! ```
//!
//! ## Concurrency:
//! Three background tasks run while connected: the capture pump (outbound),
//! the event dispatcher (inbound) and the elapsed-time ticker. None of them
//! waits on another. All state they share sits behind one mutex that is held
//! only for synchronous work (decode happens before taking it).
//!
//! ## Ordering guarantees:
//! - The capture pump starts in the same critical section that flips the
//!   phase to `Connected`, and only after the transport acknowledged setup
//! - Events are handled strictly in delivery order, so audio is enqueued in
//!   the order the service emitted it

use crate::audio::codec::{self, AudioFormat};
use crate::audio::{CapturePump, MediaDevices, MicrophoneStream, PlaybackDevice, PlaybackScheduler};
use crate::config::AppConfig;
use crate::error::CallError;
use crate::live::protocol::{ServerEvent, SessionSetup, SpeakerRole};
use crate::live::transport::{LiveConnector, TransportSession};
use crate::live::turns::{TranscriptLine, TurnAssembler};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where a call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Idle,
    Connecting,
    Connected,
    Closed,
    /// The call never got past connecting (no microphone or playback device).
    ///
    /// A refused microphone lands here instead of leaving the call in
    /// `Connecting`; the call is terminal and a retry needs a new controller.
    Failed,
}

/// Observable call state for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub call_id: Option<Uuid>,
    pub phase: CallPhase,
    pub elapsed_seconds: u64,
    pub muted: bool,
    pub video_enabled: bool,
    /// Last fatal error, if the call ended because of one
    pub error: Option<String>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            call_id: None,
            phase: CallPhase::Idle,
            elapsed_seconds: 0,
            muted: false,
            video_enabled: true,
            error: None,
        }
    }
}

/// Per-call settings.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub setup: SessionSetup,
    pub output_format: AudioFormat,
    pub capture_frame_size: usize,
}

impl ControllerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            setup: config.session_setup(),
            output_format: config.output_format(),
            capture_frame_size: config.audio.capture_frame_size,
        }
    }
}

struct SessionInner<P: PlaybackDevice> {
    phase: CallPhase,
    scheduler: Option<PlaybackScheduler<P>>,
    capture: CapturePump,
    turns: TurnAssembler,
    transcript: Vec<TranscriptLine>,
    transcript_sink: Option<mpsc::UnboundedSender<TranscriptLine>>,
    transport: Option<TransportSession>,
    microphone: Option<MicrophoneStream>,
    ticker: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

struct Shared<P: PlaybackDevice> {
    inner: Mutex<SessionInner<P>>,
    snapshot: watch::Sender<CallSnapshot>,
    output_format: AudioFormat,
}

impl<P: PlaybackDevice + 'static> Shared<P> {
    fn lock(&self) -> MutexGuard<'_, SessionInner<P>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a failed start. `end()` may have closed the attempt already,
    /// in which case its phase wins.
    fn fail(&self, phase: CallPhase, err: CallError) -> CallError {
        let final_phase = {
            let mut inner = self.lock();
            if inner.phase == CallPhase::Connecting {
                inner.phase = phase;
            }
            inner.phase
        };

        let detail = err.to_string();
        self.snapshot.send_modify(|s| {
            s.phase = final_phase;
            s.error = Some(detail);
        });
        warn!(error = %err, phase = ?final_phase, "Call failed to start");
        err
    }

    /// Handle one inbound event. Returns `false` once the dispatcher should stop.
    fn handle_event(&self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::AudioChunk(text) => self.play_chunk(&text),
            ServerEvent::Error { detail, fatal: true } => {
                error!(detail = %detail, "Fatal transport error, ending call");
                self.teardown(Some(detail));
                false
            }
            ServerEvent::Error { detail, fatal: false } => {
                warn!(detail = %detail, "Transport reported a recoverable error");
                true
            }
            event => {
                let mut guard = self.lock();
                if guard.phase != CallPhase::Connected {
                    return false;
                }
                let inner = &mut *guard;

                match event {
                    ServerEvent::TranscriptFragment { role, text } => {
                        inner.turns.on_fragment(role, &text);
                    }
                    ServerEvent::TurnComplete => {
                        for line in inner.turns.on_turn_complete() {
                            debug!(role = line.role.as_str(), chars = line.text.len(), "Transcript line");
                            if let Some(sink) = &inner.transcript_sink {
                                let _ = sink.send(line.clone());
                            }
                            inner.transcript.push(line);
                        }
                    }
                    ServerEvent::Interrupted => {
                        if let Some(scheduler) = inner.scheduler.as_mut() {
                            info!(cut_seconds = scheduler.buffered_seconds(), "Remote interrupted playback");
                            scheduler.flush();
                        }
                    }
                    ServerEvent::AudioChunk(_) | ServerEvent::Error { .. } => {}
                }
                true
            }
        }
    }

    fn play_chunk(&self, text: &str) -> bool {
        // Decode before locking; a bad chunk is skipped, the call goes on
        let audio = match codec::decode_transport_audio(text, self.output_format) {
            Ok(audio) => audio,
            Err(err) => {
                warn!(error = %err, "Dropping malformed audio chunk");
                return true;
            }
        };

        let mut inner = self.lock();
        if inner.phase != CallPhase::Connected {
            debug!("Discarding decoded audio, call is no longer connected");
            return false;
        }
        if audio.is_empty() {
            return true;
        }
        if let Some(scheduler) = inner.scheduler.as_mut() {
            let now = scheduler.device_time();
            scheduler.enqueue(&audio, now);
        }
        true
    }

    /// Stop everything the call holds. Safe to run any number of times.
    fn teardown(&self, error: Option<String>) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        match inner.phase {
            CallPhase::Idle | CallPhase::Closed | CallPhase::Failed => return,
            CallPhase::Connecting | CallPhase::Connected => {}
        }

        if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
        }
        inner.capture.stop();
        if let Some(mut scheduler) = inner.scheduler.take() {
            scheduler.flush();
        }
        if let Some(mut transport) = inner.transport.take() {
            transport.close();
        }
        if let Some(mut microphone) = inner.microphone.take() {
            microphone.release();
        }
        inner.turns.clear();
        inner.phase = CallPhase::Closed;
        let dispatcher = inner.dispatcher.take();
        drop(guard);

        self.snapshot.send_modify(|s| {
            s.phase = CallPhase::Closed;
            if error.is_some() {
                s.error = error;
            }
        });
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        info!("Call ended");
    }
}

/// Drives one live voice call at a time.
pub struct SessionController<C: LiveConnector, D: MediaDevices> {
    connector: C,
    devices: D,
    options: ControllerOptions,
    muted: Arc<AtomicBool>,
    shared: Arc<Shared<D::Playback>>,
}

impl<C: LiveConnector, D: MediaDevices> SessionController<C, D> {
    pub fn new(connector: C, devices: D, options: ControllerOptions) -> Self {
        let (snapshot, _) = watch::channel(CallSnapshot::default());
        let shared = Shared {
            inner: Mutex::new(SessionInner {
                phase: CallPhase::Idle,
                scheduler: None,
                capture: CapturePump::new(options.capture_frame_size),
                turns: TurnAssembler::new(),
                transcript: Vec::new(),
                transcript_sink: None,
                transport: None,
                microphone: None,
                ticker: None,
                dispatcher: None,
            }),
            snapshot,
            output_format: options.output_format,
        };

        Self {
            connector,
            devices,
            options,
            muted: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(shared),
        }
    }

    /// Also deliver finished transcript lines to `sink` as they complete.
    pub fn set_transcript_sink(&self, sink: mpsc::UnboundedSender<TranscriptLine>) {
        self.shared.lock().transcript_sink = Some(sink);
    }

    /// Watch the call state.
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn phase(&self) -> CallPhase {
        self.shared.lock().phase
    }

    /// Finished lines in conversation order.
    pub fn transcript(&self) -> Vec<TranscriptLine> {
        self.shared.lock().transcript.clone()
    }

    /// Text heard so far in the current turn.
    pub fn pending_transcript(&self, role: SpeakerRole) -> String {
        self.shared.lock().turns.pending(role).to_string()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Mute or unmute the microphone. Valid in any phase; applies from the
    /// next capture frame.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        self.shared.snapshot.send_modify(|s| s.muted = muted);
        debug!(muted, "Microphone mute changed");
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.shared.snapshot.send_modify(|s| s.video_enabled = enabled);
        debug!(enabled, "Video toggled");
    }

    /// Start a call. Only valid from `Idle`; failures are returned, never retried.
    pub async fn start(&self) -> Result<(), CallError> {
        let call_id = Uuid::new_v4();
        {
            let mut inner = self.shared.lock();
            if inner.phase != CallPhase::Idle {
                return Err(CallError::InvalidState(format!(
                    "cannot start a call while {:?}",
                    inner.phase
                )));
            }
            inner.phase = CallPhase::Connecting;
        }
        self.shared.snapshot.send_modify(|s| {
            s.call_id = Some(call_id);
            s.phase = CallPhase::Connecting;
            s.elapsed_seconds = 0;
            s.error = None;
        });
        info!(%call_id, "Starting call");

        let mut microphone = match self.devices.open_microphone().await {
            Ok(microphone) => microphone,
            Err(err) => return Err(self.shared.fail(CallPhase::Failed, err)),
        };
        let playback = match self.devices.open_playback().await {
            Ok(playback) => playback,
            Err(err) => {
                microphone.release();
                return Err(self.shared.fail(CallPhase::Failed, err));
            }
        };
        // Dropping the devices on error releases them
        let mut transport = match self.connector.connect(&self.options.setup).await {
            Ok(transport) => transport,
            Err(err) => return Err(self.shared.fail(CallPhase::Closed, err)),
        };

        let mut guard = self.shared.lock();
        if guard.phase != CallPhase::Connecting {
            drop(guard);
            info!(%call_id, "Call ended while connecting, closing late connection");
            transport.close();
            return Err(CallError::Cancelled);
        }

        let (Some(mut frames), Some(events)) = (microphone.take_frames(), transport.take_events()) else {
            drop(guard);
            transport.close();
            return Err(self.shared.fail(
                CallPhase::Failed,
                CallError::DeviceUnavailable("microphone or transport stream already consumed".to_string()),
            ));
        };

        // Capture starts at Connected; blocks queued while connecting are stale
        let mut stale = 0usize;
        while frames.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(%call_id, stale, "Discarded microphone audio captured while connecting");
        }

        let inner = &mut *guard;
        let link = transport.link();
        inner.phase = CallPhase::Connected;
        inner.scheduler = Some(PlaybackScheduler::new(playback));
        inner.turns.clear();
        inner
            .capture
            .start(frames, Arc::clone(&self.muted), move |frame| link.send_audio(frame));
        inner.transport = Some(transport);
        inner.microphone = Some(microphone);
        inner.ticker = Some(spawn_ticker(Arc::clone(&self.shared)));
        inner.dispatcher = Some(spawn_dispatcher(Arc::clone(&self.shared), events));
        drop(guard);

        self.shared.snapshot.send_modify(|s| s.phase = CallPhase::Connected);
        info!(%call_id, "Call connected");
        Ok(())
    }

    /// End the call. Idempotent; a no-op before `start()`.
    pub fn end(&self) {
        if self.phase() == CallPhase::Idle {
            debug!("end() ignored, no call in progress");
            return;
        }
        self.shared.teardown(None);
    }
}

impl<C: LiveConnector, D: MediaDevices> Drop for SessionController<C, D> {
    fn drop(&mut self) {
        // The host may leave the call screen without ending the call
        self.shared.teardown(None);
    }
}

fn spawn_ticker<P: PlaybackDevice + 'static>(shared: Arc<Shared<P>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(1);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            shared.snapshot.send_modify(|s| s.elapsed_seconds += 1);
        }
    })
}

fn spawn_dispatcher<P: PlaybackDevice + 'static>(
    shared: Arc<Shared<P>>,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !shared.handle_event(event) {
                break;
            }
        }
        debug!("Event dispatcher finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::DecodedAudio;
    use crate::live::transport::{Outbound, OUTBOUND_QUEUE_DEPTH};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    type Remote = (mpsc::Receiver<Outbound>, mpsc::UnboundedSender<ServerEvent>);

    #[derive(Default)]
    struct FakeConnector {
        fail: bool,
        gate: Option<Arc<Notify>>,
        remote: Arc<Mutex<Option<Remote>>>,
    }

    impl LiveConnector for FakeConnector {
        async fn connect(&self, _setup: &SessionSetup) -> Result<TransportSession, CallError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(CallError::Connect("connection refused".to_string()));
            }
            let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
            let (ev_tx, ev_rx) = mpsc::unbounded_channel();
            *self.remote.lock().unwrap() = Some((out_rx, ev_tx));
            Ok(TransportSession::open(out_tx, ev_rx))
        }
    }

    #[derive(Clone, Default)]
    struct FakeDevices {
        deny_microphone: bool,
        mic_tx: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
        releases: Arc<AtomicUsize>,
        clock: Arc<Mutex<f64>>,
        scheduled: Arc<Mutex<Vec<(u64, f64)>>>,
        stopped: Arc<Mutex<Vec<u64>>>,
    }

    struct FakePlayback {
        clock: Arc<Mutex<f64>>,
        scheduled: Arc<Mutex<Vec<(u64, f64)>>>,
        stopped: Arc<Mutex<Vec<u64>>>,
    }

    impl PlaybackDevice for FakePlayback {
        fn current_time(&self) -> f64 {
            *self.clock.lock().unwrap()
        }

        fn play_at(&mut self, id: u64, _audio: &DecodedAudio, start_at: f64) {
            self.scheduled.lock().unwrap().push((id, start_at));
        }

        fn stop(&mut self, id: u64) {
            self.stopped.lock().unwrap().push(id);
        }
    }

    impl MediaDevices for FakeDevices {
        type Playback = FakePlayback;

        async fn open_microphone(&self) -> Result<MicrophoneStream, CallError> {
            if self.deny_microphone {
                return Err(CallError::PermissionDenied("prompt dismissed".to_string()));
            }
            let (tx, rx) = mpsc::channel(16);
            *self.mic_tx.lock().unwrap() = Some(tx);
            let releases = self.releases.clone();
            Ok(MicrophoneStream::new(16000, rx).with_release(move || {
                releases.fetch_add(1, Ordering::SeqCst);
            }))
        }

        async fn open_playback(&self) -> Result<FakePlayback, CallError> {
            Ok(FakePlayback {
                clock: self.clock.clone(),
                scheduled: self.scheduled.clone(),
                stopped: self.stopped.clone(),
            })
        }
    }

    impl FakeDevices {
        fn set_time(&self, t: f64) {
            *self.clock.lock().unwrap() = t;
        }

        fn starts(&self) -> Vec<f64> {
            self.scheduled.lock().unwrap().iter().map(|(_, start)| *start).collect()
        }

        fn mic(&self) -> mpsc::Sender<Vec<f32>> {
            self.mic_tx.lock().unwrap().clone().unwrap()
        }
    }

    fn controller(connector: FakeConnector, devices: FakeDevices) -> SessionController<FakeConnector, FakeDevices> {
        let mut options = ControllerOptions::from_config(&AppConfig::default());
        options.capture_frame_size = 4;
        SessionController::new(connector, devices, options)
    }

    fn take_remote(connector_remote: &Arc<Mutex<Option<Remote>>>) -> Remote {
        connector_remote.lock().unwrap().take().unwrap()
    }

    fn chunk(seconds: f64) -> String {
        let frames = (seconds * 24000.0).round() as usize;
        codec::encode_transport_audio(&vec![0.1; frames])
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_connects_and_streams_microphone() {
        let connector = FakeConnector::default();
        let remote = connector.remote.clone();
        let devices = FakeDevices::default();
        let call = controller(connector, devices.clone());

        call.start().await.unwrap();
        assert_eq!(call.phase(), CallPhase::Connected);
        assert_eq!(call.snapshot().phase, CallPhase::Connected);
        assert!(call.snapshot().call_id.is_some());

        let (mut outbound, _events) = take_remote(&remote);
        devices.mic().send(vec![0.25; 4]).await.unwrap();

        let sent = tokio::time::timeout(Duration::from_secs(2), outbound.recv()).await.unwrap();
        assert_eq!(sent, Some(Outbound::Audio(codec::encode_transport_audio(&[0.25; 4]))));
    }

    #[tokio::test]
    async fn test_clustered_chunks_play_contiguously() {
        let devices = FakeDevices::default();
        let call = controller(FakeConnector::default(), devices.clone());
        call.start().await.unwrap();

        for arrival in [2.0, 2.3, 2.35] {
            devices.set_time(arrival);
            assert!(call.shared.handle_event(ServerEvent::AudioChunk(chunk(0.5))));
        }

        let starts = devices.starts();
        assert_eq!(starts.len(), 3);
        for (actual, expected) in starts.iter().zip([2.0, 2.5, 3.0]) {
            assert!((actual - expected).abs() < 1e-9, "{} vs {}", actual, expected);
        }
    }

    #[tokio::test]
    async fn test_events_flow_through_dispatcher_in_order() {
        let connector = FakeConnector::default();
        let remote = connector.remote.clone();
        let devices = FakeDevices::default();
        let call = controller(connector, devices.clone());
        call.start().await.unwrap();
        let (_outbound, events) = take_remote(&remote);

        devices.set_time(1.0);
        for _ in 0..3 {
            events.send(ServerEvent::AudioChunk(chunk(0.25))).unwrap();
        }
        wait_for(|| devices.starts().len() == 3).await;
        assert_eq!(devices.starts(), vec![1.0, 1.25, 1.5]);

        events.send(ServerEvent::Interrupted).unwrap();
        wait_for(|| devices.stopped.lock().unwrap().len() == 3).await;
        assert_eq!(*devices.stopped.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_interruption_flushes_and_next_chunk_starts_after() {
        let devices = FakeDevices::default();
        let call = controller(FakeConnector::default(), devices.clone());
        call.start().await.unwrap();

        devices.set_time(5.0);
        call.shared.handle_event(ServerEvent::AudioChunk(chunk(0.5)));
        call.shared.handle_event(ServerEvent::AudioChunk(chunk(0.5)));

        devices.set_time(5.2);
        call.shared.handle_event(ServerEvent::Interrupted);
        assert_eq!(*devices.stopped.lock().unwrap(), vec![0, 1]);

        call.shared.handle_event(ServerEvent::AudioChunk(chunk(0.5)));
        let starts = devices.starts();
        assert!(starts[2] >= 5.2);
        assert_eq!(call.phase(), CallPhase::Connected);
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_skipped() {
        let devices = FakeDevices::default();
        let call = controller(FakeConnector::default(), devices.clone());
        call.start().await.unwrap();

        assert!(call.shared.handle_event(ServerEvent::AudioChunk("%%% not audio".to_string())));
        // Odd byte count: valid base64, invalid PCM
        assert!(call.shared.handle_event(ServerEvent::AudioChunk(codec::bytes_to_transport_text(&[1, 2, 3]))));
        assert!(call.shared.handle_event(ServerEvent::AudioChunk(chunk(0.1))));

        assert_eq!(devices.starts().len(), 1);
        assert_eq!(call.phase(), CallPhase::Connected);
        assert_eq!(call.snapshot().error, None);
    }

    #[tokio::test]
    async fn test_turns_reach_transcript_and_sink() {
        let call = controller(FakeConnector::default(), FakeDevices::default());
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        call.set_transcript_sink(sink_tx);
        call.start().await.unwrap();

        for (role, text) in [
            (SpeakerRole::Local, "Hello "),
            (SpeakerRole::Local, "world"),
            (SpeakerRole::Remote, "Hi!"),
        ] {
            call.shared.handle_event(ServerEvent::TranscriptFragment { role, text: text.to_string() });
        }
        assert_eq!(call.pending_transcript(SpeakerRole::Local), "Hello world");
        call.shared.handle_event(ServerEvent::TurnComplete);
        call.shared.handle_event(ServerEvent::TurnComplete);

        let expected = vec![
            TranscriptLine::finished(SpeakerRole::Local, "Hello world".to_string()),
            TranscriptLine::finished(SpeakerRole::Remote, "Hi!".to_string()),
        ];
        assert_eq!(call.transcript(), expected);
        assert_eq!(sink_rx.try_recv().unwrap(), expected[0]);
        assert_eq!(sink_rx.try_recv().unwrap(), expected[1]);
        assert!(sink_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let connector = FakeConnector::default();
        let remote = connector.remote.clone();
        let devices = FakeDevices::default();
        let call = controller(connector, devices.clone());
        call.start().await.unwrap();
        let (mut outbound, _events) = take_remote(&remote);

        devices.set_time(1.0);
        call.shared.handle_event(ServerEvent::AudioChunk(chunk(0.5)));

        call.end();
        let after_first = call.snapshot();
        call.end();

        assert_eq!(call.phase(), CallPhase::Closed);
        assert_eq!(call.snapshot(), after_first);
        assert_eq!(devices.releases.load(Ordering::SeqCst), 1);
        assert_eq!(*devices.stopped.lock().unwrap(), vec![0]);
        assert_eq!(outbound.try_recv().unwrap(), Outbound::Close);
        assert!(outbound.try_recv().is_err());

        drop(call);
        assert_eq!(devices.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_audio_after_end_is_discarded() {
        let devices = FakeDevices::default();
        let call = controller(FakeConnector::default(), devices.clone());
        call.start().await.unwrap();
        call.end();

        assert!(!call.shared.handle_event(ServerEvent::AudioChunk(chunk(0.5))));
        assert!(!call.shared.handle_event(ServerEvent::TurnComplete));
        assert!(devices.starts().is_empty());
    }

    #[tokio::test]
    async fn test_end_before_start_is_noop() {
        let call = controller(FakeConnector::default(), FakeDevices::default());
        call.end();
        assert_eq!(call.phase(), CallPhase::Idle);
        assert!(call.start().await.is_ok());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let call = controller(FakeConnector::default(), FakeDevices::default());
        call.start().await.unwrap();
        assert!(matches!(call.start().await, Err(CallError::InvalidState(_))));
        assert_eq!(call.phase(), CallPhase::Connected);
    }

    #[tokio::test]
    async fn test_permission_denied_fails_without_connecting() {
        let connector = FakeConnector::default();
        let remote = connector.remote.clone();
        let devices = FakeDevices {
            deny_microphone: true,
            ..FakeDevices::default()
        };
        let call = controller(connector, devices);

        let result = call.start().await;
        assert!(matches!(result, Err(CallError::PermissionDenied(_))));
        assert_eq!(call.phase(), CallPhase::Failed);
        assert!(call.snapshot().error.is_some());
        assert!(remote.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_error_closes_and_releases_microphone() {
        let connector = FakeConnector {
            fail: true,
            ..FakeConnector::default()
        };
        let devices = FakeDevices::default();
        let call = controller(connector, devices.clone());

        let result = call.start().await;
        assert!(matches!(result, Err(CallError::Connect(_))));
        assert_eq!(call.phase(), CallPhase::Closed);
        assert_eq!(call.snapshot().phase, CallPhase::Closed);
        assert_eq!(devices.releases.load(Ordering::SeqCst), 1);
        // No automatic retry, and no restart from Closed
        assert!(matches!(call.start().await, Err(CallError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_end_while_connecting_cancels_start() {
        let gate = Arc::new(Notify::new());
        let connector = FakeConnector {
            gate: Some(gate.clone()),
            ..FakeConnector::default()
        };
        let remote = connector.remote.clone();
        let devices = FakeDevices::default();
        let call = controller(connector, devices.clone());

        let (result, _) = tokio::join!(call.start(), async {
            wait_for(|| call.phase() == CallPhase::Connecting).await;
            call.end();
            gate.notify_one();
        });

        assert_eq!(result, Err(CallError::Cancelled));
        assert_eq!(call.phase(), CallPhase::Closed);
        assert_eq!(devices.releases.load(Ordering::SeqCst), 1);

        let (mut outbound, _events) = take_remote(&remote);
        assert_eq!(outbound.try_recv().unwrap(), Outbound::Close);
    }

    #[tokio::test]
    async fn test_audio_captured_while_connecting_is_not_sent() {
        let gate = Arc::new(Notify::new());
        let connector = FakeConnector {
            gate: Some(gate.clone()),
            ..FakeConnector::default()
        };
        let remote = connector.remote.clone();
        let devices = FakeDevices::default();
        let call = controller(connector, devices.clone());

        let (result, _) = tokio::join!(call.start(), async {
            wait_for(|| devices.mic_tx.lock().unwrap().is_some()).await;
            devices.mic().send(vec![0.7; 4]).await.unwrap();
            gate.notify_one();
        });
        result.unwrap();

        let (mut outbound, _events) = take_remote(&remote);
        devices.mic().send(vec![0.25; 4]).await.unwrap();

        let sent = tokio::time::timeout(Duration::from_secs(2), outbound.recv()).await.unwrap();
        assert_eq!(sent, Some(Outbound::Audio(codec::encode_transport_audio(&[0.25; 4]))));
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fatal_error_tears_down() {
        let connector = FakeConnector::default();
        let remote = connector.remote.clone();
        let devices = FakeDevices::default();
        let call = controller(connector, devices.clone());
        call.start().await.unwrap();
        let (_outbound, events) = take_remote(&remote);

        events
            .send(ServerEvent::Error { detail: "socket reset".to_string(), fatal: false })
            .unwrap();
        events
            .send(ServerEvent::Error { detail: "connection lost".to_string(), fatal: true })
            .unwrap();

        wait_for(|| call.phase() == CallPhase::Closed).await;
        assert_eq!(call.snapshot().error.as_deref(), Some("connection lost"));
        assert_eq!(devices.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mute_cuts_frames_without_backlog() {
        let connector = FakeConnector::default();
        let remote = connector.remote.clone();
        let devices = FakeDevices::default();
        let call = controller(connector, devices.clone());
        call.start().await.unwrap();
        let (mut outbound, _events) = take_remote(&remote);
        let mic = devices.mic();

        call.set_muted(true);
        assert!(call.snapshot().muted);
        mic.send(vec![0.5; 4]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(outbound.try_recv().is_err());

        call.set_muted(false);
        mic.send(vec![-0.5; 4]).await.unwrap();
        let sent = tokio::time::timeout(Duration::from_secs(2), outbound.recv()).await.unwrap();
        assert_eq!(sent, Some(Outbound::Audio(codec::encode_transport_audio(&[-0.5; 4]))));
        assert!(outbound.try_recv().is_err());

        call.set_video_enabled(false);
        assert!(!call.snapshot().video_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_counter_runs_while_connected() {
        let call = controller(FakeConnector::default(), FakeDevices::default());
        call.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(call.snapshot().elapsed_seconds, 3);

        call.end();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(call.snapshot().elapsed_seconds, 3);
    }
}
