//! Live conversation session
//! Owns the transport, microphone, speaker and transcript for one conversation and
//! serializes every transition behind a single lock

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::protocol::ServerContent;
use super::transcript::{PendingTurn, TranscriptAggregator, Turn};
use super::transport::{SessionTransport, TransportEvent, TransportHandle};
use crate::audio::{
    calculate_rms, codec, rms_to_level, AudioBackend, CaptureSource, PcmBuffer, PlaybackScheduler,
};
use crate::config::LiveConfig;
use crate::error::{LiveError, Result};

/// What the UI renders
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// `start()` is honored only from these states
    pub fn can_start(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }

    /// A session is in flight
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    /// Label for the single start/stop control
    pub fn action_label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "START TRANSMISSION",
            ConnectionState::Connecting => "CONNECTING...",
            ConnectionState::Connected => "END TRANSMISSION",
            ConnectionState::Error => "RETRY CONNECTION",
        }
    }
}

/// Notifications for whoever draws the conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    Pending(PendingTurn),
    TurnRecorded(Turn),
}

#[derive(Default)]
struct SessionInner {
    state: ConnectionState,
    /// Bumped on every start and every teardown; events from older generations are dropped
    generation: u64,
    transport: Option<Arc<dyn TransportHandle>>,
    capture: Option<Box<dyn CaptureSource>>,
    scheduler: Option<PlaybackScheduler>,
    transcript: TranscriptAggregator,
    turns: Vec<Turn>,
}

impl SessionInner {
    fn holds_resources(&self) -> bool {
        self.transport.is_some() || self.capture.is_some() || self.scheduler.is_some()
    }
}

struct Shared {
    config: LiveConfig,
    transport: Arc<dyn SessionTransport>,
    audio: Arc<dyn AudioBackend>,
    inner: Mutex<SessionInner>,
    observer: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    input_level: Arc<Mutex<f32>>,
}

/// Live voice conversation with the remote model.
///
/// `start()` and `stop()` are the whole control surface. Transport callbacks
/// arrive on one channel drained by one task, so they are applied in arrival
/// order and never race a concurrent `stop()`.
pub struct LiveSession {
    shared: Arc<Shared>,
}

impl LiveSession {
    pub fn new(
        config: LiveConfig,
        transport: Arc<dyn SessionTransport>,
        audio: Arc<dyn AudioBackend>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                audio,
                inner: Mutex::new(SessionInner::default()),
                observer: Mutex::new(None),
                input_level: Arc::new(Mutex::new(0.0)),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Finished turns of the current (or last) session
    pub fn turns(&self) -> Vec<Turn> {
        self.shared.inner.lock().turns.clone()
    }

    /// Turn in progress
    pub fn pending(&self) -> PendingTurn {
        self.shared.inner.lock().transcript.pending()
    }

    /// Level of the last microphone frame sent (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.shared.input_level.lock()
    }

    /// Receive session events. A new subscriber replaces the previous one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.observer.lock() = Some(tx);
        rx
    }

    /// Begin connecting. Returns immediately; no-op while a session is in flight.
    pub fn start(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();

        if !inner.state.can_start() {
            tracing::debug!("Ignoring start while {:?}", inner.state);
            return;
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner.turns.clear();
        inner.transcript.clear();
        shared.set_state(&mut inner, ConnectionState::Connecting);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                shared.fail(
                    &mut inner,
                    LiveError::TransportOpenFailed(format!("no async runtime: {}", e)),
                );
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        match shared.transport.open(&shared.config, tx) {
            Ok(handle) => inner.transport = Some(handle),
            Err(e) => {
                shared.fail(&mut inner, e);
                return;
            }
        }
        drop(inner);

        let pump = shared.clone();
        runtime.spawn(async move { pump.pump(generation, rx).await });
    }

    /// Tear everything down and return to `Disconnected`. Idempotent.
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();

        if inner.state == ConnectionState::Disconnected && !inner.holds_resources() {
            return;
        }

        shared.teardown(&mut inner);
        inner.generation += 1;
        shared.set_state(&mut inner, ConnectionState::Disconnected);
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    async fn pump(self: Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(generation, event) {
                return;
            }
        }
        // Transport went away without saying so
        self.handle_event(generation, TransportEvent::Close);
    }

    /// Apply one transport event. Returns false once this generation is over.
    fn handle_event(&self, generation: u64, event: TransportEvent) -> bool {
        // Decoding is the only heavy step; keep it outside the lock
        let audio = match &event {
            TransportEvent::Message(content) => self.decode_audio(content),
            _ => Vec::new(),
        };

        let mut inner = self.inner.lock();
        if inner.generation != generation || !inner.state.is_active() {
            tracing::debug!("Dropping stale transport event");
            return false;
        }

        match event {
            TransportEvent::Open => self.on_open(&mut inner),
            TransportEvent::Message(content) => self.on_message(&mut inner, &content, audio),
            TransportEvent::Error(e) if !e.is_fatal() => {
                tracing::warn!("Ignoring recoverable transport error: {}", e);
            }
            TransportEvent::Error(e) => self.fail(&mut inner, e),
            TransportEvent::Close => {
                tracing::info!("Live session closed");
                self.teardown(&mut inner);
                inner.generation += 1;
                self.set_state(&mut inner, ConnectionState::Disconnected);
            }
        }

        inner.generation == generation
    }

    fn on_open(&self, inner: &mut SessionInner) {
        if inner.state != ConnectionState::Connecting {
            return;
        }
        self.set_state(inner, ConnectionState::Connected);

        if let Err(e) = self.acquire_devices(inner) {
            self.fail(inner, e);
        }
    }

    /// Speaker first, then microphone. Whatever was acquired is stored so teardown releases it.
    fn acquire_devices(&self, inner: &mut SessionInner) -> Result<()> {
        let transport = inner
            .transport
            .clone()
            .ok_or_else(|| LiveError::Transport("transport missing on open".to_string()))?;

        let sink = self.audio.open_playback()?;
        inner.scheduler = Some(PlaybackScheduler::new(sink));

        let mut capture = self
            .audio
            .open_capture(self.config.input_sample_rate, self.config.frame_size)?;

        let rate = self.config.input_sample_rate;
        let level = self.input_level.clone();
        let started = capture.start(Box::new(move |frame: Vec<f32>| {
            *level.lock() = rms_to_level(calculate_rms(&frame));
            transport.send(codec::encode(&frame, rate));
        }));
        inner.capture = Some(capture);
        started?;

        tracing::info!("Audio devices acquired");
        Ok(())
    }

    fn on_message(&self, inner: &mut SessionInner, content: &ServerContent, audio: Vec<PcmBuffer>) {
        let mut pending_changed = false;

        if let Some(input) = &content.input_transcription {
            inner.transcript.append_input(&input.text);
            pending_changed = true;
        }
        if let Some(output) = &content.output_transcription {
            inner.transcript.append_output(&output.text);
            pending_changed = true;
        }

        if content.turn_complete {
            if let Some(turn) = inner.transcript.finalize_turn() {
                tracing::debug!("Turn recorded ({} turns)", inner.turns.len() + 1);
                inner.turns.push(turn.clone());
                self.notify(SessionEvent::TurnRecorded(turn));
            }
            pending_changed = true;
        }

        if pending_changed {
            self.notify(SessionEvent::Pending(inner.transcript.pending()));
        }

        for buffer in audio {
            match inner.scheduler.as_mut() {
                Some(scheduler) => {
                    scheduler.enqueue(buffer);
                }
                None => tracing::debug!("Dropping audio chunk: playback not started"),
            }
        }
    }

    fn decode_audio(&self, content: &ServerContent) -> Vec<PcmBuffer> {
        content
            .audio_chunks()
            .filter_map(|chunk| {
                let rate = chunk
                    .mime_type
                    .as_deref()
                    .and_then(codec::parse_rate)
                    .unwrap_or(self.config.output_sample_rate);
                if !codec::SUPPORTED_RATES.contains(&rate) {
                    tracing::warn!("Dropping audio chunk: unsupported rate {}", rate);
                    return None;
                }

                match codec::decode(&chunk.data) {
                    Ok(samples) => Some(PcmBuffer::new(samples, rate)),
                    Err(e) => {
                        tracing::warn!("Dropping audio chunk: {}", e);
                        None
                    }
                }
            })
            .collect()
    }

    /// Release in dependency order: network, then microphone, then speaker.
    fn teardown(&self, inner: &mut SessionInner) {
        if let Some(transport) = inner.transport.take() {
            transport.close();
        }
        if let Some(mut capture) = inner.capture.take() {
            capture.stop();
        }
        if let Some(mut scheduler) = inner.scheduler.take() {
            scheduler.release();
        }
        inner.transcript.clear();
        *self.input_level.lock() = 0.0;
    }

    fn fail(&self, inner: &mut SessionInner, error: LiveError) {
        tracing::error!("Live session failed: {}", error);
        self.teardown(inner);
        inner.generation += 1;
        self.set_state(inner, ConnectionState::Error);
    }

    fn set_state(&self, inner: &mut SessionInner, state: ConnectionState) {
        if inner.state == state {
            return;
        }
        tracing::info!("Live session: {:?} -> {:?}", inner.state, state);
        inner.state = state;
        self.notify(SessionEvent::StateChanged(state));
    }

    fn notify(&self, event: SessionEvent) {
        let mut observer = self.observer.lock();
        if let Some(tx) = observer.as_ref() {
            if tx.send(event).is_err() {
                *observer = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioPayload, FrameCallback, PlaybackSink};
    use crate::live::protocol::{InlineData, ModelTurn, Part, Transcription};
    use crate::live::transport::EventSender;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Order in which transport and devices were released
    type ReleaseLog = Arc<Mutex<Vec<&'static str>>>;

    #[derive(Default)]
    struct MockHandle {
        open: AtomicBool,
        sent: Mutex<Vec<AudioPayload>>,
        closes: AtomicUsize,
        releases: ReleaseLog,
    }

    impl TransportHandle for MockHandle {
        fn send(&self, payload: AudioPayload) {
            if self.is_open() {
                self.sent.lock().push(payload);
            }
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.releases.lock().push("transport");
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct MockTransport {
        fail_open: bool,
        links: Mutex<Vec<(EventSender, Arc<MockHandle>)>>,
        releases: ReleaseLog,
    }

    impl MockTransport {
        fn opens(&self) -> usize {
            self.links.lock().len()
        }

        fn handle(&self, index: usize) -> Arc<MockHandle> {
            self.links.lock()[index].1.clone()
        }

        fn emit(&self, index: usize, event: TransportEvent) {
            let links = self.links.lock();
            let (events, handle) = &links[index];
            if event == TransportEvent::Open {
                handle.open.store(true, Ordering::SeqCst);
            }
            let _ = events.send(event);
        }

        fn emit_latest(&self, event: TransportEvent) {
            let last = self.opens() - 1;
            self.emit(last, event);
        }
    }

    impl SessionTransport for MockTransport {
        fn open(&self, _config: &LiveConfig, events: EventSender) -> Result<Arc<dyn TransportHandle>> {
            if self.fail_open {
                return Err(LiveError::TransportOpenFailed("refused".to_string()));
            }
            let handle = Arc::new(MockHandle {
                releases: self.releases.clone(),
                ..Default::default()
            });
            self.links.lock().push((events, handle.clone()));
            Ok(handle)
        }
    }

    #[derive(Default)]
    struct DeviceCounters {
        capture_acquired: AtomicUsize,
        capture_released: AtomicUsize,
        playback_acquired: AtomicUsize,
        playback_released: AtomicUsize,
    }

    impl DeviceCounters {
        fn get(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }

        fn balanced(&self) -> bool {
            Self::get(&self.capture_acquired) == Self::get(&self.capture_released)
                && Self::get(&self.playback_acquired) == Self::get(&self.playback_released)
        }
    }

    struct MockCapture {
        counters: Arc<DeviceCounters>,
        releases: ReleaseLog,
        callback: Arc<Mutex<Option<FrameCallback>>>,
        fail_start: Option<LiveError>,
        stopped: bool,
    }

    impl CaptureSource for MockCapture {
        fn start(&mut self, on_frame: FrameCallback) -> Result<()> {
            if let Some(e) = self.fail_start.clone() {
                return Err(e);
            }
            *self.callback.lock() = Some(on_frame);
            Ok(())
        }

        fn stop(&mut self) {
            if self.stopped {
                return;
            }
            self.stopped = true;
            *self.callback.lock() = None;
            self.counters.capture_released.fetch_add(1, Ordering::SeqCst);
            self.releases.lock().push("capture");
        }
    }

    struct MockSink {
        counters: Arc<DeviceCounters>,
        releases: ReleaseLog,
        scheduled: Arc<Mutex<Vec<(f64, PcmBuffer)>>>,
        closed: bool,
    }

    impl PlaybackSink for MockSink {
        fn current_time(&self) -> f64 {
            0.0
        }

        fn schedule(&mut self, start_at: f64, buffer: PcmBuffer) {
            self.scheduled.lock().push((start_at, buffer));
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.counters.playback_released.fetch_add(1, Ordering::SeqCst);
                self.releases.lock().push("playback");
            }
        }
    }

    #[derive(Default)]
    struct MockBackend {
        counters: Arc<DeviceCounters>,
        releases: ReleaseLog,
        callback: Arc<Mutex<Option<FrameCallback>>>,
        scheduled: Arc<Mutex<Vec<(f64, PcmBuffer)>>>,
        fail_start: Option<LiveError>,
    }

    impl MockBackend {
        fn push_frame(&self, frame: Vec<f32>) {
            if let Some(callback) = self.callback.lock().as_mut() {
                callback(frame);
            }
        }
    }

    impl AudioBackend for MockBackend {
        fn open_capture(&self, sample_rate: u32, frame_size: usize) -> Result<Box<dyn CaptureSource>> {
            assert_eq!(sample_rate, 16000);
            assert_eq!(frame_size, 4096);
            self.counters.capture_acquired.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockCapture {
                counters: self.counters.clone(),
                releases: self.releases.clone(),
                callback: self.callback.clone(),
                fail_start: self.fail_start.clone(),
                stopped: false,
            }))
        }

        fn open_playback(&self) -> Result<Box<dyn PlaybackSink>> {
            self.counters.playback_acquired.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSink {
                counters: self.counters.clone(),
                releases: self.releases.clone(),
                scheduled: self.scheduled.clone(),
                closed: false,
            }))
        }
    }

    fn session_with(transport: MockTransport, backend: MockBackend) -> (LiveSession, Arc<MockTransport>, Arc<MockBackend>) {
        let transport = Arc::new(transport);
        let backend = Arc::new(backend);
        let session = LiveSession::new(LiveConfig::default(), transport.clone(), backend.clone());
        (session, transport, backend)
    }

    fn session() -> (LiveSession, Arc<MockTransport>, Arc<MockBackend>) {
        session_with(MockTransport::default(), MockBackend::default())
    }

    /// Session whose transport and devices share one release log
    async fn connected_with_log() -> (LiveSession, Arc<MockTransport>, Arc<MockBackend>, ReleaseLog) {
        let releases = ReleaseLog::default();
        let transport = MockTransport {
            releases: releases.clone(),
            ..Default::default()
        };
        let backend = MockBackend {
            releases: releases.clone(),
            ..Default::default()
        };
        let (session, transport, backend) = session_with(transport, backend);
        session.start();
        transport.emit_latest(TransportEvent::Open);
        eventually("connected", || session.state() == ConnectionState::Connected).await;
        (session, transport, backend, releases)
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn connected() -> (LiveSession, Arc<MockTransport>, Arc<MockBackend>) {
        let (session, transport, backend) = session();
        session.start();
        transport.emit_latest(TransportEvent::Open);
        eventually("connected", || session.state() == ConnectionState::Connected).await;
        (session, transport, backend)
    }

    fn input(text: &str) -> TransportEvent {
        TransportEvent::Message(ServerContent {
            input_transcription: Some(Transcription { text: text.to_string() }),
            ..Default::default()
        })
    }

    fn audio_message(chunks: &[(&str, Option<&str>)]) -> TransportEvent {
        let parts = chunks
            .iter()
            .map(|(data, mime)| Part {
                inline_data: Some(InlineData {
                    data: data.to_string(),
                    mime_type: mime.map(str::to_string),
                }),
            })
            .collect();
        TransportEvent::Message(ServerContent {
            model_turn: Some(ModelTurn { parts }),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_captured_frame_reaches_transport() {
        let (session, transport, backend) = connected().await;
        assert_eq!(DeviceCounters::get(&backend.counters.capture_acquired), 1);
        assert_eq!(DeviceCounters::get(&backend.counters.playback_acquired), 1);

        backend.push_frame(vec![0.0; 4096]);

        let sent = transport.handle(0).sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].mime_type, "audio/pcm;rate=16000");
        assert_eq!(codec::decode(&sent[0].data).unwrap(), vec![0i16; 4096]);
        assert_eq!(session.input_level(), 0.0);

        backend.push_frame(vec![0.5; 4096]);
        assert!(session.input_level() > 0.8);
        assert_eq!(transport.handle(0).sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_fragments_accumulate_into_turn() {
        let (session, transport, _) = connected().await;

        transport.emit_latest(input("Hel"));
        transport.emit_latest(input("lo"));
        eventually("pending input", || session.pending().input == "Hello").await;

        transport.emit_latest(TransportEvent::Message(ServerContent {
            turn_complete: true,
            ..Default::default()
        }));
        eventually("turn", || !session.turns().is_empty()).await;

        assert_eq!(
            session.turns(),
            vec![Turn {
                user_text: "Hello".to_string(),
                model_text: String::new(),
            }]
        );
        assert!(session.pending().is_empty());
    }

    #[tokio::test]
    async fn test_fragment_in_completing_message_is_kept() {
        let (session, transport, _) = connected().await;

        transport.emit_latest(input("What is "));
        transport.emit_latest(TransportEvent::Message(ServerContent {
            input_transcription: Some(Transcription { text: "gravity?".to_string() }),
            output_transcription: Some(Transcription { text: "A force.".to_string() }),
            turn_complete: true,
            ..Default::default()
        }));
        eventually("turn", || session.turns().len() == 1).await;

        let turn = &session.turns()[0];
        assert_eq!(turn.user_text, "What is gravity?");
        assert_eq!(turn.model_text, "A force.");
    }

    #[tokio::test]
    async fn test_empty_turn_is_not_recorded() {
        let (session, transport, _) = connected().await;

        transport.emit_latest(input("   "));
        transport.emit_latest(TransportEvent::Message(ServerContent {
            turn_complete: true,
            ..Default::default()
        }));
        transport.emit_latest(input("next"));
        eventually("next pending", || session.pending().input == "next").await;

        assert!(session.turns().is_empty());
    }

    #[tokio::test]
    async fn test_audio_is_scheduled_in_order_and_bad_chunks_dropped() {
        let (session, transport, backend) = connected().await;

        let tenth_of_second = codec::encode(&vec![0.25; 2400], 24000).data;
        let at_16k = codec::encode(&vec![0.25; 1600], 16000).data;
        transport.emit_latest(audio_message(&[
            (tenth_of_second.as_str(), Some("audio/pcm;rate=24000")),
            ("%%% not audio %%%", None),
            (tenth_of_second.as_str(), None),
            (at_16k.as_str(), Some("audio/pcm;rate=16000")),
        ]));
        eventually("scheduled audio", || backend.scheduled.lock().len() == 3).await;

        let scheduled = backend.scheduled.lock().clone();
        let starts: Vec<f64> = scheduled.iter().map(|(start, _)| *start).collect();
        assert_eq!(starts, vec![0.0, 0.1, 0.2]);
        assert_eq!(scheduled[1].1.sample_rate, 24000);
        assert_eq!(scheduled[2].1.sample_rate, 16000);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_implausible_rate_falls_back_to_output_rate() {
        let (_session, transport, backend) = connected().await;

        let chunk = codec::encode(&vec![0.25; 2400], 24000).data;
        transport.emit_latest(audio_message(&[
            (chunk.as_str(), Some("audio/pcm;rate=0")),
            (chunk.as_str(), Some("audio/pcm;rate=1")),
            (chunk.as_str(), None),
        ]));
        eventually("scheduled audio", || backend.scheduled.lock().len() == 3).await;

        let scheduled = backend.scheduled.lock().clone();
        let starts: Vec<f64> = scheduled.iter().map(|(start, _)| *start).collect();
        let rates: Vec<u32> = scheduled.iter().map(|(_, buffer)| buffer.sample_rate).collect();
        assert_eq!(rates, vec![24000, 24000, 24000]);
        // back to back, never on top of each other
        for pair in starts.windows(2) {
            assert!((pair[1] - pair[0] - 0.1).abs() < 1e-9, "{:?}", starts);
        }
    }

    #[tokio::test]
    async fn test_unsupported_fallback_rate_drops_chunk() {
        let config = LiveConfig {
            output_sample_rate: 0,
            ..Default::default()
        };
        let transport = Arc::new(MockTransport::default());
        let backend = Arc::new(MockBackend::default());
        let session = LiveSession::new(config, transport.clone(), backend.clone());
        session.start();
        transport.emit_latest(TransportEvent::Open);
        eventually("connected", || session.state() == ConnectionState::Connected).await;

        let chunk = codec::encode(&vec![0.25; 2400], 24000).data;
        transport.emit_latest(audio_message(&[
            (chunk.as_str(), None),
            (chunk.as_str(), Some("audio/pcm;rate=24000")),
        ]));
        eventually("scheduled audio", || backend.scheduled.lock().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let scheduled = backend.scheduled.lock().clone();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].1.sample_rate, 24000);
    }

    #[tokio::test]
    async fn test_stop_releases_in_order() {
        let (session, _transport, _backend, releases) = connected_with_log().await;
        session.stop();
        assert_eq!(*releases.lock(), vec!["transport", "capture", "playback"]);
    }

    #[tokio::test]
    async fn test_error_releases_in_order() {
        let (session, transport, _backend, releases) = connected_with_log().await;
        transport.emit_latest(TransportEvent::Error(LiveError::Transport("reset".to_string())));
        eventually("error state", || session.state() == ConnectionState::Error).await;
        assert_eq!(*releases.lock(), vec!["transport", "capture", "playback"]);
    }

    #[tokio::test]
    async fn test_recoverable_transport_error_keeps_session() {
        let (session, transport, backend) = connected().await;
        transport.emit_latest(TransportEvent::Error(LiveError::Decode("bad frame".to_string())));
        transport.emit_latest(input("still here"));
        eventually("pending text", || session.pending().input == "still here").await;

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(DeviceCounters::get(&backend.counters.capture_released), 0);
        assert_eq!(transport.handle(0).closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_while_connected_releases_once_and_allows_retry() {
        let (session, transport, backend) = connected().await;
        transport.emit_latest(input("half"));

        transport.emit_latest(TransportEvent::Error(LiveError::Transport("reset".to_string())));
        eventually("error state", || session.state() == ConnectionState::Error).await;

        assert_eq!(DeviceCounters::get(&backend.counters.capture_released), 1);
        assert_eq!(DeviceCounters::get(&backend.counters.playback_released), 1);
        assert_eq!(transport.handle(0).closes.load(Ordering::SeqCst), 1);
        assert!(session.pending().is_empty());

        session.start();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(transport.opens(), 2);

        // leftovers from the failed link are ignored
        transport.emit(0, TransportEvent::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(DeviceCounters::get(&backend.counters.capture_released), 1);
        assert_eq!(DeviceCounters::get(&backend.counters.capture_acquired), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_balances_devices() {
        let (session, transport, backend) = session();
        let mut events = session.subscribe();

        session.stop();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());

        session.start();
        transport.emit_latest(TransportEvent::Open);
        eventually("connected", || session.state() == ConnectionState::Connected).await;

        session.stop();
        session.stop();
        session.stop();

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(backend.counters.balanced());
        assert_eq!(DeviceCounters::get(&backend.counters.capture_acquired), 1);
        assert_eq!(transport.handle(0).closes.load(Ordering::SeqCst), 1);

        // frames captured after stop go nowhere
        backend.push_frame(vec![0.0; 4096]);
        assert!(transport.handle(0).sent.lock().is_empty());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                SessionEvent::StateChanged(ConnectionState::Connecting),
                SessionEvent::StateChanged(ConnectionState::Connected),
                SessionEvent::StateChanged(ConnectionState::Disconnected),
            ]
        );
    }

    #[tokio::test]
    async fn test_late_events_after_stop_are_ignored() {
        let (session, transport, backend) = connected().await;
        session.stop();

        transport.emit(0, input("ghost"));
        transport.emit(0, TransportEvent::Message(ServerContent {
            turn_complete: true,
            ..Default::default()
        }));
        transport.emit(0, TransportEvent::Error(LiveError::Transport("late".to_string())));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.turns().is_empty());
        assert!(backend.counters.balanced());
    }

    #[tokio::test]
    async fn test_stop_while_connecting() {
        let (session, transport, backend) = session();
        session.start();
        assert_eq!(session.state(), ConnectionState::Connecting);

        session.stop();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(transport.handle(0).closes.load(Ordering::SeqCst), 1);

        // the open that was already in flight must not revive the session
        transport.emit(0, TransportEvent::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(DeviceCounters::get(&backend.counters.capture_acquired), 0);
    }

    #[tokio::test]
    async fn test_remote_close_returns_to_disconnected() {
        let (session, transport, backend) = connected().await;
        transport.emit_latest(TransportEvent::Close);
        eventually("disconnected", || session.state() == ConnectionState::Disconnected).await;
        assert!(backend.counters.balanced());
        assert_eq!(DeviceCounters::get(&backend.counters.playback_released), 1);
    }

    #[tokio::test]
    async fn test_start_is_ignored_while_active() {
        let (session, transport, _) = connected().await;
        session.start();
        assert_eq!(transport.opens(), 1);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_start_clears_previous_turns() {
        let (session, transport, _) = connected().await;
        transport.emit_latest(TransportEvent::Message(ServerContent {
            output_transcription: Some(Transcription { text: "Hi there".to_string() }),
            turn_complete: true,
            ..Default::default()
        }));
        eventually("turn", || session.turns().len() == 1).await;

        session.stop();
        assert_eq!(session.turns().len(), 1);
        session.start();
        assert!(session.turns().is_empty());
    }

    #[tokio::test]
    async fn test_microphone_refusal_ends_in_error() {
        let backend = MockBackend {
            fail_start: Some(LiveError::PermissionDenied),
            ..Default::default()
        };
        let (session, transport, backend) = session_with(MockTransport::default(), backend);
        session.start();
        transport.emit_latest(TransportEvent::Open);
        eventually("error state", || session.state() == ConnectionState::Error).await;

        assert_eq!(DeviceCounters::get(&backend.counters.capture_acquired), 1);
        assert!(backend.counters.balanced());
        assert_eq!(transport.handle(0).closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failure_ends_in_error() {
        let transport = MockTransport {
            fail_open: true,
            ..Default::default()
        };
        let (session, _, _) = session_with(transport, MockBackend::default());
        session.start();
        assert_eq!(session.state(), ConnectionState::Error);

        session.stop();
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_vanishing_counts_as_close() {
        let (session, transport, backend) = connected().await;
        transport.links.lock().clear();
        eventually("disconnected", || session.state() == ConnectionState::Disconnected).await;
        assert!(backend.counters.balanced());
    }

    #[tokio::test]
    async fn test_dropping_session_releases_devices() {
        let (session, _transport, backend) = connected().await;
        drop(session);
        assert!(backend.counters.balanced());
        assert_eq!(DeviceCounters::get(&backend.counters.capture_released), 1);
    }

    #[test]
    fn test_start_without_runtime_is_error() {
        let (session, transport, _) = session();
        session.start();
        assert_eq!(session.state(), ConnectionState::Error);
        assert_eq!(transport.opens(), 0);
    }

    #[test]
    fn test_action_labels() {
        assert_eq!(ConnectionState::Disconnected.action_label(), "START TRANSMISSION");
        assert_eq!(ConnectionState::Connecting.action_label(), "CONNECTING...");
        assert_eq!(ConnectionState::Connected.action_label(), "END TRANSMISSION");
        assert_eq!(ConnectionState::Error.action_label(), "RETRY CONNECTION");
    }
}
