//! Conversation controller
//!
//! The controller is the single owner of conversation state. Every producer
//! (presentation commands, transport tasks, the playback worker, device
//! acquisition threads) posts a [`ControlEvent`] into one channel; the control
//! loop handles those events in order and, on every tick, pumps captured audio
//! through the level meter and the VAD and fires due timers.
//!
//! Observers get a [`ClientHandle`]: one command (`toggle_conversation`), a
//! read-only shared snapshot, and a stream of snapshots published whenever
//! anything visible changes.

use crate::audio::input::{self, CaptureDevice, CaptureStream};
use crate::audio::level::LevelMeter;
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::playback::{BackendFactory, PlaybackEngine, PlaybackEvent};
use crate::recorder::UtteranceRecorder;
use crate::state::{status, ConversationSnapshot, ConversationState, SharedSnapshot};
use crate::transport::{Cart, EventSink, Transport, TransportEvent};
use crate::vad::{ListenMode, VadEvent, VoiceActivityDetector};
use crate::{Result, VoiceError};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use serde::Deserialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the playback worker checks for completion
const PLAYBACK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Listen and re-arm timing
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Delay before opening the microphone for the user's turn
    pub auto_listen_delay_ms: u64,

    /// Delay before opening the microphone while the agent speaks
    pub barge_in_listen_delay_ms: u64,

    /// Delay before listening again after a discarded capture
    pub rearm_delay_ms: u64,

    /// How long shown items stay visible
    pub display_items_ttl_ms: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            auto_listen_delay_ms: 300,
            barge_in_listen_delay_ms: 100,
            rearm_delay_ms: 1000,
            display_items_ttl_ms: 10_000,
        }
    }
}

/// Everything the control loop reacts to
pub enum ControlEvent {
    /// Start or stop the conversation
    Toggle,

    /// Inbound transport event
    Transport(TransportEvent),

    /// Device acquisition finished for a capture session
    CaptureOpened {
        capture_id: u64,
        result: Result<CaptureStream>,
    },

    /// Playback worker report
    Playback(PlaybackEvent),

    /// Stop the control loop
    Shutdown,
}

/// External collaborators of the controller
pub struct ClientParts {
    pub transport: Box<dyn Transport>,
    pub capture_device: Arc<dyn CaptureDevice>,
    pub playback_backend: BackendFactory,
    pub clock: Arc<dyn Clock>,
}

/// Handle for observing and driving a running conversation
#[derive(Clone)]
pub struct ClientHandle {
    command_tx: Sender<ControlEvent>,
    snapshot_rx: Receiver<ConversationSnapshot>,
    shared: SharedSnapshot,
}

impl ClientHandle {
    /// Start the conversation if stopped, stop it if running
    pub fn toggle_conversation(&self) -> Result<()> {
        self.send(ControlEvent::Toggle)
    }

    /// Stop the control loop and release all devices
    pub fn shutdown(&self) -> Result<()> {
        self.send(ControlEvent::Shutdown)
    }

    fn send(&self, event: ControlEvent) -> Result<()> {
        self.command_tx
            .send(event)
            .map_err(|e| VoiceError::ChannelError(format!("Failed to send command: {}", e)))
    }

    /// Try to receive a published snapshot (non-blocking)
    pub fn try_recv_snapshot(&self) -> Option<ConversationSnapshot> {
        self.snapshot_rx.try_recv().ok()
    }

    /// Receive the next published snapshot, waiting at most `timeout`
    pub fn recv_snapshot_timeout(&self, timeout: Duration) -> Option<ConversationSnapshot> {
        self.snapshot_rx.recv_timeout(timeout).ok()
    }

    /// Snapshot stream receiver, for use in `select!`
    pub fn snapshots(&self) -> &Receiver<ConversationSnapshot> {
        &self.snapshot_rx
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.shared.snapshot()
    }

    pub fn shared(&self) -> &SharedSnapshot {
        &self.shared
    }

    pub fn state(&self) -> ConversationState {
        self.shared.state()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureSlot {
    Closed,
    Acquiring { capture_id: u64, mode: ListenMode },
    Open { mode: ListenMode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingListen {
    at_ms: u64,
    mode: ListenMode,
}

/// Turn-taking state machine
pub struct ConversationController {
    config: ClientConfig,
    clock: Arc<dyn Clock>,

    events_tx: Sender<ControlEvent>,
    events_rx: Receiver<ControlEvent>,

    // Collaborators
    transport: Box<dyn Transport>,
    playback: PlaybackEngine,
    capture_device: Arc<dyn CaptureDevice>,
    recorder: UtteranceRecorder,
    meter: Option<LevelMeter>,
    vad: VoiceActivityDetector,

    // Capture and timers
    capture: CaptureSlot,
    next_capture_id: u64,
    pending_listen: Option<PendingListen>,
    display_expiry_ms: Option<u64>,
    connecting: bool,
    ever_opened: bool,

    // Authoritative state and its observers
    view: ConversationSnapshot,
    shared: SharedSnapshot,
    published: ConversationSnapshot,
    snapshot_tx: Sender<ConversationSnapshot>,
}

impl ConversationController {
    /// Create a controller and the handle observers use
    ///
    /// The controller does nothing until driven by [`run`](Self::run),
    /// [`spawn`](Self::spawn) or manual `process_pending`/`tick` calls.
    ///
    /// # Errors
    /// `ConfigError` for an invalid configuration, `PlaybackFailed` if the
    /// playback worker cannot start.
    pub fn new(config: ClientConfig, parts: ClientParts) -> Result<(Self, ClientHandle)> {
        config.validate()?;

        let (events_tx, events_rx) = unbounded();
        let (snapshot_tx, snapshot_rx) = bounded(config.channel_buffer_size);
        let shared = SharedSnapshot::new();

        let playback_tx = events_tx.clone();
        let playback = PlaybackEngine::spawn(
            parts.playback_backend,
            move |event| {
                let _ = playback_tx.send(ControlEvent::Playback(event));
            },
            PLAYBACK_POLL_INTERVAL,
        )?;

        let handle = ClientHandle {
            command_tx: events_tx.clone(),
            snapshot_rx,
            shared: shared.clone(),
        };

        let controller = Self {
            recorder: UtteranceRecorder::new(config.recorder.clone()),
            vad: VoiceActivityDetector::new(config.vad.clone()),
            config,
            clock: parts.clock,
            events_tx,
            events_rx,
            transport: parts.transport,
            playback,
            capture_device: parts.capture_device,
            meter: None,
            capture: CaptureSlot::Closed,
            next_capture_id: 1,
            pending_listen: None,
            display_expiry_ms: None,
            connecting: false,
            ever_opened: false,
            view: ConversationSnapshot::default(),
            shared,
            published: ConversationSnapshot::default(),
            snapshot_tx,
        };

        Ok((controller, handle))
    }

    /// Current (unpublished) view of the conversation
    pub fn snapshot(&self) -> &ConversationSnapshot {
        &self.view
    }

    pub fn state(&self) -> ConversationState {
        self.view.state
    }

    /// True while a capture device is open
    pub fn is_capturing(&self) -> bool {
        self.recorder.is_open()
    }

    /// True while a capture device is being acquired
    pub fn is_acquiring(&self) -> bool {
        matches!(self.capture, CaptureSlot::Acquiring { .. })
    }

    /// Mode of the open or pending capture
    pub fn listen_mode(&self) -> Option<ListenMode> {
        match self.capture {
            CaptureSlot::Closed => None,
            CaptureSlot::Acquiring { mode, .. } | CaptureSlot::Open { mode } => Some(mode),
        }
    }

    /// True while a listen or re-arm is scheduled
    pub fn has_pending_listen(&self) -> bool {
        self.pending_listen.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.is_playing()
    }

    /// True while the VAD has a silence deadline armed
    pub fn silence_timer_armed(&self) -> bool {
        self.vad.state().silence_timer_armed
    }

    /// Run the control loop on a new thread
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("conversation".into())
            .spawn(move || self.run())
            .map_err(|e| VoiceError::ChannelError(format!("Failed to spawn control loop: {}", e)))
    }

    /// Main control loop
    pub fn run(mut self) {
        info!("Conversation controller starting");
        self.publish();

        let events_rx = self.events_rx.clone();
        let tick = Duration::from_millis(self.config.poll_interval_ms);
        let mut next_tick = Instant::now() + tick;

        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());

            select! {
                recv(events_rx) -> msg => match msg {
                    Ok(event) => {
                        if !self.handle(event) {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Control channel error: {}", e);
                        break;
                    }
                },
                default(timeout) => {}
            }

            let now = Instant::now();
            if now >= next_tick {
                self.tick();
                next_tick += tick;
                if next_tick < now {
                    // Fell behind; skip missed ticks
                    next_tick = now + tick;
                }
            }

            self.publish();
        }

        self.publish();
        info!("Conversation controller stopped");
    }

    /// Handle every queued event without blocking
    ///
    /// Returns false once a shutdown has been handled.
    pub fn process_pending(&mut self) -> bool {
        while let Ok(event) = self.events_rx.try_recv() {
            if !self.handle(event) {
                self.publish();
                return false;
            }
        }
        self.publish();
        true
    }

    /// Handle one event; returns false on shutdown
    pub fn handle(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Toggle => self.on_toggle(),
            ControlEvent::Transport(event) => self.on_transport(event),
            ControlEvent::CaptureOpened { capture_id, result } => {
                self.on_capture_opened(capture_id, result)
            }
            ControlEvent::Playback(event) => self.on_playback(event),
            ControlEvent::Shutdown => {
                info!("Shutdown requested");
                self.teardown();
                self.transport.close();
                self.playback.shutdown();
                self.view.conversation_active = false;
                self.view.connected = false;
                self.set_state(ConversationState::Idle);
                return false;
            }
        }
        true
    }

    /// One poll of timers, audio and VAD
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();

        if let Some(pending) = self.pending_listen {
            if now >= pending.at_ms {
                self.pending_listen = None;
                self.begin_listening(pending.mode);
            }
        }

        if let Some(expiry) = self.display_expiry_ms {
            if now >= expiry {
                self.display_expiry_ms = None;
                self.view.display_items.clear();
                debug!("Display items expired");
            }
        }

        if !self.recorder.is_open() {
            return;
        }

        self.recorder.pump(now);

        let sample = self.meter.as_mut().and_then(|meter| meter.poll(now));
        if let Some(sample) = sample {
            if let Some(event) = self.vad.process(sample) {
                self.on_vad(event);
            }
        }

        if self.recorder.is_open() {
            if let Some(event) = self.vad.poll(now) {
                self.on_vad(event);
            }
        }
    }

    // === Commands ===

    fn on_toggle(&mut self) {
        if self.view.conversation_active {
            info!("Stopping conversation");
            self.teardown();
            self.view.conversation_active = false;
            self.set_status(status::READY);
            self.set_state(ConversationState::Idle);
            return;
        }

        let id = Uuid::new_v4();
        info!("Starting conversation {}", id);
        self.view.conversation_active = true;
        self.view.conversation_id = Some(id);
        self.view.cart = Cart::default();
        self.view.display_items.clear();
        self.view.order = None;
        self.display_expiry_ms = None;

        if self.transport.is_open() {
            self.start_session();
            return;
        }

        if !self.connecting {
            self.connecting = true;
            self.ever_opened = false;
            let tx = self.events_tx.clone();
            let sink: EventSink = Arc::new(move |event| {
                let _ = tx.send(ControlEvent::Transport(event));
            });
            if let Err(e) = self.transport.connect(sink) {
                error!("Failed to start connection: {}", e);
                self.connecting = false;
                self.view.conversation_active = false;
                self.set_status(status::CONNECTION_ERROR);
                self.set_state(ConversationState::Idle);
                return;
            }
        }
        self.set_status(status::CONNECTING);
        self.set_state(ConversationState::Connecting);
    }

    /// Ask the agent for a new order and schedule the user's turn
    fn start_session(&mut self) {
        if let Err(e) = self.transport.send_start_session() {
            warn!("Failed to send start_session: {}", e);
            self.set_status(&e.user_message());
            return;
        }
        self.set_status(status::CONNECTED);
        self.set_state(ConversationState::ArmedListening);
        self.schedule_listen(self.config.listen.auto_listen_delay_ms, ListenMode::Normal);
    }

    // === Transport ===

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionOpened => {
                info!("Agent connection open");
                self.connecting = false;
                self.ever_opened = true;
                self.view.connected = true;
                if self.view.conversation_active {
                    self.start_session();
                }
            }
            TransportEvent::AgentAudio(payload) => self.on_agent_audio(payload),
            TransportEvent::ShowItems(items) => {
                debug!("Showing {} items", items.len());
                self.view.display_items = items;
                self.display_expiry_ms =
                    Some(self.clock.now_ms() + self.config.listen.display_items_ttl_ms);
            }
            TransportEvent::CartUpdate(cart) => {
                debug!("Cart updated: {} items, total {:.2}", cart.item_count(), cart.total);
                self.view.cart = cart;
            }
            TransportEvent::OrderConfirmed(order) => {
                info!("Order {} confirmed", order.id);
                self.teardown();
                self.view.conversation_active = false;
                self.view.cart = Cart::default();
                self.view.order = Some(order);
                self.set_status(status::ORDER_COMPLETE);
                self.set_state(ConversationState::Ended);
            }
            TransportEvent::ServerError(message) => {
                warn!("Agent error: {}", message);
                self.set_status(&status::server_error(&message));
                let state = self.view.state;
                if self.view.conversation_active
                    && matches!(
                        state,
                        ConversationState::AwaitingReply | ConversationState::Connecting
                    )
                    && self.transport.is_open()
                {
                    self.set_state(ConversationState::ArmedListening);
                    self.schedule_listen(
                        self.config.listen.auto_listen_delay_ms,
                        ListenMode::Normal,
                    );
                }
            }
            TransportEvent::Disconnected { reason } => {
                warn!("Agent connection lost: {}", reason);
                let status_text = if self.ever_opened {
                    status::DISCONNECTED
                } else {
                    status::CONNECTION_ERROR
                };
                self.teardown();
                self.connecting = false;
                self.ever_opened = false;
                self.view.connected = false;
                self.view.conversation_active = false;
                self.set_status(status_text);
                self.set_state(ConversationState::Idle);
            }
        }
    }

    fn on_agent_audio(&mut self, payload: Vec<u8>) {
        match self.view.state {
            ConversationState::Idle | ConversationState::Connecting => {
                debug!("Ignoring agent audio in {}", self.view.state);
            }
            ConversationState::Ended => {
                // Farewell after the order; nothing to listen for
                self.playback.play(payload);
            }
            ConversationState::AgentSpeaking => {
                self.playback.play(payload);
            }
            ConversationState::ArmedListening
            | ConversationState::Recording
            | ConversationState::AwaitingReply => {
                if self.view.state == ConversationState::Recording {
                    // Confirmed speech in progress is sent, not lost
                    self.finish_capture();
                    if self.view.state == ConversationState::Idle {
                        debug!("Dropping agent audio after stopping");
                        return;
                    }
                }
                self.pending_listen = None;
                self.close_capture();
                self.playback.play(payload);
                self.set_status(status::AGENT_SPEAKING);
                self.set_state(ConversationState::AgentSpeaking);
                if self.view.conversation_active {
                    self.schedule_listen(
                        self.config.listen.barge_in_listen_delay_ms,
                        ListenMode::BargeIn,
                    );
                }
            }
        }
    }

    // === Playback ===

    fn on_playback(&mut self, event: PlaybackEvent) {
        let Some(event) = self.playback.accept(event) else {
            return;
        };

        let failed = match &event {
            PlaybackEvent::Finished(handle) => {
                debug!("{} finished", handle);
                false
            }
            PlaybackEvent::Failed(handle, reason) => {
                warn!("{} failed: {}", handle, reason);
                self.set_status(status::AUDIO_ERROR);
                true
            }
        };

        if self.view.state != ConversationState::AgentSpeaking {
            return;
        }

        if !self.view.conversation_active {
            self.teardown();
            self.set_state(ConversationState::Ended);
            return;
        }

        if !failed {
            self.set_status(status::YOUR_TURN);
        }
        self.set_state(ConversationState::ArmedListening);

        let now = self.clock.now_ms();
        match self.capture {
            CaptureSlot::Open {
                mode: ListenMode::BargeIn,
            } => {
                // Barge-in capture heard nothing; it becomes the user's turn
                self.recorder.rebase(now);
                self.vad.arm(ListenMode::Normal, now);
                self.capture = CaptureSlot::Open {
                    mode: ListenMode::Normal,
                };
            }
            CaptureSlot::Acquiring { capture_id, .. } => {
                self.capture = CaptureSlot::Acquiring {
                    capture_id,
                    mode: ListenMode::Normal,
                };
            }
            CaptureSlot::Open {
                mode: ListenMode::Normal,
            } => {}
            CaptureSlot::Closed => {
                self.schedule_listen(self.config.listen.auto_listen_delay_ms, ListenMode::Normal);
            }
        }
    }

    // === Capture ===

    fn schedule_listen(&mut self, delay_ms: u64, mode: ListenMode) {
        let at_ms = self.clock.now_ms() + delay_ms;
        debug!("Listening ({} mode) in {}ms", mode, delay_ms);
        self.pending_listen = Some(PendingListen { at_ms, mode });
    }

    fn begin_listening(&mut self, mode: ListenMode) {
        if !self.view.conversation_active {
            return;
        }
        if self.capture != CaptureSlot::Closed {
            debug!("Capture already in progress, not opening another");
            return;
        }

        let capture_id = self.next_capture_id;
        self.next_capture_id += 1;
        self.capture = CaptureSlot::Acquiring { capture_id, mode };

        let tx = self.events_tx.clone();
        let acquired = input::acquire(
            Arc::clone(&self.capture_device),
            capture_id,
            self.config.level.fft_size,
            self.config.recorder.release_timeout(),
            move |result| {
                let _ = tx.send(ControlEvent::CaptureOpened { capture_id, result });
            },
        );

        if let Err(e) = acquired {
            self.capture = CaptureSlot::Closed;
            self.on_device_error(e);
        }
    }

    fn on_capture_opened(&mut self, capture_id: u64, result: Result<CaptureStream>) {
        let mode = match self.capture {
            CaptureSlot::Acquiring {
                capture_id: expected,
                mode,
            } if expected == capture_id => mode,
            _ => {
                // Dropping the stream releases the device
                debug!("Releasing stale capture {}", capture_id);
                return;
            }
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                self.capture = CaptureSlot::Closed;
                self.on_device_error(e);
                return;
            }
        };

        let meter = match LevelMeter::open(&stream, &self.config.level) {
            Ok(meter) => meter,
            Err(e) => {
                self.capture = CaptureSlot::Closed;
                self.on_device_error(e);
                return;
            }
        };

        let now = self.clock.now_ms();
        if let Err(e) = self.recorder.begin(stream, now) {
            self.capture = CaptureSlot::Closed;
            self.on_device_error(e);
            return;
        }

        self.meter = Some(meter);
        self.vad.arm(mode, now);
        self.capture = CaptureSlot::Open { mode };
        info!("Listening in {} mode (capture {})", mode, capture_id);

        if mode == ListenMode::Normal {
            self.set_status(status::LISTENING);
        }
    }

    fn on_device_error(&mut self, error: VoiceError) {
        error!("Capture failed: {}", error);
        self.set_status(&error.user_message());
    }

    // === VAD ===

    fn on_vad(&mut self, event: VadEvent) {
        match event {
            VadEvent::SpeechStarted { level, .. } => {
                self.recorder.mark_speech_confirmed();
                // The ceiling counts from the retained pre-roll, not from open
                if let Some(session) = self.recorder.session() {
                    self.vad.restart_ceiling(session.started_at_ms());
                }
                match self.view.state {
                    ConversationState::ArmedListening => {
                        debug!("User speaking (level {:.1})", level);
                        self.set_state(ConversationState::Recording);
                    }
                    ConversationState::AgentSpeaking => {
                        info!("User interrupted agent (level {:.1})", level);
                        self.playback.cancel_current();
                        self.vad.set_mode(ListenMode::Normal);
                        self.capture = CaptureSlot::Open {
                            mode: ListenMode::Normal,
                        };
                        self.set_status(status::INTERRUPTED);
                        self.set_state(ConversationState::Recording);
                    }
                    _ => {}
                }
            }
            VadEvent::SpeechEnded { at_ms, reason } => {
                debug!("Speech ended at {}ms ({:?})", at_ms, reason);
                self.finish_capture();
            }
        }
    }

    fn finish_capture(&mut self) {
        let now = self.clock.now_ms();
        self.close_meter();
        let outcome = self.recorder.finish(now);

        match outcome {
            Ok(Ok(utterance)) => {
                info!("Sending utterance ({}ms)", utterance.duration_ms);
                match self.transport.send_utterance(utterance) {
                    Ok(()) => {
                        self.set_status(status::PROCESSING);
                        self.set_state(ConversationState::AwaitingReply);
                    }
                    Err(e) => self.on_capture_failure(e),
                }
            }
            Ok(Err(discarded)) => {
                debug!("Capture discarded: {}", discarded);
                if self.view.conversation_active && self.view.state != ConversationState::AgentSpeaking {
                    self.set_status(status::NOT_HEARD);
                    self.rearm_after_discard();
                }
            }
            Err(e) => self.on_capture_failure(e),
        }
    }

    /// Utterance could not be encoded or delivered
    fn on_capture_failure(&mut self, error: VoiceError) {
        self.set_status(&error.user_message());
        if error.is_recoverable() {
            warn!("Utterance lost: {}", error);
            self.rearm_after_discard();
            return;
        }

        // Resuming needs a toggle
        error!("Utterance lost, stopping conversation: {}", error);
        self.teardown();
        self.view.conversation_active = false;
        self.set_state(ConversationState::Idle);
    }

    fn rearm_after_discard(&mut self) {
        if !self.view.conversation_active {
            return;
        }
        self.set_state(ConversationState::ArmedListening);
        self.schedule_listen(self.config.listen.rearm_delay_ms, ListenMode::Normal);
    }

    // === Teardown ===

    fn close_meter(&mut self) {
        if let Some(mut meter) = self.meter.take() {
            meter.close();
        }
        self.vad.disarm();
        self.capture = CaptureSlot::Closed;
    }

    /// Release the microphone and forget any pending acquisition
    fn close_capture(&mut self) {
        self.close_meter();
        self.recorder.abort();
    }

    /// Stop capture, playback and timers
    fn teardown(&mut self) {
        self.pending_listen = None;
        self.close_capture();
        self.playback.cancel_current();
    }

    // === State ===

    fn set_state(&mut self, state: ConversationState) {
        if self.view.state != state {
            info!("State: {} -> {}", self.view.state, state);
            self.view.state = state;
        }
    }

    fn set_status(&mut self, text: &str) {
        if self.view.status_text != text {
            debug!("Status: {}", text);
            self.view.status_text = text.to_string();
        }
    }

    /// Publish the view if anything changed since the last publish
    fn publish(&mut self) {
        if self.view == self.published {
            return;
        }
        self.published = self.view.clone();
        self.shared.publish(self.view.clone());
        if self.snapshot_tx.try_send(self.view.clone()).is_err() {
            debug!("Snapshot observer lagging; latest state is in the shared snapshot");
        }
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        self.teardown();
    }
}
