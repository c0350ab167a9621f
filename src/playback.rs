//! Agent audio playback
//!
//! The engine runs its output backend on a dedicated worker thread and talks
//! to it over a command channel. Each `play` gets a fresh [`PlaybackHandle`];
//! the worker reports natural completion or failure per handle through an
//! event callback.
//!
//! Cancellation is immediate on the worker side. A completion event that was
//! already in flight when the handle was cancelled is filtered by
//! [`PlaybackEngine::accept`], so a cancelled handle never surfaces as
//! finished.

use crate::audio::output::PlaybackBackend;
use crate::{Result, VoiceError};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Identifies one `play` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackHandle(u64);

impl PlaybackHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlaybackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "playback#{}", self.0)
    }
}

/// Events emitted by the playback worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Payload played to the end
    Finished(PlaybackHandle),

    /// Payload could not be decoded or played
    Failed(PlaybackHandle, String),
}

impl PlaybackEvent {
    pub fn handle(&self) -> PlaybackHandle {
        match self {
            PlaybackEvent::Finished(h) | PlaybackEvent::Failed(h, _) => *h,
        }
    }
}

/// Commands sent to the playback worker
#[derive(Debug)]
enum PlaybackCommand {
    Play {
        handle: PlaybackHandle,
        payload: Vec<u8>,
    },
    Cancel(PlaybackHandle),
    Shutdown,
}

/// Creates the output backend on the worker thread
pub type BackendFactory = Box<dyn FnOnce() -> Result<Box<dyn PlaybackBackend>> + Send>;

/// Single-voice playback engine
pub struct PlaybackEngine {
    command_tx: Sender<PlaybackCommand>,
    next_handle: u64,
    current: Option<PlaybackHandle>,
    worker: Option<JoinHandle<()>>,
}

impl PlaybackEngine {
    /// Start the worker thread
    ///
    /// `on_event` is called from the worker thread.
    ///
    /// # Errors
    /// `PlaybackFailed` if the worker thread cannot be spawned.
    pub fn spawn<S>(factory: BackendFactory, on_event: S, poll_interval: Duration) -> Result<Self>
    where
        S: Fn(PlaybackEvent) + Send + 'static,
    {
        let (command_tx, command_rx) = unbounded();

        let worker = PlaybackWorker {
            command_rx,
            poll_interval,
        };

        let handle = thread::Builder::new()
            .name("playback".into())
            .spawn(move || worker.run(factory, on_event))
            .map_err(|e| {
                VoiceError::PlaybackFailed(format!("Failed to spawn playback worker: {}", e))
            })?;

        Ok(Self {
            command_tx,
            next_handle: 1,
            current: None,
            worker: Some(handle),
        })
    }

    /// Play `payload`, replacing whatever is playing
    pub fn play(&mut self, payload: Vec<u8>) -> PlaybackHandle {
        let handle = PlaybackHandle(self.next_handle);
        self.next_handle += 1;

        if let Some(previous) = self.current.replace(handle) {
            debug!("{} replaced by {}", previous, handle);
        }

        if let Err(e) = self.command_tx.send(PlaybackCommand::Play { handle, payload }) {
            error!("Playback worker gone: {}", e);
        }
        handle
    }

    /// Stop `handle` if it is the one playing
    pub fn cancel(&mut self, handle: PlaybackHandle) {
        if self.current != Some(handle) {
            return;
        }
        self.current = None;

        if let Err(e) = self.command_tx.send(PlaybackCommand::Cancel(handle)) {
            error!("Playback worker gone: {}", e);
        }
        debug!("{} cancelled", handle);
    }

    /// Stop whatever is playing
    pub fn cancel_current(&mut self) {
        if let Some(handle) = self.current {
            self.cancel(handle);
        }
    }

    pub fn current(&self) -> Option<PlaybackHandle> {
        self.current
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    /// Filter a worker event against the current handle
    ///
    /// Returns the event only if it completes the handle that is playing;
    /// events for cancelled or replaced handles are dropped.
    pub fn accept(&mut self, event: PlaybackEvent) -> Option<PlaybackEvent> {
        if self.current != Some(event.handle()) {
            debug!("Ignoring stale event for {}", event.handle());
            return None;
        }
        self.current = None;
        Some(event)
    }

    /// Stop playback and join the worker
    pub fn shutdown(&mut self) {
        self.current = None;
        let _ = self.command_tx.send(PlaybackCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Playback worker panicked");
            }
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker that owns the output backend
struct PlaybackWorker {
    command_rx: Receiver<PlaybackCommand>,
    poll_interval: Duration,
}

impl PlaybackWorker {
    fn run<S>(self, factory: BackendFactory, on_event: S)
    where
        S: Fn(PlaybackEvent),
    {
        info!("Playback worker starting");

        let mut backend = match factory() {
            Ok(backend) => Ok(backend),
            Err(e) => {
                error!("Failed to initialize audio output: {}", e);
                Err(e.to_string())
            }
        };
        let mut current: Option<PlaybackHandle> = None;

        loop {
            select! {
                recv(self.command_rx) -> msg => match msg {
                    Ok(PlaybackCommand::Play { handle, payload }) => {
                        let backend = match backend.as_mut() {
                            Ok(backend) => backend,
                            Err(reason) => {
                                on_event(PlaybackEvent::Failed(handle, reason.clone()));
                                continue;
                            }
                        };

                        if current.take().is_some() {
                            backend.stop();
                        }

                        match backend.start(&payload) {
                            Ok(()) => {
                                debug!("{} started ({} bytes)", handle, payload.len());
                                current = Some(handle);
                            }
                            Err(e) => {
                                warn!("{} failed: {}", handle, e);
                                on_event(PlaybackEvent::Failed(handle, e.to_string()));
                            }
                        }
                    }
                    Ok(PlaybackCommand::Cancel(handle)) => {
                        if current == Some(handle) {
                            current = None;
                            if let Ok(backend) = backend.as_mut() {
                                backend.stop();
                            }
                        }
                    }
                    Ok(PlaybackCommand::Shutdown) | Err(_) => {
                        if let Ok(backend) = backend.as_mut() {
                            backend.stop();
                        }
                        break;
                    }
                },
                default(self.poll_interval) => {}
            }

            if let (Some(handle), Ok(backend)) = (current, backend.as_ref()) {
                if backend.is_finished() {
                    current = None;
                    debug!("{} finished", handle);
                    on_event(PlaybackEvent::Finished(handle));
                }
            }
        }

        info!("Playback worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Backend whose completion is controlled by the test
    #[derive(Clone, Default)]
    struct ScriptedBackend {
        finished: Arc<AtomicBool>,
        started: Arc<Mutex<Vec<Vec<u8>>>>,
        stops: Arc<AtomicUsize>,
    }

    impl PlaybackBackend for ScriptedBackend {
        fn start(&mut self, payload: &[u8]) -> Result<()> {
            if payload == b"corrupt" {
                return Err(VoiceError::PlaybackFailed("bad header".into()));
            }
            self.finished.store(false, Ordering::SeqCst);
            self.started.lock().push(payload.to_vec());
            Ok(())
        }

        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn spawn_engine(backend: ScriptedBackend) -> (PlaybackEngine, Receiver<PlaybackEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let engine = PlaybackEngine::spawn(
            Box::new(move || -> Result<Box<dyn PlaybackBackend>> { Ok(Box::new(backend)) }),
            move |event| {
                let _ = tx.send(event);
            },
            Duration::from_millis(5),
        )
        .unwrap();
        (engine, rx)
    }

    fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_natural_completion() {
        let backend = ScriptedBackend::default();
        let (mut engine, events) = spawn_engine(backend.clone());

        let handle = engine.play(b"reply".to_vec());
        wait_until(|| backend.started.lock().len() == 1);
        backend.finished.store(true, Ordering::SeqCst);

        let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event, PlaybackEvent::Finished(handle));
        assert_eq!(engine.accept(event.clone()), Some(event));
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_cancelled_handle_never_finishes() {
        let backend = ScriptedBackend::default();
        let (mut engine, events) = spawn_engine(backend.clone());

        let handle = engine.play(b"reply".to_vec());
        wait_until(|| backend.started.lock().len() == 1);
        engine.cancel(handle);
        wait_until(|| backend.stops.load(Ordering::SeqCst) >= 1);

        backend.finished.store(true, Ordering::SeqCst);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_accept_drops_in_flight_event_after_cancel() {
        let backend = ScriptedBackend::default();
        let (mut engine, _events) = spawn_engine(backend);

        let handle = engine.play(b"reply".to_vec());
        engine.cancel(handle);
        assert_eq!(engine.accept(PlaybackEvent::Finished(handle)), None);
    }

    #[test]
    fn test_new_play_replaces_current() {
        let backend = ScriptedBackend::default();
        let (mut engine, events) = spawn_engine(backend.clone());

        let first = engine.play(b"one".to_vec());
        let second = engine.play(b"two".to_vec());
        assert_ne!(first, second);
        assert_eq!(engine.current(), Some(second));

        wait_until(|| backend.started.lock().len() == 2);
        backend.finished.store(true, Ordering::SeqCst);

        let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event, PlaybackEvent::Finished(second));
        assert!(events.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(engine.accept(PlaybackEvent::Finished(first)), None);
    }

    #[test]
    fn test_decode_failure_reported() {
        let backend = ScriptedBackend::default();
        let (mut engine, events) = spawn_engine(backend);

        let handle = engine.play(b"corrupt".to_vec());
        let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(event, PlaybackEvent::Failed(h, _) if h == handle));
        assert!(engine.accept(event).is_some());
    }

    #[test]
    fn test_missing_output_device_fails_each_play() {
        let (tx, events) = crossbeam_channel::unbounded();
        let mut engine = PlaybackEngine::spawn(
            Box::new(|| -> Result<Box<dyn PlaybackBackend>> {
                Err(VoiceError::PlaybackFailed("no output device".into()))
            }),
            move |event| {
                let _ = tx.send(event);
            },
            Duration::from_millis(5),
        )
        .unwrap();

        let handle = engine.play(b"reply".to_vec());
        let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(event, PlaybackEvent::Failed(h, _) if h == handle));
    }

    #[test]
    fn test_shutdown_joins_worker() {
        let backend = ScriptedBackend::default();
        let (mut engine, _events) = spawn_engine(backend);
        engine.shutdown();
        engine.shutdown();
    }
}
