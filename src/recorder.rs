//! Utterance recording
//!
//! The recorder owns the capture device for the lifetime of a
//! [`CaptureSession`]. While the session is open, every chunk the device
//! delivers is buffered and copied into the level meter's analysis window.
//! On finish the device is released first, then the session is validated
//! and, if it qualifies, encoded as a 16-bit mono WAV [`Utterance`].

use crate::audio::input::CaptureStream;
use crate::{Discarded, Result, VoiceError};
use hound::{SampleFormat, WavSpec, WavWriter};
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Utterance validation settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Shortest session that can become an utterance
    pub min_duration_ms: u64,

    /// Smallest encoded utterance worth uploading
    pub min_size_bytes: usize,

    /// Upper bound on waiting for the device to close
    pub release_timeout_ms: u64,

    /// Audio kept from before speech is confirmed
    pub pre_roll_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            min_duration_ms: 600,
            min_size_bytes: 5000,
            release_timeout_ms: 500,
            pre_roll_ms: 1000,
        }
    }
}

impl RecorderConfig {
    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

/// A validated span of user speech, ready for upload
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// WAV container, 16-bit PCM mono
    pub audio_bytes: Vec<u8>,
    /// Elapsed time from the first retained sample to finish
    pub duration_ms: u64,
}

/// Outcome of finishing a capture session
pub type Outcome = std::result::Result<Utterance, Discarded>;

/// Audio buffered for one open capture
pub struct CaptureSession {
    raw_chunks: Vec<Vec<f32>>,
    started_at_ms: u64,
    stream: CaptureStream,
    speech_confirmed: bool,
}

impl CaptureSession {
    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn capture_id(&self) -> u64 {
        self.stream.id()
    }

    pub fn stream(&self) -> &CaptureStream {
        &self.stream
    }

    pub fn sample_count(&self) -> usize {
        self.raw_chunks.iter().map(Vec::len).sum()
    }

    pub fn speech_confirmed(&self) -> bool {
        self.speech_confirmed
    }

    /// Drop the oldest chunks beyond `pre_roll_ms` of audio
    ///
    /// The start time moves forward to the beginning of the retained audio.
    fn trim_to_pre_roll(&mut self, pre_roll_ms: u64, now_ms: u64) {
        let limit = (u64::from(self.stream.sample_rate()) * pre_roll_ms / 1000) as usize;
        let mut total = self.sample_count();
        let mut dropped = 0;
        for chunk in &self.raw_chunks {
            if total - chunk.len() < limit {
                break;
            }
            total -= chunk.len();
            dropped += 1;
        }

        if dropped > 0 {
            self.raw_chunks.drain(..dropped);
            self.started_at_ms = self.started_at_ms.max(now_ms.saturating_sub(pre_roll_ms));
        }
    }
}

/// Owner of the capture device and buffered audio
pub struct UtteranceRecorder {
    config: RecorderConfig,
    session: Option<CaptureSession>,
}

impl UtteranceRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Open a capture session on an acquired stream
    ///
    /// # Errors
    /// `DeviceUnavailable` if the stream was already released or another
    /// session is open. The rejected stream is released.
    pub fn begin(&mut self, stream: CaptureStream, now_ms: u64) -> Result<()> {
        if self.session.is_some() {
            return Err(VoiceError::DeviceUnavailable(format!(
                "capture {} rejected: a session is already open",
                stream.id()
            )));
        }
        if stream.is_released() {
            return Err(VoiceError::DeviceUnavailable(format!(
                "capture {} already released",
                stream.id()
            )));
        }

        // Drop anything the device produced before the session started
        stream.drain();
        stream.window().clear();

        debug!("Capture session {} open", stream.id());
        self.session = Some(CaptureSession {
            raw_chunks: Vec::new(),
            started_at_ms: now_ms,
            stream,
            speech_confirmed: false,
        });
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    /// Move every delivered chunk into the session, returning the sample count
    ///
    /// Until speech is confirmed only the last `pre_roll_ms` of audio is kept.
    pub fn pump(&mut self, now_ms: u64) -> usize {
        let Some(session) = self.session.as_mut() else {
            return 0;
        };

        let window = session.stream.window();
        let mut pumped = 0;
        for chunk in session.stream.drain() {
            window.write(&chunk);
            pumped += chunk.len();
            session.raw_chunks.push(chunk);
        }

        if !session.speech_confirmed {
            session.trim_to_pre_roll(self.config.pre_roll_ms, now_ms);
        }
        pumped
    }

    /// Append a chunk to the open session
    pub fn feed(&mut self, chunk: Vec<f32>) {
        if let Some(session) = self.session.as_mut() {
            session.stream.window().write(&chunk);
            session.raw_chunks.push(chunk);
        }
    }

    /// Record that the VAD confirmed speech in this session
    pub fn mark_speech_confirmed(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.speech_confirmed = true;
        }
    }

    /// Restart the open session in place at `now_ms`
    pub fn rebase(&mut self, now_ms: u64) {
        if let Some(session) = self.session.as_mut() {
            session.stream.drain();
            session.raw_chunks.clear();
            session.started_at_ms = now_ms;
            session.speech_confirmed = false;
            debug!("Capture session {} rebased", session.stream.id());
        }
    }

    /// Release the device and drop buffered audio
    pub fn abort(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stream.release();
            debug!("Capture session {} aborted", session.stream.id());
        }
    }

    /// Close the session and validate it
    ///
    /// The device is released before this returns, whatever the outcome.
    /// Validation order: speech confirmed, minimum duration, minimum size.
    ///
    /// # Errors
    /// `EncodingError` if the WAV container cannot be written.
    pub fn finish(&mut self, now_ms: u64) -> Result<Outcome> {
        self.pump(now_ms);
        let Some(mut session) = self.session.take() else {
            warn!("finish called without an open capture session");
            return Ok(Err(Discarded::NoSpeech));
        };
        session.stream.release();

        let duration_ms = now_ms.saturating_sub(session.started_at_ms);

        if !session.speech_confirmed {
            debug!("Discarding capture {}: no speech", session.stream.id());
            return Ok(Err(Discarded::NoSpeech));
        }

        if duration_ms < self.config.min_duration_ms {
            debug!(
                "Discarding capture {}: {}ms too short",
                session.stream.id(),
                duration_ms
            );
            return Ok(Err(Discarded::TooShort {
                duration_ms,
                min_ms: self.config.min_duration_ms,
            }));
        }

        let audio_bytes = encode_wav(&session.raw_chunks, session.stream.sample_rate())?;

        if audio_bytes.len() < self.config.min_size_bytes {
            debug!(
                "Discarding capture {}: {} bytes too small",
                session.stream.id(),
                audio_bytes.len()
            );
            return Ok(Err(Discarded::TooSmall {
                size_bytes: audio_bytes.len(),
                min_bytes: self.config.min_size_bytes,
            }));
        }

        info!(
            "Utterance ready: {}ms, {} bytes",
            duration_ms,
            audio_bytes.len()
        );
        Ok(Ok(Utterance {
            audio_bytes,
            duration_ms,
        }))
    }
}

impl Drop for UtteranceRecorder {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Encode mono chunks as an in-memory 16-bit PCM WAV
pub fn encode_wav(chunks: &[Vec<f32>], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| VoiceError::EncodingError(format!("Failed to create WAV writer: {}", e)))?;

        // Convert f32 samples to i16
        for &sample in chunks.iter().flatten() {
            let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| VoiceError::EncodingError(format!("Failed to write sample: {}", e)))?;
        }

        writer
            .finalize()
            .map_err(|e| VoiceError::EncodingError(format!("Failed to finalize WAV: {}", e)))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::input::{acquire, CaptureDevice, OpenedDevice};
    use crossbeam_channel::{bounded, Sender};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Device that hands its sample sender to the test
    struct TapDevice {
        tap: Arc<Mutex<Option<Sender<Vec<f32>>>>>,
        closed: Arc<AtomicBool>,
    }

    struct CloseFlag(Arc<AtomicBool>);

    impl Drop for CloseFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl CaptureDevice for TapDevice {
        fn open(&self, samples: Sender<Vec<f32>>) -> Result<OpenedDevice> {
            *self.tap.lock() = Some(samples);
            Ok(OpenedDevice {
                sample_rate: 16_000,
                guard: Box::new(CloseFlag(Arc::clone(&self.closed))),
            })
        }
    }

    struct Fixture {
        stream: CaptureStream,
        tap: Sender<Vec<f32>>,
        closed: Arc<AtomicBool>,
    }

    fn open_stream() -> Fixture {
        let tap = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));
        let device = TapDevice {
            tap: Arc::clone(&tap),
            closed: Arc::clone(&closed),
        };

        let (tx, rx) = bounded(1);
        acquire(
            Arc::new(device),
            1,
            512,
            Duration::from_millis(500),
            move |result| {
                let _ = tx.send(result);
            },
        )
        .unwrap();
        let stream = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        let tap = tap.lock().take().unwrap();

        Fixture {
            stream,
            tap,
            closed,
        }
    }

    #[test]
    fn test_valid_utterance() {
        let fixture = open_stream();
        let mut recorder = UtteranceRecorder::new(RecorderConfig::default());
        recorder.begin(fixture.stream, 1000).unwrap();

        // 800 ms of 16 kHz audio
        for _ in 0..8 {
            fixture.tap.send(vec![0.1; 1600]).unwrap();
        }
        assert_eq!(recorder.pump(1000), 12_800);
        recorder.mark_speech_confirmed();

        let utterance = recorder.finish(1800).unwrap().unwrap();
        assert_eq!(utterance.duration_ms, 800);
        assert_eq!(&utterance.audio_bytes[0..4], b"RIFF");
        assert_eq!(utterance.audio_bytes.len(), 44 + 12_800 * 2);
        assert!(fixture.closed.load(Ordering::SeqCst));
        assert!(!recorder.is_open());
    }

    #[test]
    fn test_no_speech_checked_first() {
        let fixture = open_stream();
        let mut recorder = UtteranceRecorder::new(RecorderConfig::default());
        recorder.begin(fixture.stream, 0).unwrap();

        // Too short and too small as well, but NoSpeech wins
        let outcome = recorder.finish(100).unwrap();
        assert_eq!(outcome, Err(Discarded::NoSpeech));
        assert!(fixture.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_too_short() {
        let fixture = open_stream();
        let mut recorder = UtteranceRecorder::new(RecorderConfig::default());
        recorder.begin(fixture.stream, 0).unwrap();
        fixture.tap.send(vec![0.1; 16_000]).unwrap();
        recorder.mark_speech_confirmed();

        let outcome = recorder.finish(500).unwrap();
        assert_eq!(
            outcome,
            Err(Discarded::TooShort {
                duration_ms: 500,
                min_ms: 600
            })
        );
    }

    #[test]
    fn test_too_small() {
        let fixture = open_stream();
        let mut recorder = UtteranceRecorder::new(RecorderConfig::default());
        recorder.begin(fixture.stream, 0).unwrap();
        fixture.tap.send(vec![0.1; 1000]).unwrap();
        recorder.mark_speech_confirmed();

        let outcome = recorder.finish(2000).unwrap();
        assert_eq!(
            outcome,
            Err(Discarded::TooSmall {
                size_bytes: 2044,
                min_bytes: 5000
            })
        );
    }

    #[test]
    fn test_pump_fills_level_window() {
        let fixture = open_stream();
        let window = fixture.stream.window();
        let mut recorder = UtteranceRecorder::new(RecorderConfig::default());
        recorder.begin(fixture.stream, 0).unwrap();

        fixture.tap.send(vec![0.5; 100]).unwrap();
        fixture.tap.send(vec![-0.5; 1000]).unwrap();
        recorder.pump(0);

        let latest = window.latest();
        assert_eq!(latest.len(), 512);
        assert!(latest.iter().all(|&s| s == -0.5));
    }

    #[test]
    fn test_rebase_drops_buffered_audio() {
        let fixture = open_stream();
        let mut recorder = UtteranceRecorder::new(RecorderConfig::default());
        recorder.begin(fixture.stream, 0).unwrap();
        fixture.tap.send(vec![0.1; 4000]).unwrap();
        recorder.pump(250);
        recorder.mark_speech_confirmed();

        recorder.rebase(5000);
        let session = recorder.session().unwrap();
        assert_eq!(session.started_at_ms(), 5000);
        assert_eq!(session.sample_count(), 0);
        assert!(!session.speech_confirmed());
        assert!(!fixture.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unconfirmed_audio_keeps_only_pre_roll() {
        let fixture = open_stream();
        let mut recorder = UtteranceRecorder::new(RecorderConfig::default());
        recorder.begin(fixture.stream, 0).unwrap();

        // A minute of background noise, 100 ms per tick
        for tick in 1..=600u64 {
            fixture.tap.send(vec![0.01; 1600]).unwrap();
            recorder.pump(tick * 100);
        }

        let session = recorder.session().unwrap();
        assert_eq!(session.sample_count(), 16_000);
        assert_eq!(session.started_at_ms(), 59_000);

        // Once speech is confirmed nothing more is dropped
        recorder.mark_speech_confirmed();
        for tick in 601..=620u64 {
            fixture.tap.send(vec![0.3; 1600]).unwrap();
            recorder.pump(tick * 100);
        }
        assert_eq!(recorder.session().unwrap().sample_count(), 48_000);

        let utterance = recorder.finish(62_000).unwrap().unwrap();
        assert_eq!(utterance.duration_ms, 3000);
        assert_eq!(utterance.audio_bytes.len(), 44 + 48_000 * 2);
    }

    #[test]
    fn test_abort_releases_device() {
        let fixture = open_stream();
        let mut recorder = UtteranceRecorder::new(RecorderConfig::default());
        recorder.begin(fixture.stream, 0).unwrap();

        recorder.abort();
        assert!(fixture.closed.load(Ordering::SeqCst));
        assert!(!recorder.is_open());

        // Idempotent
        recorder.abort();
    }

    #[test]
    fn test_second_session_rejected() {
        let first = open_stream();
        let second = open_stream();
        let mut recorder = UtteranceRecorder::new(RecorderConfig::default());
        recorder.begin(first.stream, 0).unwrap();

        let result = recorder.begin(second.stream, 10);
        assert!(matches!(result, Err(VoiceError::DeviceUnavailable(_))));
        assert!(second.closed.load(Ordering::SeqCst));
        assert!(!first.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_encode_wav_roundtrip_header() {
        let bytes = encode_wav(&[vec![0.0, 1.0], vec![-1.0]], 22_050).unwrap();
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, 22_050);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 3);
    }
}
