//! Speaker output
//!
//! A [`PlaybackBackend`] plays one encoded payload at a time. Backends are
//! created on, and never leave, the playback worker thread, so they need not
//! be `Send`.

use crate::Result;

/// Sink for agent audio
pub trait PlaybackBackend {
    /// Decode `payload` and start playing it, replacing anything in progress
    fn start(&mut self, payload: &[u8]) -> Result<()>;

    /// True once the last started payload has played to the end, or if
    /// nothing was started
    fn is_finished(&self) -> bool;

    /// Stop output immediately
    fn stop(&mut self);
}

#[cfg(feature = "audio-io")]
pub use self::speaker::SpeakerBackend;

#[cfg(feature = "audio-io")]
mod speaker {
    use super::PlaybackBackend;
    use crate::{Result, VoiceError};
    use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
    use std::io::Cursor;
    use tracing::{debug, info};

    /// rodio output on the default device
    pub struct SpeakerBackend {
        _stream: OutputStream,
        handle: OutputStreamHandle,
        sink: Option<Sink>,
    }

    impl SpeakerBackend {
        /// Open the default output device
        ///
        /// # Errors
        /// `PlaybackFailed` if no output device is available.
        pub fn new() -> Result<Self> {
            let (stream, handle) = OutputStream::try_default().map_err(|e| {
                VoiceError::PlaybackFailed(format!("Failed to open audio output: {}", e))
            })?;
            info!("Audio output ready");

            Ok(Self {
                _stream: stream,
                handle,
                sink: None,
            })
        }
    }

    impl PlaybackBackend for SpeakerBackend {
        fn start(&mut self, payload: &[u8]) -> Result<()> {
            self.stop();

            let source = Decoder::new(Cursor::new(payload.to_vec())).map_err(|e| {
                VoiceError::PlaybackFailed(format!("Failed to decode audio: {}", e))
            })?;

            let sink = Sink::try_new(&self.handle).map_err(|e| {
                VoiceError::PlaybackFailed(format!("Failed to create sink: {}", e))
            })?;
            sink.append(source);

            debug!("Playing {} bytes of agent audio", payload.len());
            self.sink = Some(sink);
            Ok(())
        }

        fn is_finished(&self) -> bool {
            self.sink.as_ref().map_or(true, |sink| sink.empty())
        }

        fn stop(&mut self) {
            if let Some(sink) = self.sink.take() {
                sink.stop();
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_garbage_payload_fails_to_decode() {
            // No output device in CI is an expected outcome
            if let Ok(mut backend) = SpeakerBackend::new() {
                let result = backend.start(b"definitely not audio");
                assert!(matches!(result, Err(VoiceError::PlaybackFailed(_))));
                assert!(backend.is_finished());
            }
        }

        #[test]
        fn test_short_wav_plays_to_completion() {
            if let Ok(mut backend) = SpeakerBackend::new() {
                let wav = crate::recorder::encode_wav(&[vec![0.0; 800]], 16_000).unwrap();
                if backend.start(&wav).is_ok() {
                    backend.stop();
                    assert!(backend.is_finished());
                }
            }
        }
    }
}
