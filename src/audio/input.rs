//! Microphone capture
//!
//! A [`CaptureDevice`] opens an input stream that delivers mono `f32` chunks
//! over a crossbeam channel. Real device streams are not `Send`, so each
//! acquisition runs on its own thread which opens the device, hands a
//! [`CaptureStream`] back through a callback and then parks holding the device
//! until the stream is released.
//!
//! Acquisition is asynchronous: the caller keeps running while the platform
//! opens the microphone (and possibly asks the user for permission).

use crate::audio::buffer::AudioRingBuffer;
use crate::{Result, VoiceError};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::any::Any;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, warn};

/// Chunks buffered between the device callback and the control loop
const SAMPLE_CHANNEL_CAPACITY: usize = 256;

/// An input stream opened by a [`CaptureDevice`]
pub struct OpenedDevice {
    /// Sample rate of the delivered chunks
    pub sample_rate: u32,
    /// Keeps the device running; dropped on the acquisition thread at release
    pub guard: Box<dyn Any>,
}

/// Source of microphone audio
pub trait CaptureDevice: Send + Sync + 'static {
    /// Open the device and start delivering mono chunks to `samples`
    ///
    /// Called on the acquisition thread, which owns the returned guard.
    fn open(&self, samples: Sender<Vec<f32>>) -> Result<OpenedDevice>;
}

struct DeviceRelease {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    owner: ThreadId,
}

/// Exclusive handle on an open capture device
///
/// Dropping the stream releases the device.
pub struct CaptureStream {
    id: u64,
    samples: Receiver<Vec<f32>>,
    sample_rate: u32,
    window: AudioRingBuffer,
    release: Option<DeviceRelease>,
    release_timeout: Duration,
}

impl CaptureStream {
    /// Capture-session id this stream was acquired for
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Analysis window shared with the level meter
    pub fn window(&self) -> AudioRingBuffer {
        self.window.clone()
    }

    /// Take every chunk delivered since the last call, in arrival order
    pub fn drain(&self) -> Vec<Vec<f32>> {
        self.samples.try_iter().collect()
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    /// Stop the device and wait (bounded) for it to close
    ///
    /// Idempotent.
    pub fn release(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };

        drop(release.stop_tx);
        self.window.clear();

        // The acquisition thread cannot wait on itself
        if thread::current().id() == release.owner {
            return;
        }

        match release.done_rx.recv_timeout(self.release_timeout) {
            Ok(()) => debug!("Capture {} released", self.id),
            Err(_) => warn!(
                "Capture {} did not confirm release within {:?}",
                self.id, self.release_timeout
            ),
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Start acquiring `device` for capture session `capture_id`
///
/// `on_ready` is invoked from the acquisition thread with the open stream or
/// the failure. Dropping a delivered stream releases the device.
///
/// # Errors
/// `DeviceUnavailable` if the acquisition thread cannot be spawned.
pub fn acquire<F>(
    device: std::sync::Arc<dyn CaptureDevice>,
    capture_id: u64,
    window_size: usize,
    release_timeout: Duration,
    on_ready: F,
) -> Result<()>
where
    F: FnOnce(Result<CaptureStream>) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("capture-{}", capture_id))
        .spawn(move || {
            let (samples_tx, samples_rx) = bounded(SAMPLE_CHANNEL_CAPACITY);

            let opened = match device.open(samples_tx) {
                Ok(opened) => opened,
                Err(e) => {
                    warn!("Capture {} failed to open: {}", capture_id, e);
                    on_ready(Err(e));
                    return;
                }
            };

            let (stop_tx, stop_rx) = bounded::<()>(1);
            let (done_tx, done_rx) = bounded::<()>(1);

            debug!(
                "Capture {} opened at {}Hz",
                capture_id, opened.sample_rate
            );

            on_ready(Ok(CaptureStream {
                id: capture_id,
                samples: samples_rx,
                sample_rate: opened.sample_rate,
                window: AudioRingBuffer::new(window_size),
                release: Some(DeviceRelease {
                    stop_tx,
                    done_rx,
                    owner: thread::current().id(),
                }),
                release_timeout,
            }));

            // Disconnects when the stream releases or is dropped
            let _ = stop_rx.recv();
            drop(opened.guard);
            let _ = done_tx.send(());
        })
        .map(|_| ())
        .map_err(|e| {
            VoiceError::DeviceUnavailable(format!("Failed to spawn capture thread: {}", e))
        })
}

/// Audio input device information
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    /// Device name
    pub name: String,
    /// Whether this is the default input device
    pub is_default: bool,
}

#[cfg(feature = "audio-io")]
pub use self::microphone::{list_input_devices, MicrophoneDevice};

#[cfg(feature = "audio-io")]
mod microphone {
    use super::{AudioDeviceInfo, CaptureDevice, OpenedDevice};
    use crate::{Result, VoiceError};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use crossbeam_channel::Sender;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing::{debug, error, info, warn};

    /// cpal microphone, opened fresh for every capture session
    #[derive(Debug, Clone, Default)]
    pub struct MicrophoneDevice {
        device_name: Option<String>,
    }

    impl MicrophoneDevice {
        /// Use the host's default input device
        pub fn new() -> Self {
            Self::default()
        }

        /// Use the input device with the given name
        pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
            self.device_name = Some(name.into());
            self
        }
    }

    impl CaptureDevice for MicrophoneDevice {
        fn open(&self, samples: Sender<Vec<f32>>) -> Result<OpenedDevice> {
            let host = cpal::default_host();

            let device = match &self.device_name {
                Some(name) => host
                    .input_devices()
                    .map_err(|e| {
                        VoiceError::DeviceUnavailable(format!("Failed to list devices: {}", e))
                    })?
                    .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                    .ok_or_else(|| {
                        VoiceError::DeviceUnavailable(format!("Input device {:?} not found", name))
                    })?,
                None => host.default_input_device().ok_or_else(|| {
                    VoiceError::DeviceUnavailable("No input device available".into())
                })?,
            };

            let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            info!("Using input device: {}", device_name);

            let config: StreamConfig = device
                .default_input_config()
                .map_err(|e| {
                    VoiceError::DeviceUnavailable(format!("Failed to get input config: {}", e))
                })?
                .into();

            let channels = config.channels as usize;
            let sample_rate = config.sample_rate.0;

            // Sample counter for debug logging
            let sample_count = Arc::new(AtomicUsize::new(0));

            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        // Convert to mono if necessary
                        let chunk: Vec<f32> = if channels == 1 {
                            data.to_vec()
                        } else {
                            data.chunks(channels)
                                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                                .collect()
                        };

                        let count = sample_count.fetch_add(chunk.len(), Ordering::Relaxed);
                        if count % (sample_rate as usize) < chunk.len() {
                            debug!(
                                "Audio captured: {:.1}s",
                                (count + chunk.len()) as f32 / sample_rate as f32
                            );
                        }

                        if let Err(e) = samples.try_send(chunk) {
                            warn!("Failed to send audio data: {}", e);
                        }
                    },
                    |err| {
                        error!("Audio input stream error: {}", err);
                    },
                    None,
                )
                .map_err(|e| {
                    VoiceError::DeviceUnavailable(format!("Failed to build input stream: {}", e))
                })?;

            stream.play().map_err(|e| {
                VoiceError::DeviceUnavailable(format!("Failed to start input stream: {}", e))
            })?;

            info!("Microphone open: {}Hz, {} channel(s)", sample_rate, channels);

            Ok(OpenedDevice {
                sample_rate,
                guard: Box::new(stream),
            })
        }
    }

    /// List available audio input devices
    pub fn list_input_devices() -> Vec<AudioDeviceInfo> {
        let host = cpal::default_host();
        let default_device_name = host.default_input_device().and_then(|d| d.name().ok());

        host.input_devices()
            .map(|devices| {
                devices
                    .filter_map(|device| {
                        let name = device.name().ok()?;
                        let is_default = default_device_name.as_deref() == Some(name.as_str());
                        Some(AudioDeviceInfo { name, is_default })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

}
