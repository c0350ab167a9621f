pub mod buffer;
pub mod input;
pub mod level;
pub mod output;

pub use buffer::AudioRingBuffer;
pub use input::{acquire, AudioDeviceInfo, CaptureDevice, CaptureStream, OpenedDevice};
#[cfg(feature = "audio-io")]
pub use input::{list_input_devices, MicrophoneDevice};
pub use level::{LevelConfig, LevelMeter, LoudnessSample, SpectrumAnalyser};
pub use output::PlaybackBackend;
#[cfg(feature = "audio-io")]
pub use output::SpeakerBackend;
