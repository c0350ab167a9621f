//! Voice activity detection over loudness samples
//!
//! The detector is a pure state transducer. It is armed once per capture
//! session, fed one [`LoudnessSample`] per control-loop tick, and asked on the
//! same tick whether any of its deadlines have passed. It never sleeps and owns
//! no timers, so the whole turn-taking engine can be driven by a manual clock.
//!
//! - `SpeechStarted` fires once `confirm_frames` consecutive samples exceed the
//!   active threshold, at most once per session.
//! - After confirmation, the first sample at or below the threshold arms a
//!   silence deadline at `last_above + silence_duration_ms`; any later sample
//!   above the threshold cancels it.
//! - Once speech is confirmed, `max_recording_ms` after capture open forces
//!   `SpeechEnded` regardless of level.

use crate::audio::level::LoudnessSample;
use crate::{Result, VoiceError};
use serde::Deserialize;
use std::fmt;
use tracing::debug;

/// Polls between level debug lines (~3 s at 60 Hz)
const LEVEL_LOG_INTERVAL: u64 = 180;

/// Detector configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Loudness a sample must exceed to count as speech
    pub threshold: f32,

    /// Threshold multiplier while the agent is speaking
    pub barge_in_multiplier: f32,

    /// Consecutive loud samples needed to confirm speech
    pub confirm_frames: u32,

    /// Quiet time after the last loud sample that ends the utterance
    pub silence_duration_ms: u64,

    /// Hard ceiling on a confirmed capture session, measured from open
    pub max_recording_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 27.0,
            barge_in_multiplier: 2.0,
            confirm_frames: 5,
            silence_duration_ms: 1500,
            max_recording_ms: 15_000,
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold < 255.0) {
            return Err(VoiceError::ConfigError(format!(
                "VAD threshold must be within (0, 255), got {}",
                self.threshold
            )));
        }
        if self.barge_in_multiplier < 1.0 {
            return Err(VoiceError::ConfigError(format!(
                "barge_in_multiplier must be at least 1.0, got {}",
                self.barge_in_multiplier
            )));
        }
        if self.confirm_frames == 0 {
            return Err(VoiceError::ConfigError(
                "confirm_frames must be greater than zero".to_string(),
            ));
        }
        if self.silence_duration_ms == 0 || self.max_recording_ms == 0 {
            return Err(VoiceError::ConfigError(
                "VAD durations must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which threshold the detector applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// Baseline threshold, user's turn
    Normal,
    /// Raised threshold while agent audio is playing
    BargeIn,
}

impl fmt::Display for ListenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenMode::Normal => write!(f, "normal"),
            ListenMode::BargeIn => write!(f, "barge-in"),
        }
    }
}

/// Why an utterance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Silence,
    MaxDuration,
}

/// Detector output
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadEvent {
    SpeechStarted { at_ms: u64, level: f32 },
    SpeechEnded { at_ms: u64, reason: EndReason },
}

/// Observable detector state, reset on every arm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadState {
    pub consecutive_above_threshold_frames: u32,
    pub has_confirmed_speech: bool,
    pub silence_timer_armed: bool,
}

/// Voice activity detector
pub struct VoiceActivityDetector {
    config: VadConfig,
    mode: ListenMode,
    armed: bool,
    ended: bool,
    started_at_ms: u64,
    state: VadState,
    last_above_ms: u64,
    silence_deadline_ms: Option<u64>,
    samples_seen: u64,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            mode: ListenMode::Normal,
            armed: false,
            ended: false,
            started_at_ms: 0,
            state: VadState::default(),
            last_above_ms: 0,
            silence_deadline_ms: None,
            samples_seen: 0,
        }
    }

    /// Reset all state for a capture session opened at `started_at_ms`
    pub fn arm(&mut self, mode: ListenMode, started_at_ms: u64) {
        self.mode = mode;
        self.armed = true;
        self.ended = false;
        self.started_at_ms = started_at_ms;
        self.state = VadState::default();
        self.last_above_ms = started_at_ms;
        self.silence_deadline_ms = None;
        self.samples_seen = 0;
        debug!(
            "VAD armed in {} mode (threshold {:.1})",
            mode,
            self.threshold()
        );
    }

    /// Clear all state; nothing fires until the next `arm`
    pub fn disarm(&mut self) {
        self.armed = false;
        self.ended = false;
        self.state = VadState::default();
        self.silence_deadline_ms = None;
    }

    /// Switch threshold without touching confirmation or timers
    pub fn set_mode(&mut self, mode: ListenMode) {
        if self.mode != mode {
            self.mode = mode;
            debug!("VAD switched to {} mode (threshold {:.1})", mode, self.threshold());
        }
    }

    /// Measure the recording ceiling from `started_at_ms`
    pub fn restart_ceiling(&mut self, started_at_ms: u64) {
        self.started_at_ms = started_at_ms;
    }

    pub fn mode(&self) -> ListenMode {
        self.mode
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Threshold for the current mode
    pub fn threshold(&self) -> f32 {
        match self.mode {
            ListenMode::Normal => self.config.threshold,
            ListenMode::BargeIn => self.config.threshold * self.config.barge_in_multiplier,
        }
    }

    /// Feed one loudness sample
    pub fn process(&mut self, sample: LoudnessSample) -> Option<VadEvent> {
        if !self.armed || self.ended {
            return None;
        }

        self.samples_seen += 1;
        if self.samples_seen % LEVEL_LOG_INTERVAL == 0 {
            debug!(
                "Level {:.1} (threshold {:.1}, confirmed: {})",
                sample.value,
                self.threshold(),
                self.state.has_confirmed_speech
            );
        }

        if sample.value > self.threshold() {
            self.state.consecutive_above_threshold_frames += 1;
            self.last_above_ms = sample.timestamp_ms;

            if self.silence_deadline_ms.take().is_some() {
                self.state.silence_timer_armed = false;
            }

            if !self.state.has_confirmed_speech
                && self.state.consecutive_above_threshold_frames >= self.config.confirm_frames
            {
                self.state.has_confirmed_speech = true;
                debug!("Speech confirmed at level {:.1}", sample.value);
                return Some(VadEvent::SpeechStarted {
                    at_ms: sample.timestamp_ms,
                    level: sample.value,
                });
            }
        } else {
            self.state.consecutive_above_threshold_frames = 0;

            if self.state.has_confirmed_speech && self.silence_deadline_ms.is_none() {
                self.silence_deadline_ms = Some(self.last_above_ms + self.config.silence_duration_ms);
                self.state.silence_timer_armed = true;
            }
        }

        None
    }

    /// Check deadlines against the clock
    pub fn poll(&mut self, now_ms: u64) -> Option<VadEvent> {
        if !self.armed || self.ended || !self.state.has_confirmed_speech {
            return None;
        }

        if let Some(deadline) = self.silence_deadline_ms {
            if now_ms >= deadline {
                return Some(self.end(deadline, EndReason::Silence));
            }
        }

        let ceiling = self.started_at_ms + self.config.max_recording_ms;
        if now_ms >= ceiling {
            debug!("Max recording duration reached");
            return Some(self.end(ceiling, EndReason::MaxDuration));
        }

        None
    }

    fn end(&mut self, at_ms: u64, reason: EndReason) -> VadEvent {
        self.ended = true;
        self.silence_deadline_ms = None;
        self.state.silence_timer_armed = false;
        VadEvent::SpeechEnded { at_ms, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: u64 = 16;

    fn sample(value: f32, at: u64) -> LoudnessSample {
        LoudnessSample::new(value, at)
    }

    /// Feed `values` one per tick starting at `start`, process then poll each
    fn drive(
        vad: &mut VoiceActivityDetector,
        values: &[f32],
        start: u64,
    ) -> Vec<(u64, VadEvent)> {
        let mut events = Vec::new();
        for (i, &value) in values.iter().enumerate() {
            let now = start + i as u64 * TICK;
            if let Some(e) = vad.process(sample(value, now)) {
                events.push((now, e));
            }
            if let Some(e) = vad.poll(now) {
                events.push((now, e));
            }
        }
        events
    }

    #[test]
    fn test_speech_starts_on_fifth_loud_frame() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 0);

        let events = drive(&mut vad, &[35.0; 5], 0);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].1,
            VadEvent::SpeechStarted {
                at_ms: 64,
                level: 35.0
            }
        );
        assert!(vad.state().has_confirmed_speech);
    }

    #[test]
    fn test_speech_ends_after_silence_duration() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 0);
        drive(&mut vad, &[35.0; 5], 0);

        // Last loud sample at 64 ms
        assert_eq!(vad.process(sample(10.0, 80)), None);
        assert!(vad.state().silence_timer_armed);

        assert_eq!(vad.poll(1563), None);
        assert_eq!(
            vad.poll(1564),
            Some(VadEvent::SpeechEnded {
                at_ms: 1564,
                reason: EndReason::Silence
            })
        );
        assert_eq!(vad.poll(2000), None);
    }

    #[test]
    fn test_loud_sample_cancels_silence_timer() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 0);
        drive(&mut vad, &[35.0; 5], 0);

        vad.process(sample(10.0, 80));
        assert!(vad.state().silence_timer_armed);

        vad.process(sample(40.0, 1000));
        assert!(!vad.state().silence_timer_armed);
        assert_eq!(vad.poll(1564), None);

        vad.process(sample(5.0, 1016));
        assert_eq!(vad.poll(2499), None);
        assert!(matches!(
            vad.poll(2500),
            Some(VadEvent::SpeechEnded {
                at_ms: 2500,
                reason: EndReason::Silence
            })
        ));
    }

    #[test]
    fn test_interrupted_run_does_not_confirm() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 0);

        let events = drive(&mut vad, &[35.0, 35.0, 35.0, 35.0, 20.0, 35.0, 35.0], 0);
        assert!(events.is_empty());
        assert_eq!(vad.state().consecutive_above_threshold_frames, 2);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 0);
        assert!(drive(&mut vad, &[27.0; 10], 0).is_empty());
    }

    #[test]
    fn test_speech_started_at_most_once() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 0);
        let events = drive(&mut vad, &[60.0; 20], 0);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_no_silence_timer_before_confirmation() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 0);
        drive(&mut vad, &[5.0; 10], 0);
        assert!(!vad.state().silence_timer_armed);
        assert_eq!(vad.poll(60_000), None);
    }

    #[test]
    fn test_barge_in_doubles_threshold() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::BargeIn, 0);
        assert_eq!(vad.threshold(), 54.0);

        assert!(drive(&mut vad, &[40.0; 10], 0).is_empty());

        let events = drive(&mut vad, &[60.0; 5], 160);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].1, VadEvent::SpeechStarted { .. }));
    }

    #[test]
    fn test_set_mode_keeps_confirmation() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::BargeIn, 0);
        drive(&mut vad, &[60.0; 5], 0);

        vad.set_mode(ListenMode::Normal);
        assert_eq!(vad.threshold(), 27.0);
        assert!(vad.state().has_confirmed_speech);

        // 40 is speech in normal mode, so no silence timer
        vad.process(sample(40.0, 100));
        assert!(!vad.state().silence_timer_armed);
    }

    #[test]
    fn test_max_duration_only_after_confirmation() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 1000);
        assert_eq!(vad.poll(20_000), None);

        // Ceiling already passed, so it fires on the confirming tick
        let events = drive(&mut vad, &[60.0; 5], 20_000);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].1, VadEvent::SpeechStarted { .. }));
        assert_eq!(
            events[1].1,
            VadEvent::SpeechEnded {
                at_ms: 16_000,
                reason: EndReason::MaxDuration
            }
        );
        assert_eq!(vad.poll(20_100), None);
    }

    #[test]
    fn test_restarted_ceiling() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 1000);

        let events = drive(&mut vad, &[60.0; 5], 20_000);
        assert_eq!(events.len(), 2);

        vad.arm(ListenMode::Normal, 1000);
        drive(&mut vad, &[60.0; 4], 20_000);
        vad.restart_ceiling(19_000);
        let events = drive(&mut vad, &[60.0], 20_064);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].1, VadEvent::SpeechStarted { .. }));
        assert_eq!(vad.poll(33_999), None);
        assert_eq!(
            vad.poll(34_000),
            Some(VadEvent::SpeechEnded {
                at_ms: 34_000,
                reason: EndReason::MaxDuration
            })
        );
    }

    #[test]
    fn test_max_duration_while_speaking() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 0);

        let values = vec![60.0; 1000];
        let events = drive(&mut vad, &values, 0);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1].1,
            VadEvent::SpeechEnded {
                at_ms: 15_000,
                reason: EndReason::MaxDuration
            }
        );
    }

    #[test]
    fn test_rearm_is_idempotent() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 0);
        drive(&mut vad, &[60.0; 3], 0);

        vad.arm(ListenMode::Normal, 100);
        vad.arm(ListenMode::Normal, 100);
        assert_eq!(vad.state(), VadState::default());

        let events = drive(&mut vad, &[60.0; 5], 100);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_disarm_silences_everything() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.arm(ListenMode::Normal, 0);
        drive(&mut vad, &[60.0; 5], 0);
        vad.process(sample(1.0, 100));

        vad.disarm();
        assert!(!vad.is_armed());
        assert_eq!(vad.poll(10_000), None);
        assert_eq!(vad.process(sample(60.0, 10_016)), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(VadConfig::default().validate().is_ok());
        let zero_frames = VadConfig {
            confirm_frames: 0,
            ..Default::default()
        };
        assert!(zero_frames.validate().is_err());
    }
}
