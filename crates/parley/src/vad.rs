//! Energy-based voice activity detection with ambient-noise calibration
//!
//! The detector runs `Calibrating → Idle ⇄ Speaking`. All timing is derived
//! from frame timestamps, so the detector behaves identically on live capture
//! and on synthetic frames in tests.

use crate::audio::AudioFrame;
use crate::config::VadConfig;
use tracing::{debug, info};

/// Result of a calibration pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationProfile {
    /// Mean RMS energy over the calibration window
    pub baseline_energy: f32,

    /// max(threshold_factor * baseline, energy_floor)
    pub adaptive_threshold: f32,

    /// Number of frames measured
    pub sample_count: usize,
}

impl CalibrationProfile {
    pub fn from_baseline(baseline_energy: f32, sample_count: usize, config: &VadConfig) -> Self {
        Self {
            baseline_energy,
            adaptive_threshold: (config.threshold_factor * baseline_energy).max(config.energy_floor),
            sample_count,
        }
    }
}

/// A closed utterance, ready for transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSegment {
    /// Timestamp of the first voiced frame
    pub start_ms: i64,

    /// End of the last voiced frame (trailing silence is trimmed)
    pub end_ms: i64,

    /// Voiced time only; pauses inside the segment are not counted
    pub speech_ms: i64,

    pub frames: Vec<AudioFrame>,
}

impl SpeechSegment {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

/// Events emitted by the detector
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    /// Calibration finished (initially or after drift)
    Calibrated(CalibrationProfile),

    /// Ambient noise drifted; calibration restarted
    Recalibrating,

    /// First voiced frame of a new segment
    SpeechStarted { at_ms: i64 },

    /// Segment closed with enough speech
    SpeechEnded(SpeechSegment),

    /// Segment closed but was too short (cough, click, breath)
    SpeechDiscarded { speech_ms: i64 },
}

#[derive(Debug)]
struct OpenSegment {
    frames: Vec<AudioFrame>,
    start_ms: i64,
    last_voiced_end: i64,
    last_voiced_len: usize,
    speech_ms: i64,
}

impl OpenSegment {
    fn new(frame: AudioFrame) -> Self {
        let mut segment = Self {
            start_ms: frame.timestamp_ms,
            last_voiced_end: frame.timestamp_ms,
            frames: Vec::new(),
            last_voiced_len: 0,
            speech_ms: 0,
        };
        segment.push(frame, true);
        segment
    }

    fn push(&mut self, frame: AudioFrame, voiced: bool) {
        if voiced {
            self.speech_ms += frame.duration_ms();
            self.last_voiced_end = frame.end_ms();
        }
        self.frames.push(frame);
        if voiced {
            self.last_voiced_len = self.frames.len();
        }
    }

    fn close(mut self) -> SpeechSegment {
        self.frames.truncate(self.last_voiced_len);
        SpeechSegment {
            start_ms: self.start_ms,
            end_ms: self.last_voiced_end,
            speech_ms: self.speech_ms,
            frames: self.frames,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Calibrating {
        started_at: Option<i64>,
        energy_sum: f64,
        samples: usize,
    },
    Idle {
        drift_since: Option<i64>,
    },
    Speaking(OpenSegment),
}

impl Phase {
    fn calibrating() -> Self {
        Phase::Calibrating {
            started_at: None,
            energy_sum: 0.0,
            samples: 0,
        }
    }
}

/// Coarse detector state, for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Calibrating,
    Idle,
    Speaking,
}

/// Energy VAD driven one frame at a time.
pub struct VoiceActivityDetector {
    config: VadConfig,
    phase: Phase,
    profile: Option<CalibrationProfile>,

    /// Segment set aside while the assistant speaks
    held: Option<OpenSegment>,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            phase: Phase::calibrating(),
            profile: None,
            held: None,
        }
    }

    /// Latest calibration; kept while a re-calibration is running.
    pub fn profile(&self) -> Option<&CalibrationProfile> {
        self.profile.as_ref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.profile.is_some()
    }

    pub fn state(&self) -> VadState {
        match self.phase {
            Phase::Calibrating { .. } => VadState::Calibrating,
            Phase::Idle { .. } => VadState::Idle,
            Phase::Speaking(_) => VadState::Speaking,
        }
    }

    /// Feed one frame. At most one event per frame.
    pub fn process(&mut self, frame: AudioFrame) -> Option<VadEvent> {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle { drift_since: None });
        let (next, event) = match phase {
            Phase::Calibrating {
                started_at,
                energy_sum,
                samples,
            } => self.calibrate(frame, started_at, energy_sum, samples),
            Phase::Idle { drift_since } => self.idle(frame, drift_since),
            Phase::Speaking(segment) => self.speaking(frame, segment),
        };
        self.phase = next;
        event
    }

    fn calibrate(
        &mut self,
        frame: AudioFrame,
        started_at: Option<i64>,
        energy_sum: f64,
        samples: usize,
    ) -> (Phase, Option<VadEvent>) {
        let started_at = started_at.unwrap_or(frame.timestamp_ms);
        let energy_sum = energy_sum + frame.rms_energy as f64;
        let samples = samples + 1;

        if frame.end_ms() - started_at < self.config.calibration_ms as i64 {
            let phase = Phase::Calibrating {
                started_at: Some(started_at),
                energy_sum,
                samples,
            };
            return (phase, None);
        }

        let baseline = (energy_sum / samples as f64) as f32;
        let profile = CalibrationProfile::from_baseline(baseline, samples, &self.config);
        info!(
            "🎚️ Calibrated: baseline {:.4}, threshold {:.4} ({} frames)",
            profile.baseline_energy, profile.adaptive_threshold, profile.sample_count
        );
        self.profile = Some(profile);
        (Phase::Idle { drift_since: None }, Some(VadEvent::Calibrated(profile)))
    }

    fn idle(&mut self, frame: AudioFrame, drift_since: Option<i64>) -> (Phase, Option<VadEvent>) {
        let Some(profile) = self.profile else {
            return (Phase::calibrating(), None);
        };

        if frame.rms_energy > profile.adaptive_threshold {
            let at_ms = frame.timestamp_ms;
            debug!("Speech started at {}ms (energy {:.4})", at_ms, frame.rms_energy);
            return (
                Phase::Speaking(OpenSegment::new(frame)),
                Some(VadEvent::SpeechStarted { at_ms }),
            );
        }

        if !self.drifted(&profile, frame.rms_energy) {
            return (Phase::Idle { drift_since: None }, None);
        }

        let since = drift_since.unwrap_or(frame.timestamp_ms);
        if frame.end_ms() - since > self.config.recalibration_after_ms as i64 {
            info!("🔄 Ambient noise drifted for {}ms; re-calibrating", frame.end_ms() - since);
            return (Phase::calibrating(), Some(VadEvent::Recalibrating));
        }
        (Phase::Idle { drift_since: Some(since) }, None)
    }

    fn drifted(&self, profile: &CalibrationProfile, energy: f32) -> bool {
        let baseline = profile.baseline_energy.max(f32::EPSILON);
        energy > baseline * self.config.drift_ratio || energy < baseline / self.config.drift_ratio
    }

    fn speaking(&mut self, frame: AudioFrame, mut segment: OpenSegment) -> (Phase, Option<VadEvent>) {
        let threshold = self.profile.map(|p| p.adaptive_threshold).unwrap_or(self.config.energy_floor);
        let voiced = frame.rms_energy > threshold;
        let frame_end = frame.end_ms();
        segment.push(frame, voiced);

        let too_long = frame_end - segment.start_ms >= self.config.max_segment_ms as i64;
        let silent_long_enough =
            !voiced && frame_end - segment.last_voiced_end >= self.config.silence_debounce_ms as i64;

        if !(too_long || silent_long_enough) {
            return (Phase::Speaking(segment), None);
        }
        if too_long {
            debug!("Segment reached {}ms; force-closing", self.config.max_segment_ms);
        }
        (Phase::Idle { drift_since: None }, Some(self.close(segment)))
    }

    fn close(&self, segment: OpenSegment) -> VadEvent {
        let segment = segment.close();
        if segment.speech_ms >= self.config.min_speech_ms as i64 {
            info!(
                "🗣️ Speech segment {}..{}ms ({}ms voiced, {} frames)",
                segment.start_ms,
                segment.end_ms,
                segment.speech_ms,
                segment.frames.len()
            );
            VadEvent::SpeechEnded(segment)
        } else {
            debug!("Discarding {}ms of non-speech", segment.speech_ms);
            VadEvent::SpeechDiscarded {
                speech_ms: segment.speech_ms,
            }
        }
    }

    /// Open a segment from frames that already confirmed a barge-in.
    ///
    /// A segment held back by [`hold_segment`](Self::hold_segment) is
    /// continued instead, as long as it stays within `max_segment_ms`.
    /// Returns false before the first calibration, when there is nothing to
    /// compare subsequent frames against.
    pub fn start_segment_from(&mut self, frames: Vec<AudioFrame>) -> bool {
        let held = self.held.take();
        if self.profile.is_none() {
            return false;
        }
        let mut frames = frames.into_iter();
        let Some(first) = frames.next() else {
            return false;
        };

        let mut segment = match held {
            Some(mut held) if first.end_ms() - held.start_ms < self.config.max_segment_ms as i64 => {
                debug!("Resuming segment from {}ms after barge-in", held.start_ms);
                held.push(first, true);
                held
            }
            _ => OpenSegment::new(first),
        };
        for frame in frames {
            segment.push(frame, true);
        }
        debug!("Segment handed over from barge-in at {}ms", segment.start_ms);
        self.phase = Phase::Speaking(segment);
        true
    }

    /// Set a partially captured segment aside (playback just started). A
    /// barge-in picks it up again; otherwise it is dropped with
    /// [`release_held`](Self::release_held).
    pub fn hold_segment(&mut self) -> bool {
        match std::mem::replace(&mut self.phase, Phase::Idle { drift_since: None }) {
            Phase::Speaking(segment) => {
                self.held = Some(segment);
                true
            }
            other => {
                self.phase = other;
                false
            }
        }
    }

    /// Drop a held segment. Returns whether there was one.
    pub fn release_held(&mut self) -> bool {
        self.held.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: i64 = 50;

    fn frame(ts: i64, energy: f32) -> AudioFrame {
        let amplitude = (energy * 32768.0) as i16;
        AudioFrame::new(vec![amplitude; 800], 16000, ts)
    }

    /// Feed `ms` worth of frames at `energy`, starting at `*ts`.
    fn feed(vad: &mut VoiceActivityDetector, ts: &mut i64, ms: i64, energy: f32) -> Vec<VadEvent> {
        let mut events = Vec::new();
        for _ in 0..(ms / FRAME) {
            if let Some(e) = vad.process(frame(*ts, energy)) {
                events.push(e);
            }
            *ts += FRAME;
        }
        events
    }

    fn calibrated(energy: f32) -> (VoiceActivityDetector, i64) {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        let mut ts = 0;
        let events = feed(&mut vad, &mut ts, 2000, energy);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], VadEvent::Calibrated(_)));
        (vad, ts)
    }

    #[test]
    fn test_calibration_threshold_uses_floor() {
        let (vad, _) = calibrated(0.005);
        let p = vad.profile().unwrap();
        assert!((p.baseline_energy - 0.005).abs() < 0.001);
        assert!((p.adaptive_threshold - 0.02).abs() < 1e-6);
        assert_eq!(p.sample_count, 40);
    }

    #[test]
    fn test_calibration_scales_with_noise() {
        let (quiet, _) = calibrated(0.03);
        let (noisy, _) = calibrated(0.06);
        let t1 = quiet.profile().unwrap().adaptive_threshold;
        let t2 = noisy.profile().unwrap().adaptive_threshold;
        assert!((t1 - 0.045).abs() < 0.002, "got {}", t1);
        assert!((t2 / t1 - 2.0).abs() < 0.05, "got {} vs {}", t2, t1);
    }

    #[test]
    fn test_500ms_speech_emits_one_segment() {
        let (mut vad, mut ts) = calibrated(0.005);
        let mut events = feed(&mut vad, &mut ts, 500, 0.2);
        events.extend(feed(&mut vad, &mut ts, 1500, 0.005));

        let segments: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                VadEvent::SpeechEnded(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(segments.len(), 1);
        let s = segments[0];
        assert_eq!(s.start_ms, 2000);
        assert_eq!(s.duration_ms(), 500);
        assert_eq!(s.speech_ms, 500);
        assert_eq!(s.frames.len(), 10);
        assert_eq!(vad.state(), VadState::Idle);
    }

    #[test]
    fn test_short_blip_is_discarded() {
        let (mut vad, mut ts) = calibrated(0.005);
        let mut events = feed(&mut vad, &mut ts, 200, 0.2);
        events.extend(feed(&mut vad, &mut ts, 1000, 0.005));

        assert!(events.iter().all(|e| !matches!(e, VadEvent::SpeechEnded(_))));
        assert!(events.contains(&VadEvent::SpeechDiscarded { speech_ms: 200 }));
    }

    #[test]
    fn test_pause_within_debounce_keeps_one_segment() {
        let (mut vad, mut ts) = calibrated(0.005);
        let mut events = feed(&mut vad, &mut ts, 300, 0.2);
        events.extend(feed(&mut vad, &mut ts, 400, 0.005));
        events.extend(feed(&mut vad, &mut ts, 300, 0.2));
        events.extend(feed(&mut vad, &mut ts, 1000, 0.005));

        let ended: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, VadEvent::SpeechEnded(_)))
            .collect();
        assert_eq!(ended.len(), 1);
        if let VadEvent::SpeechEnded(s) = ended[0] {
            assert_eq!(s.speech_ms, 600);
            assert_eq!(s.duration_ms(), 1000);
        }
    }

    #[test]
    fn test_long_speech_is_force_closed() {
        let config = VadConfig {
            max_segment_ms: 1000,
            ..Default::default()
        };
        let mut vad = VoiceActivityDetector::new(config);
        let mut ts = 0;
        feed(&mut vad, &mut ts, 2000, 0.005);
        let events = feed(&mut vad, &mut ts, 1500, 0.2);
        assert!(events.iter().any(|e| matches!(e, VadEvent::SpeechEnded(s) if s.duration_ms() == 1000)));
    }

    #[test]
    fn test_drift_triggers_recalibration() {
        let (mut vad, mut ts) = calibrated(0.002);
        // Louder than baseline * 1.5 but still under the 0.02 floor.
        let events = feed(&mut vad, &mut ts, 30_100, 0.01);
        assert_eq!(events, vec![VadEvent::Recalibrating]);
        assert_eq!(vad.state(), VadState::Calibrating);
        assert!(vad.is_calibrated());

        let events = feed(&mut vad, &mut ts, 2000, 0.01);
        assert!(matches!(events.as_slice(), [VadEvent::Calibrated(p)] if (p.baseline_energy - 0.01).abs() < 0.001));
    }

    #[test]
    fn test_stable_silence_does_not_recalibrate() {
        let (mut vad, mut ts) = calibrated(0.005);
        let events = feed(&mut vad, &mut ts, 40_000, 0.005);
        assert!(events.is_empty());
    }

    #[test]
    fn test_barge_in_handoff() {
        let (mut vad, mut ts) = calibrated(0.005);
        let frames: Vec<_> = (0..3).map(|i| frame(ts + i * FRAME, 0.3)).collect();
        ts += 3 * FRAME;
        assert!(vad.start_segment_from(frames));
        assert_eq!(vad.state(), VadState::Speaking);

        let mut events = feed(&mut vad, &mut ts, 300, 0.2);
        events.extend(feed(&mut vad, &mut ts, 800, 0.005));
        assert!(events.iter().any(|e| matches!(e, VadEvent::SpeechEnded(s) if s.speech_ms == 450)));
    }

    #[test]
    fn test_handoff_requires_calibration() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        assert!(!vad.start_segment_from(vec![frame(0, 0.3)]));
        assert!(!vad.hold_segment());
    }

    #[test]
    fn test_held_segment_continues_after_barge_in() {
        let (mut vad, mut ts) = calibrated(0.005);
        let start = ts;
        feed(&mut vad, &mut ts, 300, 0.2);
        assert!(vad.hold_segment());
        assert_eq!(vad.state(), VadState::Idle);

        // One second of assistant audio the VAD never sees.
        ts += 1000;
        let run: Vec<_> = (0..3).map(|i| frame(ts + i * FRAME, 0.3)).collect();
        ts += 3 * FRAME;
        assert!(vad.start_segment_from(run));

        let mut events = feed(&mut vad, &mut ts, 300, 0.2);
        events.extend(feed(&mut vad, &mut ts, 800, 0.005));
        let segment = events
            .iter()
            .find_map(|e| match e {
                VadEvent::SpeechEnded(s) => Some(s),
                _ => None,
            })
            .expect("no segment");
        assert_eq!(segment.start_ms, start);
        assert_eq!(segment.speech_ms, 750);
        assert_eq!(segment.frames.len(), 15);
    }

    #[test]
    fn test_released_segment_is_not_resumed() {
        let (mut vad, mut ts) = calibrated(0.005);
        feed(&mut vad, &mut ts, 300, 0.2);
        assert!(vad.hold_segment());
        assert!(vad.release_held());
        assert!(!vad.release_held());

        ts += 1000;
        let barge_at = ts;
        let run: Vec<_> = (0..3).map(|i| frame(ts + i * FRAME, 0.3)).collect();
        ts += 3 * FRAME;
        assert!(vad.start_segment_from(run));

        let mut events = feed(&mut vad, &mut ts, 300, 0.2);
        events.extend(feed(&mut vad, &mut ts, 800, 0.005));
        assert!(events
            .iter()
            .any(|e| matches!(e, VadEvent::SpeechEnded(s) if s.start_ms == barge_at && s.speech_ms == 450)));
    }
}
