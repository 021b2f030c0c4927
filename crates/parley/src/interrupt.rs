//! Barge-in detection while the assistant is speaking.
//!
//! Uses a desensitized threshold so the assistant's own voice leaking into the
//! microphone does not trigger it, and requires a few consecutive loud frames.

use crate::audio::AudioFrame;
use crate::config::InterruptConfig;
use crate::vad::CalibrationProfile;
use tracing::{debug, info};

pub struct InterruptController {
    config: InterruptConfig,
    energy_floor: f32,
    threshold: Option<f32>,
    run: Vec<AudioFrame>,
}

impl InterruptController {
    pub fn new(config: InterruptConfig, energy_floor: f32) -> Self {
        Self {
            config,
            energy_floor,
            threshold: None,
            run: Vec::new(),
        }
    }

    /// Derive the barge-in threshold from a (re-)calibration.
    pub fn calibrate(&mut self, profile: &CalibrationProfile) {
        let threshold = (self.config.threshold_factor * profile.baseline_energy).max(self.energy_floor);
        debug!("Barge-in threshold set to {:.4}", threshold);
        self.threshold = Some(threshold);
        self.run.clear();
    }

    pub fn threshold(&self) -> Option<f32> {
        self.threshold
    }

    /// Observe one frame captured during playback.
    ///
    /// Returns the confirming run of frames once `confirm_frames` consecutive
    /// frames exceed the threshold; the run then starts over.
    pub fn observe(&mut self, frame: &AudioFrame) -> Option<Vec<AudioFrame>> {
        let threshold = self.threshold?;

        if frame.rms_energy <= threshold {
            self.run.clear();
            return None;
        }

        self.run.push(frame.clone());
        if self.run.len() < self.config.confirm_frames {
            return None;
        }

        info!(
            "✋ Barge-in confirmed at {}ms ({} frames over {:.4})",
            frame.timestamp_ms,
            self.run.len(),
            threshold
        );
        Some(std::mem::take(&mut self.run))
    }

    /// Forget a partial run (playback stopped before confirmation).
    pub fn reset(&mut self) {
        self.run.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VadConfig;

    fn frame(ts: i64, energy: f32) -> AudioFrame {
        AudioFrame::new(vec![(energy * 32768.0) as i16; 800], 16000, ts)
    }

    fn controller(baseline: f32) -> InterruptController {
        let mut c = InterruptController::new(InterruptConfig::default(), 0.02);
        c.calibrate(&CalibrationProfile::from_baseline(baseline, 40, &VadConfig::default()));
        c
    }

    #[test]
    fn test_uncalibrated_never_fires() {
        let mut c = InterruptController::new(InterruptConfig::default(), 0.02);
        for i in 0..10 {
            assert!(c.observe(&frame(i * 50, 0.5)).is_none());
        }
    }

    #[test]
    fn test_threshold_is_desensitized() {
        let c = controller(0.03);
        assert!((c.threshold().unwrap() - 0.06).abs() < 1e-6);
        let quiet = controller(0.001);
        assert!((quiet.threshold().unwrap() - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_confirms_on_third_frame() {
        let mut c = controller(0.03);
        assert!(c.observe(&frame(0, 0.2)).is_none());
        assert!(c.observe(&frame(50, 0.2)).is_none());
        let run = c.observe(&frame(100, 0.2)).unwrap();
        assert_eq!(run.len(), 3);
        assert_eq!(run[0].timestamp_ms, 0);
    }

    #[test]
    fn test_quiet_frame_breaks_run() {
        let mut c = controller(0.03);
        c.observe(&frame(0, 0.2));
        c.observe(&frame(50, 0.2));
        // Between the VAD threshold (0.045) and the barge-in threshold (0.06).
        assert!(c.observe(&frame(100, 0.05)).is_none());
        assert!(c.observe(&frame(150, 0.2)).is_none());
        assert!(c.observe(&frame(200, 0.2)).is_none());
        assert!(c.observe(&frame(250, 0.2)).is_some());
    }
}
