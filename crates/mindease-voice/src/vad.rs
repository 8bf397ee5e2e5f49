//! Energy-based voice activity detection.
//!
//! Cheap enough to run on every capture frame. Used to duck playback as soon
//! as the user starts talking, before the recognizer produces any text.

use std::time::Duration;

/// Result of voice activity detection on an audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadResult {
    Speech,
    Silence,
    /// The frame was empty.
    Unknown,
}

/// Classifies short audio frames as speech or silence.
pub trait VoiceActivityDetector: Send + Sync {
    /// `frame` holds PCM samples in [-1.0, 1.0].
    fn detect(&self, frame: &[f32]) -> VadResult;
}

/// Root-mean-square level of a frame.
pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame.iter().map(|s| s * s).sum();
    (sum / frame.len() as f32).sqrt()
}

/// Frames whose RMS level reaches `threshold` count as speech.
#[derive(Debug, Clone, Copy)]
pub struct EnergyVad {
    pub threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.02)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn detect(&self, frame: &[f32]) -> VadResult {
        if frame.is_empty() {
            return VadResult::Unknown;
        }
        if rms(frame) >= self.threshold {
            VadResult::Speech
        } else {
            VadResult::Silence
        }
    }
}

/// Edge reported by [`SpeechGate::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEdge {
    Started,
    Ended,
}

/// Debounces per-frame results into speech start/end edges.
///
/// Speech starts after `min_speech` of consecutive speech frames and ends
/// after `hangover` of consecutive silence.
#[derive(Debug)]
pub struct SpeechGate<D> {
    detector: D,
    min_speech: Duration,
    hangover: Duration,
    speaking: bool,
    speech_run: Duration,
    silence_run: Duration,
}

impl<D: VoiceActivityDetector> SpeechGate<D> {
    pub fn new(detector: D, min_speech: Duration, hangover: Duration) -> Self {
        Self {
            detector,
            min_speech,
            hangover,
            speaking: false,
            speech_run: Duration::ZERO,
            silence_run: Duration::ZERO,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn detector_mut(&mut self) -> &mut D {
        &mut self.detector
    }

    /// Feed one frame lasting `frame_len`.
    pub fn push(&mut self, frame: &[f32], frame_len: Duration) -> Option<SpeechEdge> {
        match self.detector.detect(frame) {
            VadResult::Speech => {
                self.silence_run = Duration::ZERO;
                if self.speaking {
                    return None;
                }
                self.speech_run += frame_len;
                if self.speech_run >= self.min_speech {
                    self.speaking = true;
                    self.speech_run = Duration::ZERO;
                    return Some(SpeechEdge::Started);
                }
                None
            }
            VadResult::Silence => {
                self.speech_run = Duration::ZERO;
                if !self.speaking {
                    return None;
                }
                self.silence_run += frame_len;
                if self.silence_run >= self.hangover {
                    self.speaking = false;
                    self.silence_run = Duration::ZERO;
                    return Some(SpeechEdge::Ended);
                }
                None
            }
            VadResult::Unknown => None,
        }
    }

    pub fn reset(&mut self) {
        self.speaking = false;
        self.speech_run = Duration::ZERO;
        self.silence_run = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(20);

    fn loud() -> Vec<f32> {
        vec![0.2; 320]
    }

    fn quiet() -> Vec<f32> {
        vec![0.001; 320]
    }

    fn gate() -> SpeechGate<EnergyVad> {
        SpeechGate::new(
            EnergyVad::default(),
            Duration::from_millis(100),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_energy_detect() {
        let vad = EnergyVad::default();
        assert_eq!(vad.detect(&loud()), VadResult::Speech);
        assert_eq!(vad.detect(&quiet()), VadResult::Silence);
        assert_eq!(vad.detect(&[]), VadResult::Unknown);
    }

    #[test]
    fn test_speech_needs_minimum_duration() {
        let mut gate = gate();
        for _ in 0..4 {
            assert_eq!(gate.push(&loud(), FRAME), None);
        }
        assert_eq!(gate.push(&loud(), FRAME), Some(SpeechEdge::Started));
        assert!(gate.is_speaking());
    }

    #[test]
    fn test_short_blip_is_ignored() {
        let mut gate = gate();
        gate.push(&loud(), FRAME);
        gate.push(&loud(), FRAME);
        gate.push(&quiet(), FRAME);
        for _ in 0..4 {
            assert_eq!(gate.push(&loud(), FRAME), None);
        }
        assert!(!gate.is_speaking());
    }

    #[test]
    fn test_speech_ends_after_hangover() {
        let mut gate = gate();
        for _ in 0..5 {
            gate.push(&loud(), FRAME);
        }
        for _ in 0..24 {
            assert_eq!(gate.push(&quiet(), FRAME), None);
        }
        assert_eq!(gate.push(&quiet(), FRAME), Some(SpeechEdge::Ended));
        assert!(!gate.is_speaking());
    }

    #[test]
    fn test_threshold_is_adjustable() {
        let mut gate = gate();
        gate.detector_mut().threshold = 0.5;
        for _ in 0..10 {
            assert_eq!(gate.push(&loud(), FRAME), None);
        }
    }
}
