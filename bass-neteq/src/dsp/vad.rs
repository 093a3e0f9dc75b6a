//! Energy-based voice activity detection on decoded audio.
//!
//! Used to classify output frames as passive and to let the background
//! noise estimator learn only from non-speech.

use crate::codec::SpeechType;

use super::{db_to_linear, mean_square};

/// Level above which a frame counts as speech, in dBov.
const SPEECH_THRESHOLD_DBOV: f32 = -50.0;
/// Frames a detection is held after the level drops.
const HANGOVER_FRAMES: u32 = 5;

#[derive(Debug, Clone)]
pub struct PostDecodeVad {
    enabled: bool,
    running: bool,
    active_speech: bool,
    hangover: u32,
    threshold_energy: f32,
}

impl PostDecodeVad {
    pub fn new(enabled: bool) -> Self {
        let threshold = 32768.0 * db_to_linear(SPEECH_THRESHOLD_DBOV);
        Self {
            enabled,
            running: false,
            active_speech: true,
            hangover: 0,
            threshold_energy: threshold * threshold,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.running = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Start over, e.g. after a sample rate change.
    pub fn init(&mut self) {
        self.running = false;
        self.active_speech = true;
        self.hangover = 0;
    }

    /// Classify freshly decoded audio.
    ///
    /// Comfort noise and SID frames stop the detector; it restarts with the
    /// next decoded speech.
    pub fn update(&mut self, decoded: &[i16], speech_type: SpeechType, sid_frame_available: bool) {
        if !self.enabled {
            return;
        }
        if decoded.is_empty() || speech_type == SpeechType::ComfortNoise || sid_frame_available {
            self.running = false;
            self.active_speech = true;
            self.hangover = 0;
            return;
        }
        self.running = true;
        if mean_square(decoded) > self.threshold_energy {
            self.active_speech = true;
            self.hangover = HANGOVER_FRAMES;
        } else if self.hangover > 0 {
            self.hangover -= 1;
            self.active_speech = true;
        } else {
            self.active_speech = false;
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn active_speech(&self) -> bool {
        self.active_speech
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_runs() {
        let mut vad = PostDecodeVad::new(false);
        vad.update(&[0; 80], SpeechType::Speech, false);
        assert!(!vad.running());
        assert!(vad.active_speech());
    }

    #[test]
    fn test_speech_and_silence() {
        let mut vad = PostDecodeVad::new(true);
        vad.update(&[3000; 80], SpeechType::Speech, false);
        assert!(vad.running());
        assert!(vad.active_speech());

        for _ in 0..HANGOVER_FRAMES {
            vad.update(&[1; 80], SpeechType::Speech, false);
            assert!(vad.active_speech());
        }
        vad.update(&[1; 80], SpeechType::Speech, false);
        assert!(!vad.active_speech());
    }

    #[test]
    fn test_comfort_noise_stops_detector() {
        let mut vad = PostDecodeVad::new(true);
        vad.update(&[1; 80], SpeechType::Speech, false);
        assert!(vad.running());
        vad.update(&[1; 80], SpeechType::ComfortNoise, false);
        assert!(!vad.running());
        vad.update(&[1; 80], SpeechType::Speech, true);
        assert!(!vad.running());
        vad.disable();
        assert!(!vad.is_enabled());
    }
}
