//! Voice-activity detection: an opaque `is_voice(frame) -> bool`
//! predicate the gateway consults per received audio frame. The
//! production implementation wraps `earshot`; tests inject a stub.

use earshot::Detector;

const EARSHOT_FRAME: usize = 256; // 16ms at 16kHz
const DEFAULT_ONSET: f32 = 0.5;

/// A predicate over a chunk of mono 16 kHz float PCM. Implementations
/// may keep internal state (e.g. leftover samples between calls) but
/// must never block or perform I/O.
pub trait VoiceActivityDetector: Send {
    /// Returns true if the frame is judged to contain speech.
    fn is_voice(&mut self, frame: &[f32]) -> bool;

    /// Drop any accumulated state (called after a ring-buffer clip,
    /// since earlier leftover samples no longer correspond to
    /// anything the session still holds).
    fn reset(&mut self);
}

/// `earshot`-backed detector. Frames arrive in arbitrary sizes; we
/// accumulate into earshot's native 16ms windows and report the frame
/// as voiced if any window within it crosses `onset`.
pub struct EarshotVad {
    detector: Detector,
    leftovers: Vec<i16>,
    onset: f32,
}

impl EarshotVad {
    pub fn new() -> Self {
        Self::with_onset(DEFAULT_ONSET)
    }

    pub fn with_onset(onset: f32) -> Self {
        Self {
            detector: Detector::default(),
            leftovers: Vec::new(),
            onset,
        }
    }
}

impl Default for EarshotVad {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceActivityDetector for EarshotVad {
    fn is_voice(&mut self, frame: &[f32]) -> bool {
        let samples: Vec<i16> = frame
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect();

        let mut pos = 0;
        let mut voiced = false;

        if !self.leftovers.is_empty() {
            let need = EARSHOT_FRAME - self.leftovers.len();
            if samples.len() < need {
                self.leftovers.extend_from_slice(&samples);
                return false; // not enough yet to evaluate a window
            }
            self.leftovers.extend_from_slice(&samples[..need]);
            voiced |= self.detector.predict_i16(&self.leftovers) >= self.onset;
            self.leftovers.clear();
            pos = need;
        }

        while pos + EARSHOT_FRAME <= samples.len() {
            let chunk = &samples[pos..pos + EARSHOT_FRAME];
            voiced |= self.detector.predict_i16(chunk) >= self.onset;
            pos += EARSHOT_FRAME;
        }

        if pos < samples.len() {
            self.leftovers.extend_from_slice(&samples[pos..]);
        }

        voiced
    }

    fn reset(&mut self) {
        self.detector = Detector::default();
        self.leftovers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silence(n: usize) -> Vec<f32> {
        vec![0.0; n]
    }

    #[test]
    fn silent_frame_is_not_voice() {
        let mut vad = EarshotVad::new();
        assert!(!vad.is_voice(&silence(960)));
    }

    #[test]
    fn reset_clears_leftovers() {
        let mut vad = EarshotVad::new();
        vad.is_voice(&silence(100)); // leaves leftovers, no full window yet
        vad.reset();
        assert!(vad.leftovers.is_empty());
    }
}
