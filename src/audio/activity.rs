use std::sync::Arc;
use tokio::sync::watch;

/// Normalized loudness of one frame: `sqrt(mean(x²)) * gain`, clamped to [0, 1].
pub fn activity_level(samples: &[f32], gain: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_of_squares: f64 = samples
        .iter()
        .filter(|s| s.is_finite())
        .map(|&s| (s as f64) * (s as f64))
        .sum();
    let rms = (sum_of_squares / samples.len() as f64).sqrt() as f32;
    (rms * gain).clamp(0.0, 1.0)
}

/// Latest activity level, readable from the UI side.
///
/// Only the most recent value is kept. Writes never block, so the audio
/// callback can update it directly.
#[derive(Clone, Debug)]
pub struct ActivitySignal {
    sender: Arc<watch::Sender<f32>>,
}

impl Default for ActivitySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivitySignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(0.0);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn set(&self, level: f32) {
        self.sender.send_replace(level);
    }

    pub fn reset(&self) {
        self.set(0.0);
    }

    pub fn current(&self) -> f32 {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<f32> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_zero() {
        assert_eq!(activity_level(&[0.0; 4096], 5.0), 0.0);
        assert_eq!(activity_level(&[], 5.0), 0.0);
    }

    #[test]
    fn level_is_scaled_rms() {
        // Square wave at 0.1 has RMS 0.1.
        let frame: Vec<f32> = (0..1000).map(|i| if i % 2 == 0 { 0.1 } else { -0.1 }).collect();
        let level = activity_level(&frame, 5.0);
        assert!((level - 0.5).abs() < 1e-5, "level {}", level);
    }

    #[test]
    fn loud_frames_saturate_at_one() {
        assert_eq!(activity_level(&[0.9; 256], 5.0), 1.0);
    }

    #[test]
    fn signal_keeps_latest_value() {
        let signal = ActivitySignal::new();
        let mut rx = signal.subscribe();
        signal.set(0.3);
        signal.set(0.7);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 0.7);
        signal.reset();
        assert_eq!(signal.current(), 0.0);
    }
}
