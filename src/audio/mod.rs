pub mod activity;
pub mod capture;
pub mod pcm;
pub mod playback;

#[cfg(feature = "audio-resampling")]
pub(crate) mod resample;

pub use activity::{ActivitySignal, activity_level};
pub use capture::{Capture, CapturePipeline};
pub use pcm::{decode_inline_audio, decode_pcm16, decode_playback_buffer, encode_pcm16};
pub use playback::PlaybackScheduler;

/// Sample rate the Live API uses for audio it returns when the MIME type omits one.
pub const DEFAULT_INBOUND_SAMPLE_RATE_HZ: u32 = 24000;

/// One block of captured audio, already encoded as 16-bit little-endian PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Capture order, starting at zero for each session.
    pub sequence: u64,
    pub sample_rate: u32,
    pub pcm: Vec<u8>,
}

impl AudioFrame {
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }
}

/// Decoded mono audio ready to be scheduled on the playback clock.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Set by the scheduler once the buffer has a slot on the timeline.
    pub start_time: Option<f64>,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            start_time: None,
        }
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}
