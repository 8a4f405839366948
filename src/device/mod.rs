//! Seams to the host audio platform.
//!
//! A session only ever talks to hardware through these traits: it acquires an
//! exclusive microphone stream, opens one context at the capture rate and one
//! at the playback rate, installs a processing node that delivers fixed-size
//! frames, and schedules buffers at absolute times on the playback clock.

use crate::audio::PlaybackBuffer;
use crate::error::LiveError;
use futures_util::future::BoxFuture;

#[cfg(feature = "cpal-backend")]
pub mod cpal_backend;
#[cfg(test)]
pub(crate) mod mock;

#[cfg(feature = "cpal-backend")]
pub use cpal_backend::CpalBackend;

/// Invoked from the platform's audio callback with one frame of mono samples.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl CaptureConstraints {
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channel_count: 1,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

pub trait AudioBackend: Send + Sync + 'static {
    /// Asks for microphone access. Resolves to `PermissionDenied` when the user
    /// declines and `DeviceUnavailable` when there is no input device.
    fn request_microphone(
        &self,
        constraints: CaptureConstraints,
    ) -> BoxFuture<'static, Result<Box<dyn MicrophoneStream>, LiveError>>;

    fn create_context(&self, sample_rate: u32) -> Result<Box<dyn AudioContext>, LiveError>;
}

pub trait MicrophoneStream: Send {
    fn device_id(&self) -> &str;

    /// Stops every track of the stream and releases the device.
    fn stop(&mut self);
}

pub trait AudioContext: Send {
    fn sample_rate(&self) -> u32;

    /// Position of the context clock in seconds.
    fn current_time(&self) -> f64;

    /// Routes `stream` through a node that calls `on_frame` with
    /// `frame_size` samples per hardware callback.
    fn create_processor(
        &mut self,
        stream: &mut dyn MicrophoneStream,
        frame_size: usize,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn ProcessingNode>, LiveError>;

    /// Starts `buffer` at `when` on this context's clock.
    fn start_source(
        &mut self,
        buffer: &PlaybackBuffer,
        when: f64,
    ) -> Result<Box<dyn SourceHandle>, LiveError>;

    fn close(&mut self);
}

pub trait ProcessingNode: Send {
    fn disconnect(&mut self);
}

pub trait SourceHandle: Send {
    /// Hard stop. Calling it on a source that already ended is harmless.
    fn stop(&mut self);
}
