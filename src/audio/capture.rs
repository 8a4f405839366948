use super::{ActivitySignal, AudioFrame, activity_level, encode_pcm16};
use crate::device::{
    AudioBackend, AudioContext, CaptureConstraints, FrameCallback, MicrophoneStream,
    ProcessingNode,
};
use crate::error::LiveError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, trace, warn};

/// Runs inside the hardware callback: measures activity, encodes the frame
/// and hands it to the session without ever waiting.
pub struct CapturePipeline {
    frames: mpsc::Sender<AudioFrame>,
    activity: ActivitySignal,
    sample_rate: u32,
    gain: f32,
    next_sequence: u64,
    dropped: Arc<AtomicU64>,
}

impl CapturePipeline {
    pub fn new(
        frames: mpsc::Sender<AudioFrame>,
        activity: ActivitySignal,
        sample_rate: u32,
        gain: f32,
    ) -> Self {
        Self {
            frames,
            activity,
            sample_rate,
            gain,
            next_sequence: 0,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counter of frames lost because the session was not keeping up.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }

    pub fn process(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        self.activity.set(activity_level(samples, self.gain));

        let frame = AudioFrame {
            sequence: self.next_sequence,
            sample_rate: self.sample_rate,
            pcm: encode_pcm16(samples),
        };
        self.next_sequence += 1;

        match self.frames.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "[Capture] Frame channel full, dropping frame #{}.",
                    frame.sequence
                );
            }
            Err(TrySendError::Closed(_)) => {
                trace!("[Capture] Frame channel closed, session is shutting down.");
            }
        }
    }

    pub fn into_callback(mut self) -> FrameCallback {
        Box::new(move |samples: &[f32]| self.process(samples))
    }
}

/// Microphone stream plus the processing node feeding the pipeline.
///
/// Both are released exactly once, by `stop` or on drop.
pub struct Capture {
    stream: Option<Box<dyn MicrophoneStream>>,
    node: Option<Box<dyn ProcessingNode>>,
}

impl Capture {
    /// Requests the microphone. The returned future does not borrow the backend,
    /// so the caller can race it against a shutdown signal.
    pub fn acquire(
        backend: &dyn AudioBackend,
        constraints: CaptureConstraints,
    ) -> impl Future<Output = Result<Self, LiveError>> + Send + 'static {
        let request = backend.request_microphone(constraints);
        async move {
            let stream = request.await?;
            info!(
                "[Capture] Microphone '{}' acquired ({}Hz, {}ch).",
                stream.device_id(),
                constraints.sample_rate,
                constraints.channel_count
            );
            Ok(Self::from_stream(stream))
        }
    }

    pub fn from_stream(stream: Box<dyn MicrophoneStream>) -> Self {
        Self {
            stream: Some(stream),
            node: None,
        }
    }

    /// Installs the processing node on the capture-rate context. Frames start
    /// flowing into `pipeline` from the next hardware callback.
    pub fn start(
        &mut self,
        ctx: &mut dyn AudioContext,
        frame_size: usize,
        pipeline: CapturePipeline,
    ) -> Result<(), LiveError> {
        if self.node.is_some() {
            warn!("[Capture] start called while already running; ignoring.");
            return Ok(());
        }
        let stream = self.stream.as_mut().ok_or(LiveError::NotReady)?;
        let node = ctx.create_processor(&mut **stream, frame_size, pipeline.into_callback())?;
        self.node = Some(node);
        info!(
            "[Capture] Processing node started: {} samples per frame at {}Hz.",
            frame_size,
            ctx.sample_rate()
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.node.is_some()
    }

    pub fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            info!("[Capture] Microphone '{}' released.", stream.device_id());
        }
        if let Some(mut node) = self.node.take() {
            node.disconnect();
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.stop();
    }
}
