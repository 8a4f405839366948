//! Recording audio backend for tests: every acquire and release is counted so
//! tests can assert nothing leaks.

use super::{
    AudioBackend, AudioContext, CaptureConstraints, FrameCallback, MicrophoneStream,
    ProcessingNode, SourceHandle,
};
use crate::audio::PlaybackBuffer;
use crate::error::LiveError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MicPolicy {
    Grant,
    Deny,
    NoDevice,
    /// The permission prompt never resolves.
    Hang,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HardwareCounts {
    pub mic_requests: usize,
    pub mic_acquired: usize,
    pub mic_stopped: usize,
    pub contexts_created: usize,
    pub contexts_closed: usize,
    pub processors_created: usize,
    pub processors_disconnected: usize,
    pub sources_started: usize,
    pub sources_stopped: usize,
}

impl HardwareCounts {
    pub fn all_released(&self) -> bool {
        self.mic_acquired == self.mic_stopped
            && self.contexts_created == self.contexts_closed
            && self.processors_created == self.processors_disconnected
    }
}

#[derive(Default)]
struct Counters {
    mic_requests: AtomicUsize,
    mic_acquired: AtomicUsize,
    mic_stopped: AtomicUsize,
    contexts_created: AtomicUsize,
    contexts_closed: AtomicUsize,
    processors_created: AtomicUsize,
    processors_disconnected: AtomicUsize,
    sources_started: AtomicUsize,
    sources_stopped: AtomicUsize,
}

struct MockInner {
    policy: Mutex<MicPolicy>,
    clock: Mutex<f64>,
    counters: Counters,
    frame_callback: Mutex<Option<FrameCallback>>,
    scheduled: Mutex<Vec<(f64, f64)>>,
}

#[derive(Clone)]
pub(crate) struct MockBackend {
    inner: Arc<MockInner>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_policy(MicPolicy::Grant)
    }

    pub fn with_policy(policy: MicPolicy) -> Self {
        Self {
            inner: Arc::new(MockInner {
                policy: Mutex::new(policy),
                clock: Mutex::new(0.0),
                counters: Counters::default(),
                frame_callback: Mutex::new(None),
                scheduled: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_policy(&self, policy: MicPolicy) {
        *self.inner.policy.lock().unwrap() = policy;
    }

    pub fn set_clock(&self, seconds: f64) {
        *self.inner.clock.lock().unwrap() = seconds;
    }

    /// Pushes one frame through the installed processing node, as the
    /// hardware callback would. Returns false when no node is connected.
    pub fn emit_frame(&self, samples: &[f32]) -> bool {
        let mut guard = self.inner.frame_callback.lock().unwrap();
        match guard.as_mut() {
            Some(callback) => {
                callback(samples);
                true
            }
            None => false,
        }
    }

    /// `(start_time, duration)` of every source started so far.
    pub fn scheduled(&self) -> Vec<(f64, f64)> {
        self.inner.scheduled.lock().unwrap().clone()
    }

    pub fn counts(&self) -> HardwareCounts {
        let c = &self.inner.counters;
        HardwareCounts {
            mic_requests: c.mic_requests.load(Ordering::SeqCst),
            mic_acquired: c.mic_acquired.load(Ordering::SeqCst),
            mic_stopped: c.mic_stopped.load(Ordering::SeqCst),
            contexts_created: c.contexts_created.load(Ordering::SeqCst),
            contexts_closed: c.contexts_closed.load(Ordering::SeqCst),
            processors_created: c.processors_created.load(Ordering::SeqCst),
            processors_disconnected: c.processors_disconnected.load(Ordering::SeqCst),
            sources_started: c.sources_started.load(Ordering::SeqCst),
            sources_stopped: c.sources_stopped.load(Ordering::SeqCst),
        }
    }
}

impl AudioBackend for MockBackend {
    fn request_microphone(
        &self,
        _constraints: CaptureConstraints,
    ) -> BoxFuture<'static, Result<Box<dyn MicrophoneStream>, LiveError>> {
        let inner = self.inner.clone();
        inner.counters.mic_requests.fetch_add(1, Ordering::SeqCst);
        let policy = *inner.policy.lock().unwrap();
        async move {
            match policy {
                MicPolicy::Grant => {
                    inner.counters.mic_acquired.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(MockMic { inner }) as Box<dyn MicrophoneStream>)
                }
                MicPolicy::Deny => Err(LiveError::PermissionDenied),
                MicPolicy::NoDevice => Err(LiveError::DeviceUnavailable(
                    "no input device".to_string(),
                )),
                MicPolicy::Hang => futures_util::future::pending().await,
            }
        }
        .boxed()
    }

    fn create_context(&self, sample_rate: u32) -> Result<Box<dyn AudioContext>, LiveError> {
        self.inner
            .counters
            .contexts_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockContext {
            inner: self.inner.clone(),
            sample_rate,
        }))
    }
}

struct MockMic {
    inner: Arc<MockInner>,
}

impl MicrophoneStream for MockMic {
    fn device_id(&self) -> &str {
        "mock-mic"
    }

    fn stop(&mut self) {
        self.inner.counters.mic_stopped.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockContext {
    inner: Arc<MockInner>,
    sample_rate: u32,
}

impl AudioContext for MockContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        *self.inner.clock.lock().unwrap()
    }

    fn create_processor(
        &mut self,
        _stream: &mut dyn MicrophoneStream,
        _frame_size: usize,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn ProcessingNode>, LiveError> {
        self.inner
            .counters
            .processors_created
            .fetch_add(1, Ordering::SeqCst);
        *self.inner.frame_callback.lock().unwrap() = Some(on_frame);
        Ok(Box::new(MockNode {
            inner: self.inner.clone(),
        }))
    }

    fn start_source(
        &mut self,
        buffer: &PlaybackBuffer,
        when: f64,
    ) -> Result<Box<dyn SourceHandle>, LiveError> {
        self.inner
            .counters
            .sources_started
            .fetch_add(1, Ordering::SeqCst);
        self.inner
            .scheduled
            .lock()
            .unwrap()
            .push((when, buffer.duration()));
        Ok(Box::new(MockSource {
            inner: self.inner.clone(),
        }))
    }

    fn close(&mut self) {
        self.inner
            .counters
            .contexts_closed
            .fetch_add(1, Ordering::SeqCst);
    }
}

struct MockNode {
    inner: Arc<MockInner>,
}

impl ProcessingNode for MockNode {
    fn disconnect(&mut self) {
        self.inner
            .counters
            .processors_disconnected
            .fetch_add(1, Ordering::SeqCst);
        self.inner.frame_callback.lock().unwrap().take();
    }
}

struct MockSource {
    inner: Arc<MockInner>,
}

impl SourceHandle for MockSource {
    fn stop(&mut self) {
        self.inner
            .counters
            .sources_stopped
            .fetch_add(1, Ordering::SeqCst);
    }
}
