//! Host audio through cpal.
//!
//! `cpal::Stream` is not `Send`, so every stream is built, played and dropped
//! on its own thread. The context hands that thread a callback and keeps only
//! a stop channel.
//!
//! Capture runs at whatever rate the input device supports and is converted
//! to the context rate in the callback. Playback sums every scheduled buffer
//! into the output callback. The context clock is the number of frames that
//! callback has rendered.
//!
//! cpal cannot tell a denied permission from a silent device, so
//! `request_microphone` only ever fails with `DeviceUnavailable`.

use super::{
    AudioBackend, AudioContext, CaptureConstraints, FrameCallback, MicrophoneStream,
    ProcessingNode, SourceHandle,
};
use crate::audio::PlaybackBuffer;
use crate::error::LiveError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, SupportedStreamConfig, SupportedStreamConfigRange};
use crossbeam_channel::{Sender, bounded};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

fn device_error(e: impl std::fmt::Display) -> LiveError {
    LiveError::DeviceUnavailable(e.to_string())
}

fn lock(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    mixer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Default host devices, or devices picked by name.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input_device(mut self, name: impl Into<String>) -> Self {
        self.input_device = Some(name.into());
        self
    }

    pub fn with_output_device(mut self, name: impl Into<String>) -> Self {
        self.output_device = Some(name.into());
        self
    }
}

impl AudioBackend for CpalBackend {
    fn request_microphone(
        &self,
        constraints: CaptureConstraints,
    ) -> BoxFuture<'static, Result<Box<dyn MicrophoneStream>, LiveError>> {
        let preferred = self.input_device.clone();
        async move {
            tokio::task::spawn_blocking(move || open_microphone(preferred.as_deref(), constraints))
                .await
                .map_err(device_error)?
        }
        .boxed()
    }

    fn create_context(&self, sample_rate: u32) -> Result<Box<dyn AudioContext>, LiveError> {
        Ok(Box::new(CpalContext {
            sample_rate,
            output_device: self.output_device.clone(),
            output: None,
            next_voice: 0,
        }))
    }
}

fn input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, LiveError> {
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| LiveError::DeviceUnavailable("no input device".to_string())),
        Some(name) => host
            .input_devices()
            .map_err(device_error)?
            .find(|device| device.name().is_ok_and(|n| n == name))
            .ok_or_else(|| LiveError::DeviceUnavailable(format!("input device '{}' not found", name))),
    }
}

fn output_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device, LiveError> {
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| LiveError::DeviceUnavailable("no output device".to_string())),
        Some(name) => host
            .output_devices()
            .map_err(device_error)?
            .find(|device| device.name().is_ok_and(|n| n == name))
            .ok_or_else(|| LiveError::DeviceUnavailable(format!("output device '{}' not found", name))),
    }
}

fn open_microphone(
    preferred: Option<&str>,
    constraints: CaptureConstraints,
) -> Result<Box<dyn MicrophoneStream>, LiveError> {
    let host = cpal::default_host();
    let device = input_device(&host, preferred)?;
    let name = device.name().map_err(device_error)?;
    let ranges: Vec<_> = device
        .supported_input_configs()
        .map_err(device_error)?
        .collect();
    let config = choose_config(&ranges, constraints.sample_rate, constraints.channel_count)
        .ok_or_else(|| LiveError::DeviceUnavailable(format!("'{}' has no usable input format", name)))?;
    info!(
        "[CpalInput] Using input '{}' ({} Hz, {} ch, {:?}).",
        name,
        config.sample_rate().0,
        config.channels(),
        config.sample_format()
    );
    if constraints.echo_cancellation || constraints.noise_suppression {
        debug!("[CpalInput] Echo cancellation and noise suppression are left to the host.");
    }
    Ok(Box::new(CpalMicrophone {
        device_name: name,
        released: false,
    }))
}

fn is_usable(format: SampleFormat) -> bool {
    matches!(format, SampleFormat::F32 | SampleFormat::I16)
}

/// Closest supported rate for exactly `channels`, preferring `f32` on a tie.
fn find_supported_config(
    ranges: &[SupportedStreamConfigRange],
    target_rate: u32,
    channels: u16,
) -> Option<SupportedStreamConfig> {
    let mut best: Option<(u32, SupportedStreamConfig)> = None;
    for range in ranges
        .iter()
        .filter(|r| r.channels() == channels && is_usable(r.sample_format()))
    {
        let rate = target_rate.clamp(range.min_sample_rate().0, range.max_sample_rate().0);
        let diff = rate.abs_diff(target_rate);
        let better = match &best {
            None => true,
            Some((best_diff, current)) => {
                diff < *best_diff
                    || (diff == *best_diff
                        && range.sample_format() == SampleFormat::F32
                        && current.sample_format() != SampleFormat::F32)
            }
        };
        if better {
            best = Some((diff, range.clone().with_sample_rate(SampleRate(rate))));
        }
    }
    best.map(|(_, config)| config)
}

/// Tries the requested channel count, then mono, then stereo, then anything usable.
fn choose_config(
    ranges: &[SupportedStreamConfigRange],
    target_rate: u32,
    channels: u16,
) -> Option<SupportedStreamConfig> {
    [channels, 1, 2]
        .into_iter()
        .find_map(|ch| find_supported_config(ranges, target_rate, ch))
        .or_else(|| {
            warn!(
                "[Cpal] No mono or stereo config near {} Hz, taking the first usable one.",
                target_rate
            );
            ranges
                .iter()
                .find(|r| is_usable(r.sample_format()))
                .map(|r| r.clone().with_max_sample_rate())
        })
}

/// A cpal stream parked on its own thread until `stop`.
struct StreamThread {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Runs `build` on a new thread and returns once the stream is playing
    /// or has failed to start.
    fn spawn<F>(name: &str, build: F) -> Result<Self, LiveError>
    where
        F: FnOnce() -> Result<cpal::Stream, LiveError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = bounded::<Result<(), LiveError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build().and_then(|s| s.play().map(|_| s).map_err(device_error)) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Returns once the sender is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(device_error)?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(LiveError::DeviceUnavailable(format!(
                    "{} exited before the stream started",
                    name
                )))
            }
        }
    }

    fn stop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("[Cpal] Audio thread panicked.");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CpalMicrophone {
    device_name: String,
    released: bool,
}

impl MicrophoneStream for CpalMicrophone {
    fn device_id(&self) -> &str {
        &self.device_name
    }

    fn stop(&mut self) {
        if !self.released {
            self.released = true;
            debug!("[CpalInput] Released '{}'.", self.device_name);
        }
    }
}

/// Streaming linear interpolation from one rate to another.
struct LinearConverter {
    /// Input samples advanced per output sample.
    step: f64,
    position: f64,
    previous: Option<f32>,
}

impl LinearConverter {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: f64::from(from_rate) / f64::from(to_rate),
            position: 0.0,
            previous: None,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    fn push(&mut self, sample: f32, mut emit: impl FnMut(f32)) {
        if self.is_passthrough() {
            emit(sample);
            return;
        }
        let Some(previous) = self.previous.replace(sample) else {
            return;
        };
        while self.position < 1.0 {
            let t = self.position as f32;
            emit(previous + (sample - previous) * t);
            self.position += self.step;
        }
        self.position -= 1.0;
    }
}

/// Downmixes interleaved device samples, converts them to the context rate
/// and hands out frames of exactly `frame_size`.
struct FrameAssembler {
    channels: usize,
    converter: LinearConverter,
    frame: Vec<f32>,
    frame_size: usize,
    on_frame: FrameCallback,
}

impl FrameAssembler {
    fn new(
        channels: u16,
        device_rate: u32,
        context_rate: u32,
        frame_size: usize,
        on_frame: FrameCallback,
    ) -> Self {
        Self {
            channels: usize::from(channels.max(1)),
            converter: LinearConverter::new(device_rate, context_rate),
            frame: Vec::with_capacity(frame_size),
            frame_size,
            on_frame,
        }
    }

    fn push_interleaved(&mut self, samples: impl Iterator<Item = f32>) {
        let mut sum = 0.0;
        let mut count = 0;
        for sample in samples {
            sum += sample;
            count += 1;
            if count == self.channels {
                self.push_mono(sum / count as f32);
                sum = 0.0;
                count = 0;
            }
        }
    }

    fn push_mono(&mut self, sample: f32) {
        let Self {
            converter,
            frame,
            frame_size,
            on_frame,
            ..
        } = self;
        converter.push(sample, |converted| {
            frame.push(converted);
            if frame.len() == *frame_size {
                on_frame(frame.as_slice());
                frame.clear();
            }
        });
    }
}

fn build_input_stream(
    device: &cpal::Device,
    supported: &SupportedStreamConfig,
    assembler: FrameAssembler,
) -> Result<cpal::Stream, LiveError> {
    let config = supported.config();
    let on_error = |err: cpal::StreamError| error!("[CpalInput] Stream error: {}", err);
    let mut assembler = assembler;
    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                assembler.push_interleaved(data.iter().copied())
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                assembler.push_interleaved(data.iter().map(|&s| f32::from(s) / 32768.0))
            },
            on_error,
            None,
        ),
        other => {
            return Err(LiveError::DeviceUnavailable(format!(
                "unsupported input sample format {:?}",
                other
            )));
        }
    };
    stream.map_err(device_error)
}

struct CpalInputNode {
    thread: StreamThread,
}

impl ProcessingNode for CpalInputNode {
    fn disconnect(&mut self) {
        self.thread.stop();
    }
}

struct Voice {
    id: u64,
    start: f64,
    sample_rate: u32,
    samples: Vec<f32>,
}

impl Voice {
    fn end(&self) -> f64 {
        self.start + self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    fn sample_at(&self, time: f64) -> f32 {
        let position = (time - self.start) * f64::from(self.sample_rate);
        if position < 0.0 {
            return 0.0;
        }
        let index = position as usize;
        match (self.samples.get(index), self.samples.get(index + 1)) {
            (Some(&a), Some(&b)) => a + (b - a) * position.fract() as f32,
            (Some(&a), None) => a,
            _ => 0.0,
        }
    }
}

/// Sums scheduled buffers into the output stream and owns the playback clock.
struct Mixer {
    device_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            frames_rendered: 0,
            voices: Vec::new(),
        }
    }

    fn now(&self) -> f64 {
        self.frames_rendered as f64 / f64::from(self.device_rate)
    }

    fn render(&mut self, out: &mut [f32]) {
        let rate = f64::from(self.device_rate);
        for (i, slot) in out.iter_mut().enumerate() {
            let time = (self.frames_rendered + i as u64) as f64 / rate;
            let mixed: f32 = self.voices.iter().map(|v| v.sample_at(time)).sum();
            *slot = mixed.clamp(-1.0, 1.0);
        }
        self.frames_rendered += out.len() as u64;
        let now = self.now();
        self.voices.retain(|v| v.end() > now);
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }
}

fn render_interleaved<T: Copy>(
    mixer: &Mutex<Mixer>,
    scratch: &mut Vec<f32>,
    out: &mut [T],
    channels: usize,
    convert: impl Fn(f32) -> T,
) {
    scratch.resize(out.len() / channels, 0.0);
    lock(mixer).render(scratch);
    for (frame, &sample) in out.chunks_mut(channels).zip(scratch.iter()) {
        frame.fill(convert(sample));
    }
}

fn build_output_stream(
    device: &cpal::Device,
    supported: &SupportedStreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<cpal::Stream, LiveError> {
    let config = supported.config();
    let channels = usize::from(config.channels.max(1));
    let on_error = |err: cpal::StreamError| error!("[CpalOutput] Stream error: {}", err);
    let mut scratch = Vec::new();
    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render_interleaved(&mixer, &mut scratch, data, channels, |s| s)
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                render_interleaved(&mixer, &mut scratch, data, channels, |s| {
                    (s * f32::from(i16::MAX)) as i16
                })
            },
            on_error,
            None,
        ),
        other => {
            return Err(LiveError::DeviceUnavailable(format!(
                "unsupported output sample format {:?}",
                other
            )));
        }
    };
    stream.map_err(device_error)
}

struct OutputStream {
    mixer: Arc<Mutex<Mixer>>,
    thread: StreamThread,
}

struct CpalContext {
    sample_rate: u32,
    output_device: Option<String>,
    /// Opened by the first `start_source`; a capture-only context never plays.
    output: Option<OutputStream>,
    next_voice: u64,
}

impl CpalContext {
    fn ensure_output(&mut self) -> Result<Arc<Mutex<Mixer>>, LiveError> {
        if let Some(output) = &self.output {
            return Ok(output.mixer.clone());
        }

        let host = cpal::default_host();
        let device = output_device(&host, self.output_device.as_deref())?;
        let name = device.name().map_err(device_error)?;
        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(device_error)?
            .collect();
        let supported = choose_config(&ranges, self.sample_rate, 1).ok_or_else(|| {
            LiveError::DeviceUnavailable(format!("'{}' has no usable output format", name))
        })?;
        info!(
            "[CpalOutput] Using output '{}' ({} Hz, {} ch, {:?}).",
            name,
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format()
        );

        let mixer = Arc::new(Mutex::new(Mixer::new(supported.sample_rate().0)));
        let stream_mixer = mixer.clone();
        let preferred = self.output_device.clone();
        let thread = StreamThread::spawn("cpal-output", move || {
            let host = cpal::default_host();
            let device = output_device(&host, preferred.as_deref())?;
            build_output_stream(&device, &supported, stream_mixer)
        })?;
        self.output = Some(OutputStream {
            mixer: mixer.clone(),
            thread,
        });
        Ok(mixer)
    }
}

impl AudioContext for CpalContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.output
            .as_ref()
            .map_or(0.0, |output| lock(&output.mixer).now())
    }

    fn create_processor(
        &mut self,
        stream: &mut dyn MicrophoneStream,
        frame_size: usize,
        on_frame: FrameCallback,
    ) -> Result<Box<dyn ProcessingNode>, LiveError> {
        let device_name = stream.device_id().to_string();
        let context_rate = self.sample_rate;
        let thread = StreamThread::spawn("cpal-input", move || {
            let host = cpal::default_host();
            let device = input_device(&host, Some(&device_name))?;
            let ranges: Vec<_> = device
                .supported_input_configs()
                .map_err(device_error)?
                .collect();
            let supported = choose_config(&ranges, context_rate, 1).ok_or_else(|| {
                LiveError::DeviceUnavailable(format!("'{}' has no usable input format", device_name))
            })?;
            let device_rate = supported.sample_rate().0;
            if device_rate != context_rate {
                info!(
                    "[CpalInput] Converting {} Hz capture to {} Hz.",
                    device_rate, context_rate
                );
            }
            let assembler = FrameAssembler::new(
                supported.channels(),
                device_rate,
                context_rate,
                frame_size,
                on_frame,
            );
            build_input_stream(&device, &supported, assembler)
        })?;
        Ok(Box::new(CpalInputNode { thread }))
    }

    fn start_source(
        &mut self,
        buffer: &PlaybackBuffer,
        when: f64,
    ) -> Result<Box<dyn SourceHandle>, LiveError> {
        let mixer = self.ensure_output()?;
        let id = self.next_voice;
        self.next_voice += 1;
        lock(&mixer).voices.push(Voice {
            id,
            start: when,
            sample_rate: buffer.sample_rate,
            samples: buffer.samples.clone(),
        });
        Ok(Box::new(MixerSource { mixer, id }))
    }

    fn close(&mut self) {
        if let Some(mut output) = self.output.take() {
            output.thread.stop();
            debug!("[CpalOutput] Output stream closed.");
        }
    }
}

struct MixerSource {
    mixer: Arc<Mutex<Mixer>>,
    id: u64,
}

impl SourceHandle for MixerSource {
    fn stop(&mut self) {
        lock(&self.mixer).remove(self.id);
    }
}
