use super::ConnectionState;
use super::outbound::OutboundQueue;
use super::state::StatePublisher;
use super::transport::{Transport, TransportEvent};
use crate::audio::{
    ActivitySignal, AudioFrame, Capture, CapturePipeline, PlaybackScheduler, decode_inline_audio,
};
use crate::config::LiveConfig;
use crate::device::{AudioBackend, AudioContext, CaptureConstraints};
use crate::error::LiveError;
use crate::types::LiveServerMessage;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Everything a session task needs from its manager.
pub(crate) struct SessionContext {
    pub config: Arc<LiveConfig>,
    pub backend: Arc<dyn AudioBackend>,
    pub transport: Arc<dyn Transport>,
    pub state: Arc<StatePublisher>,
    pub activity: ActivitySignal,
    pub last_error: Arc<Mutex<Option<String>>>,
}

#[derive(Debug)]
enum Outcome {
    Disconnected,
    RemoteClosed,
    Failed(LiveError),
}

/// Resources owned by one connection attempt.
///
/// Every field is released by `teardown`, which runs once whatever the exit
/// path and again (as a no-op) on drop.
struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    capture: Option<Capture>,
    input_ctx: Option<Box<dyn AudioContext>>,
    output_ctx: Option<Box<dyn AudioContext>>,
    scheduler: PlaybackScheduler,
    outbound: OutboundQueue,
    activity: ActivitySignal,
    opened: bool,
    consecutive_decode_failures: u32,
    capture_dropped: Option<Arc<AtomicU64>>,
    torn_down: bool,
}

impl Session {
    fn new(config: &LiveConfig, activity: ActivitySignal) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            capture: None,
            input_ctx: None,
            output_ctx: None,
            scheduler: PlaybackScheduler::new(0.0),
            outbound: OutboundQueue::new(config.outbound_queue_capacity),
            activity,
            opened: false,
            consecutive_decode_failures: 0,
            capture_dropped: None,
            torn_down: false,
        }
    }

    fn open_contexts(&mut self, backend: &dyn AudioBackend, config: &LiveConfig) -> Result<(), LiveError> {
        self.input_ctx = Some(backend.create_context(config.input_sample_rate)?);
        let output = backend.create_context(config.output_sample_rate)?;
        self.scheduler = PlaybackScheduler::new(output.current_time());
        debug!(
            "[Session] Contexts ready: capture {}Hz, playback {}Hz.",
            config.input_sample_rate,
            output.sample_rate()
        );
        self.output_ctx = Some(output);
        Ok(())
    }

    /// Handshake acknowledged: start capture, then report `Connected`.
    fn on_open(
        &mut self,
        config: &LiveConfig,
        state: &StatePublisher,
        frames: &mut Option<mpsc::Sender<AudioFrame>>,
    ) -> Result<(), LiveError> {
        if self.opened {
            warn!("[Session] Duplicate open notification ignored.");
            return Ok(());
        }
        self.opened = true;

        let frames = frames.take().ok_or(LiveError::NotReady)?;
        let pipeline = CapturePipeline::new(
            frames,
            self.activity.clone(),
            config.input_sample_rate,
            config.volume_gain,
        );
        self.capture_dropped = Some(pipeline.dropped_counter());
        let input = self.input_ctx.as_mut().ok_or(LiveError::NotReady)?;
        let capture = self.capture.as_mut().ok_or(LiveError::NotReady)?;
        capture.start(input.as_mut(), config.frame_size, pipeline)?;

        self.outbound.mark_open()?;
        state.publish(ConnectionState::Connected);
        info!(
            "[Session] Connected after {} ms.",
            (Utc::now() - self.created_at).num_milliseconds()
        );
        Ok(())
    }

    fn on_message(&mut self, message: &LiveServerMessage, config: &LiveConfig) -> Result<(), LiveError> {
        if let Some(content) = &message.server_content {
            for blob in content.audio_blobs() {
                let output = self.output_ctx.as_mut().ok_or(LiveError::NotReady)?;
                match decode_inline_audio(blob, output.sample_rate()) {
                    Ok(buffer) => {
                        self.consecutive_decode_failures = 0;
                        self.scheduler.enqueue(output.as_mut(), buffer)?;
                    }
                    Err(e) => {
                        self.consecutive_decode_failures += 1;
                        warn!(
                            "[Session] Dropping undecodable audio ({}): {}",
                            blob.mime_type, e
                        );
                        let limit = config.max_consecutive_decode_failures;
                        if limit > 0 && self.consecutive_decode_failures >= limit {
                            return Err(LiveError::Transport(format!(
                                "{} consecutive audio payloads could not be decoded, last: {}",
                                self.consecutive_decode_failures, e
                            )));
                        }
                    }
                }
            }

            // Audio carried in the same message is dropped along with the rest.
            if content.interrupted {
                if let Some(output) = self.output_ctx.as_ref() {
                    let stopped = self.scheduler.interrupt(output.as_ref());
                    info!("[Session] Interrupted by user speech, {} source(s) cut.", stopped);
                }
            }

            if let Some(t) = &content.input_transcription {
                info!("[Session] User: {}", t.text);
            }
            if let Some(t) = &content.output_transcription {
                info!("[Session] Model: {}", t.text);
            }
            if content.turn_complete {
                debug!("[Session] Model turn complete.");
            }
        }
        if let Some(go_away) = &message.go_away {
            warn!(
                "[Session] Server will close the connection soon (time left: {}).",
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
        }
        if let Some(usage) = &message.usage_metadata {
            debug!("[Session] Usage: {:?}", usage);
        }
        Ok(())
    }

    fn on_tick(&mut self) -> Result<(), LiveError> {
        if let Some(output) = self.output_ctx.as_ref() {
            self.scheduler.prune_finished(output.current_time());
        }
        self.outbound.flush()
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut ctx) = self.input_ctx.take() {
            ctx.close();
        }
        let stopped = self.scheduler.clear();
        if let Some(mut ctx) = self.output_ctx.take() {
            ctx.close();
        }
        self.outbound.close();
        self.activity.reset();

        let dropped_capture = self
            .capture_dropped
            .as_ref()
            .map_or(0, |counter| counter.load(Ordering::Relaxed));
        info!(
            "[Session] Torn down: {} frame(s) sent, {} dropped in capture, {} dropped in queue, {} source(s) stopped.",
            self.outbound.sent(),
            dropped_capture,
            self.outbound.dropped(),
            stopped
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Drives one connection from `Connecting` to its final state.
///
/// Resources are released before the final state is published, so an
/// observer that sees `Disconnected` or `Error` can reconnect at once. A
/// failure is published as `Error` and then settles on `Disconnected`; the
/// cause stays readable through `last_error` until the next connect.
pub(crate) async fn run_session(ctx: SessionContext, mut shutdown: oneshot::Receiver<()>) {
    let mut session = Session::new(&ctx.config, ctx.activity.clone());
    let span = info_span!("live_session", session_id = %session.id);

    let outcome = drive(&ctx, &mut session, &mut shutdown)
        .instrument(span.clone())
        .await;

    let _entered = span.enter();
    session.teardown();
    match outcome {
        Outcome::Disconnected => {
            info!("[Session] Disconnected by request.");
            ctx.state.publish(ConnectionState::Disconnected);
        }
        Outcome::RemoteClosed => {
            info!("[Session] Connection closed by server.");
            ctx.state.publish(ConnectionState::Disconnected);
        }
        Outcome::Failed(e) => {
            error!("[Session] Failed: {}", e);
            if let Ok(mut last) = ctx.last_error.lock() {
                *last = Some(e.to_string());
            }
            ctx.state
                .publish_all(&[ConnectionState::Error, ConnectionState::Disconnected]);
        }
    }
}

async fn drive(
    ctx: &SessionContext,
    session: &mut Session,
    shutdown: &mut oneshot::Receiver<()>,
) -> Outcome {
    let config = ctx.config.as_ref();
    info!("[Session] Starting (model {}).", config.model);

    if let Err(e) = session.open_contexts(ctx.backend.as_ref(), config) {
        return Outcome::Failed(e);
    }

    let acquire = Capture::acquire(
        ctx.backend.as_ref(),
        CaptureConstraints::mono(config.input_sample_rate),
    );
    tokio::select! {
        biased;
        _ = &mut *shutdown => return Outcome::Disconnected,
        acquired = acquire => match acquired {
            Ok(capture) => session.capture = Some(capture),
            Err(e) => return Outcome::Failed(e),
        },
    }

    let (events_tx, mut events_rx) = mpsc::channel(config.transport_channel_capacity);
    let mut open_link = ctx.transport.open(config.setup_message(), events_tx);
    let mut link_pending = true;

    let (frames_tx, mut frames_rx) = mpsc::channel(config.capture_channel_capacity);
    let mut frames_tx = Some(frames_tx);
    let mut frames_open = true;

    let handshake = tokio::time::sleep(config.handshake_timeout());
    tokio::pin!(handshake);

    let mut prune = tokio::time::interval(config.prune_interval());
    prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = &mut *shutdown => return Outcome::Disconnected,
            linked = &mut open_link, if link_pending => {
                link_pending = false;
                match linked {
                    Ok(link) => {
                        debug!("[Session] Transport link established.");
                        if let Err(e) = session.outbound.attach(link) {
                            return Outcome::Failed(e);
                        }
                    }
                    Err(e) => return Outcome::Failed(e),
                }
            }
            _ = &mut handshake, if !session.opened => {
                return Outcome::Failed(LiveError::HandshakeTimeout(config.handshake_timeout()));
            }
            event = events_rx.recv() => match event {
                Some(TransportEvent::Open) => {
                    if let Err(e) = session.on_open(config, &ctx.state, &mut frames_tx) {
                        return Outcome::Failed(e);
                    }
                }
                Some(TransportEvent::Message(message)) => {
                    if let Err(e) = session.on_message(&message, config) {
                        return Outcome::Failed(e);
                    }
                }
                Some(TransportEvent::Close) => return Outcome::RemoteClosed,
                Some(TransportEvent::Error(cause)) => {
                    return Outcome::Failed(LiveError::Transport(cause));
                }
                None if link_pending => {
                    return Outcome::Failed(LiveError::Transport(
                        "event channel closed before the connection opened".to_string(),
                    ));
                }
                None => return Outcome::RemoteClosed,
            },
            frame = frames_rx.recv(), if frames_open => match frame {
                Some(frame) => {
                    if let Err(e) = session.outbound.push(frame) {
                        return Outcome::Failed(e);
                    }
                }
                None => {
                    warn!("[Session] Capture stopped delivering frames.");
                    frames_open = false;
                }
            },
            _ = prune.tick() => {
                if let Err(e) = session.on_tick() {
                    return Outcome::Failed(e);
                }
            }
        }
    }
}
