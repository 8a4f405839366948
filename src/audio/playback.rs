use super::PlaybackBuffer;
use crate::device::{AudioContext, SourceHandle};
use crate::error::LiveError;
use tracing::{debug, trace};

struct ActiveSource {
    handle: Box<dyn SourceHandle>,
    start: f64,
    end: f64,
}

/// Lays inbound buffers back to back on the playback clock.
///
/// Each buffer starts at `max(next_playback_time, now)`: gapless while the
/// network keeps ahead of playback, immediate when it falls behind. The
/// scheduler is the only writer of `next_playback_time` and of the active
/// source set.
pub struct PlaybackScheduler {
    next_playback_time: f64,
    active: Vec<ActiveSource>,
}

impl PlaybackScheduler {
    pub fn new(now: f64) -> Self {
        Self {
            next_playback_time: now,
            active: Vec::new(),
        }
    }

    pub fn next_playback_time(&self) -> f64 {
        self.next_playback_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Schedules `buffer` and returns its start time on the context clock.
    pub fn enqueue(
        &mut self,
        ctx: &mut dyn AudioContext,
        mut buffer: PlaybackBuffer,
    ) -> Result<f64, LiveError> {
        let now = ctx.current_time();
        self.prune_finished(now);

        let start = self.next_playback_time.max(now);
        let duration = buffer.duration();
        buffer.start_time = Some(start);
        let handle = ctx.start_source(&buffer, start)?;

        self.next_playback_time = start + duration;
        self.active.push(ActiveSource {
            handle,
            start,
            end: start + duration,
        });
        trace!(
            "[Playback] Scheduled {:.3}s at {:.3} (now {:.3}); next slot {:.3}, {} active.",
            duration,
            start,
            now,
            self.next_playback_time,
            self.active.len()
        );
        Ok(start)
    }

    /// Forgets sources that have played to the end by `now`.
    pub fn prune_finished(&mut self, now: f64) -> usize {
        let before = self.active.len();
        self.active.retain(|source| source.end > now);
        before - self.active.len()
    }

    /// Barge-in: hard-stops everything scheduled so far and restarts the
    /// timeline at the current clock position.
    pub fn interrupt(&mut self, ctx: &dyn AudioContext) -> usize {
        let stopped = self.stop_all();
        self.next_playback_time = ctx.current_time();
        debug!(
            "[Playback] Interrupted: stopped {} source(s), timeline reset to {:.3}.",
            stopped, self.next_playback_time
        );
        stopped
    }

    /// Teardown variant of `interrupt` for when the context may already be gone.
    pub fn clear(&mut self) -> usize {
        let stopped = self.stop_all();
        self.next_playback_time = 0.0;
        stopped
    }

    fn stop_all(&mut self) -> usize {
        let count = self.active.len();
        for mut source in self.active.drain(..) {
            trace!(
                "[Playback] Stopping source {:.3}..{:.3}.",
                source.start, source.end
            );
            source.handle.stop();
        }
        count
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}
