use super::transport::TransportLink;
use crate::audio::AudioFrame;
use crate::audio::pcm::frame_to_blob;
use crate::error::LiveError;
use std::collections::VecDeque;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Captured frames waiting for the connection.
///
/// Frames are only handed to the link once it is attached and the remote
/// side has acknowledged the handshake, whichever comes last. Delivery order
/// is capture order. When the queue is full the oldest frame is dropped.
pub struct OutboundQueue {
    pending: VecDeque<AudioFrame>,
    capacity: usize,
    link: Option<TransportLink>,
    open: bool,
    sent: u64,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
            link: None,
            open: false,
            sent: 0,
            dropped: 0,
        }
    }

    pub fn attach(&mut self, link: TransportLink) -> Result<(), LiveError> {
        if self.link.is_some() {
            warn!("[Outbound] Replacing an already attached link.");
        }
        self.link = Some(link);
        self.flush()
    }

    pub fn mark_open(&mut self) -> Result<(), LiveError> {
        self.open = true;
        self.flush()
    }

    pub fn is_ready(&self) -> bool {
        self.open && self.link.is_some()
    }

    pub fn push(&mut self, frame: AudioFrame) -> Result<(), LiveError> {
        if self.pending.len() >= self.capacity {
            if let Some(oldest) = self.pending.pop_front() {
                self.dropped += 1;
                warn!(
                    "[Outbound] Queue full ({} frames), dropped frame #{}.",
                    self.capacity, oldest.sequence
                );
            }
        }
        self.pending.push_back(frame);
        self.flush()
    }

    /// Sends as many pending frames as the link accepts right now.
    ///
    /// A full link leaves the remainder queued for the next flush; a closed
    /// link is a transport failure.
    pub fn flush(&mut self) -> Result<(), LiveError> {
        if !self.open {
            return Ok(());
        }
        let Some(link) = self.link.as_ref() else {
            return Ok(());
        };
        while let Some(frame) = self.pending.front() {
            match link.send_realtime_input(frame_to_blob(frame)) {
                Ok(()) => {
                    self.pending.pop_front();
                    self.sent += 1;
                }
                Err(TrySendError::Full(_)) => {
                    debug!(
                        "[Outbound] Link busy, {} frame(s) held back.",
                        self.pending.len()
                    );
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    return Err(LiveError::SendError);
                }
            }
        }
        Ok(())
    }

    /// Closes the link and forgets anything still queued.
    pub fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        if !self.pending.is_empty() {
            info!(
                "[Outbound] Discarding {} unsent frame(s).",
                self.pending.len()
            );
            self.pending.clear();
        }
        self.open = false;
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
