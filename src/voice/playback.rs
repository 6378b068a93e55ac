//! Gapless scheduling of synthesized speech on an output clock.
//!
//! Chunks arrive with uneven decode latency; the scheduler keeps a cursor
//! (`next_start_time`) on the output clock so that buffers play back-to-back
//! in enqueue order. Every scheduled buffer gets a [`PlaybackHandle`] that
//! stays in the active set until it ends naturally or is stopped.

use std::collections::HashSet;
use std::sync::Arc;

use super::codec::AudioBuffer;
use crate::error::VoiceError;

/// Reference to one scheduled output-audio unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackHandle(u64);

impl PlaybackHandle {
    pub fn id(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: u64) -> Self {
        Self(id)
    }
}

/// An output device with its own clock.
///
/// Implementations report natural completion of a handle out of band (the
/// device in this crate sends it on a channel); the owner then calls
/// [`PlaybackScheduler::on_ended`].
pub trait AudioOutput: Send {
    /// Current time on the output clock, in seconds.
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to start at `start_at` seconds on the output clock.
    fn play(
        &mut self,
        handle: PlaybackHandle,
        buffer: Arc<AudioBuffer>,
        start_at: f64,
    ) -> Result<(), VoiceError>;

    /// Stop a scheduled or playing unit. May fail for units that already ended.
    fn stop(&mut self, handle: PlaybackHandle) -> Result<(), VoiceError>;
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    next_start_time: f64,
    active: HashSet<PlaybackHandle>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            next_start_time: 0.0,
            active: HashSet::new(),
            next_id: 0,
        }
    }

    /// Schedule `buffer` right after everything already queued.
    ///
    /// Starts at `max(now, next_start_time)`; the cursor then advances by the
    /// buffer's duration. Returns the handle and the scheduled start time.
    pub fn enqueue(&mut self, buffer: AudioBuffer) -> Result<(PlaybackHandle, f64), VoiceError> {
        let start_at = self.output.current_time().max(self.next_start_time);
        let duration = buffer.duration();

        self.next_id += 1;
        let handle = PlaybackHandle(self.next_id);
        self.output.play(handle, Arc::new(buffer), start_at)?;

        self.next_start_time = start_at + duration;
        self.active.insert(handle);
        tracing::trace!(
            handle = handle.0,
            start_at,
            duration,
            active = self.active.len(),
            "Scheduled playback"
        );
        Ok((handle, start_at))
    }

    /// Natural completion. Unknown or already-stopped handles are ignored.
    pub fn on_ended(&mut self, handle: PlaybackHandle) -> bool {
        self.active.remove(&handle)
    }

    /// Stop everything in flight and rewind the cursor.
    ///
    /// Safe with nothing scheduled. Stop failures are swallowed.
    pub fn stop_all(&mut self) {
        if !self.active.is_empty() {
            tracing::debug!(count = self.active.len(), "Stopping all scheduled playback");
        }
        for handle in self.active.drain() {
            if let Err(e) = self.output.stop(handle) {
                tracing::debug!(handle = handle.0, error = %e, "Ignoring playback stop failure");
            }
        }
        self.next_start_time = 0.0;
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, handle: PlaybackHandle) -> bool {
        self.active.contains(&handle)
    }
}
