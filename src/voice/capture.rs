//! Microphone capture: fixed-size PCM frames for the live connection.
//!
//! An [`InputSource`] pushes mono float samples at whatever cadence the
//! platform delivers them. [`CapturePipeline`] regroups them into frames of
//! `frame_size` samples, quantizes each through the codec and hands it to
//! the frame-ready callback. The callback runs on the source's thread and
//! must not block.

use async_trait::async_trait;

use super::codec::AudioFrame;
use crate::error::VoiceError;

/// Default samples per outbound frame (256 ms at 16 kHz).
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Receives raw mono samples from an input source.
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send>;

/// A running (or startable) microphone stream.
pub trait InputSource: Send {
    /// Rate of the samples delivered to the sink.
    fn sample_rate(&self) -> u32;

    /// Begin delivering samples to `sink`.
    fn start(&mut self, sink: SampleSink) -> Result<(), VoiceError>;

    /// Stop delivering and release the device. Must be idempotent.
    fn stop(&mut self) -> Result<(), VoiceError>;
}

/// Grants access to the microphone.
#[async_trait]
pub trait MicrophoneAccess: Send + Sync {
    /// Fails with [`VoiceError::PermissionDenied`] when access is refused.
    async fn acquire(&self) -> Result<Box<dyn InputSource>, VoiceError>;
}

/// Regroups arbitrarily sized sample blocks into fixed frames.
struct FrameAssembler {
    pending: Vec<f32>,
    frame_size: usize,
    sample_rate: u32,
}

impl FrameAssembler {
    fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            pending: Vec::with_capacity(frame_size),
            frame_size,
            sample_rate,
        }
    }

    fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                match AudioFrame::from_float(&self.pending, self.sample_rate, 1) {
                    Ok(frame) => emit(frame),
                    Err(e) => tracing::warn!(error = %e, "Dropping unencodable capture frame"),
                }
                self.pending.clear();
            }
        }
    }
}

pub struct CapturePipeline {
    source: Box<dyn InputSource>,
    frame_size: usize,
    running: bool,
}

impl CapturePipeline {
    pub fn new(source: Box<dyn InputSource>, frame_size: usize) -> Self {
        Self {
            source,
            frame_size: frame_size.max(1),
            running: false,
        }
    }

    /// Start capturing; `on_frame` is invoked once per completed frame.
    pub fn start<F>(&mut self, mut on_frame: F) -> Result<(), VoiceError>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        if self.running {
            return Ok(());
        }
        let mut assembler = FrameAssembler::new(self.frame_size, self.source.sample_rate());
        self.source.start(Box::new(move |samples: &[f32]| {
            assembler.push(samples, &mut on_frame);
        }))?;
        self.running = true;
        tracing::info!(
            sample_rate = self.source.sample_rate(),
            frame_size = self.frame_size,
            "Microphone capture started"
        );
        Ok(())
    }

    /// Stop capturing and release the input source. Idempotent.
    pub fn stop(&mut self) -> Result<(), VoiceError> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.source.stop()?;
        tracing::info!("Microphone capture stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "Failed to stop capture on drop");
        }
    }
}
