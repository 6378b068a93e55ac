//! cpal-backed microphone and speaker.
//!
//! cpal streams are `!Send`, so each one lives on a dedicated thread that
//! builds it, plays it and drops it when told to stop. The handles held by
//! the session only carry the stop signal. Opening a device blocks, so the
//! microphone is opened on a `spawn_blocking` worker during acquisition.
//!
//! The microphone is downmixed to mono and resampled to the wire rate
//! before it reaches the capture pipeline. The speaker mixes scheduled
//! buffers into the device callback and derives its clock from the number
//! of frames written so far.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use parking_lot::Mutex;
use rubato::{
    Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::capture::{InputSource, MicrophoneAccess, SampleSink};
use super::codec::AudioBuffer;
use super::playback::{AudioOutput, PlaybackHandle};
use crate::error::VoiceError;

/// Input frames fed to the streaming resampler per call.
const RESAMPLE_CHUNK: usize = 1024;

fn sinc_params() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    }
}

// ── Resampling ─────────────────────────────────────────────────────

/// Mono resampler for a continuous stream; keeps leftovers between calls.
struct StreamResampler {
    resampler: SincFixedIn<f32>,
    pending: Vec<f32>,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32) -> Result<Self, VoiceError> {
        let resampler = SincFixedIn::<f32>::new(
            f64::from(to_rate) / f64::from(from_rate),
            2.0,
            sinc_params(),
            RESAMPLE_CHUNK,
            1,
        )
        .map_err(|e| VoiceError::Device(format!("resampler init failed: {e}")))?;

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(RESAMPLE_CHUNK * 2),
        })
    }

    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        self.pending.extend_from_slice(input);
        while self.pending.len() >= RESAMPLE_CHUNK {
            let chunk: Vec<f32> = self.pending.drain(..RESAMPLE_CHUNK).collect();
            let waves_in = vec![chunk];
            match self.resampler.process(&waves_in, None) {
                Ok(waves_out) => out.extend_from_slice(&waves_out[0]),
                Err(e) => tracing::warn!(error = %e, "Microphone resample failed, dropping block"),
            }
        }
    }
}

/// Resample one complete mono block, flushing the filter delay.
fn resample_block(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, VoiceError> {
    if from_rate == to_rate || input.is_empty() {
        return Ok(input.to_vec());
    }
    let map_err = |e: rubato::ResampleError| VoiceError::Device(format!("resample failed: {e}"));

    let mut resampler = SincFixedIn::<f32>::new(
        f64::from(to_rate) / f64::from(from_rate),
        2.0,
        sinc_params(),
        input.len(),
        1,
    )
    .map_err(|e| VoiceError::Device(format!("resampler init failed: {e}")))?;

    let delay = resampler.output_delay();
    let waves_in = vec![input.to_vec()];
    let mut output = resampler
        .process(&waves_in, None)
        .map_err(map_err)?
        .remove(0);
    let tail = resampler
        .process_partial(None::<&[Vec<f32>]>, None)
        .map_err(map_err)?;
    output.extend_from_slice(&tail[0]);

    let expected = (input.len() as u64 * u64::from(to_rate) / u64::from(from_rate)) as usize;
    Ok(output.into_iter().skip(delay).take(expected).collect())
}

// ── Stream threads ─────────────────────────────────────────────────

/// A stream running on its own thread; dropping the handle tells the
/// thread to drop the stream and exit. Nothing waits for it to finish.
struct StreamThread {
    stop_tx: std_mpsc::Sender<()>,
}

impl StreamThread {
    /// Run `build` on a new thread and wait until the stream is playing.
    ///
    /// Blocks the caller; run it from `spawn_blocking` or before the
    /// runtime's event loop starts.
    fn spawn<S, B>(name: &str, build: B) -> Result<Self, VoiceError>
    where
        S: StreamTrait + 'static,
        B: FnOnce() -> Result<S, VoiceError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), VoiceError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build().and_then(|stream| {
                    stream
                        .play()
                        .map_err(|e| VoiceError::Device(format!("failed to start stream: {e}")))?;
                    Ok(stream)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Returns on an explicit stop or when the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| VoiceError::Device(format!("failed to spawn audio thread: {e}")))?;

        match ready_rx.recv() {
            Ok(result) => result.map(|()| Self { stop_tx }),
            Err(_) => Err(VoiceError::Device("audio thread exited during startup".into())),
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        if self.stop_tx.send(()).is_err() {
            tracing::debug!("Audio thread already gone");
        }
    }
}

// ── Microphone ─────────────────────────────────────────────────────

/// Where the device callback delivers samples once capture has started.
type SinkSlot = Arc<Mutex<Option<SampleSink>>>;

/// Default input device of the default host.
#[derive(Debug, Clone)]
pub struct CpalMicrophone {
    target_rate: u32,
}

impl CpalMicrophone {
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }
}

#[async_trait]
impl MicrophoneAccess for CpalMicrophone {
    /// Opens the device stream on a blocking worker; the returned source is
    /// already running and only needs a sink.
    async fn acquire(&self) -> Result<Box<dyn InputSource>, VoiceError> {
        let target_rate = self.target_rate;
        let source = tokio::task::spawn_blocking(move || open_microphone(target_rate))
            .await
            .map_err(|e| VoiceError::Device(format!("microphone task failed: {e}")))??;
        Ok(Box::new(source))
    }
}

fn open_microphone(target_rate: u32) -> Result<CpalInputSource, VoiceError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::PermissionDenied("no microphone available".into()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| VoiceError::PermissionDenied(format!("microphone unavailable: {e}")))?;

    tracing::info!(
        device = %device.name().unwrap_or_else(|_| "unknown".into()),
        device_rate = supported.sample_rate().0,
        channels = supported.channels(),
        format = ?supported.sample_format(),
        "Microphone acquired"
    );

    let sink: SinkSlot = Arc::new(Mutex::new(None));
    let stream_sink = sink.clone();
    let stream = StreamThread::spawn("posso-mic", move || {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::PermissionDenied("no microphone available".into()))?;
        let config: StreamConfig = supported.clone().into();

        match supported.sample_format() {
            SampleFormat::F32 => build_input::<f32>(&device, &config, target_rate, stream_sink),
            SampleFormat::I16 => build_input::<i16>(&device, &config, target_rate, stream_sink),
            SampleFormat::U16 => build_input::<u16>(&device, &config, target_rate, stream_sink),
            SampleFormat::I32 => build_input::<i32>(&device, &config, target_rate, stream_sink),
            other => Err(VoiceError::Device(format!(
                "unsupported microphone sample format {other:?}"
            ))),
        }
    })?;

    Ok(CpalInputSource {
        target_rate,
        sink,
        stream: Some(stream),
    })
}

pub struct CpalInputSource {
    target_rate: u32,
    sink: SinkSlot,
    stream: Option<StreamThread>,
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    target_rate: u32,
    sink: SinkSlot,
) -> Result<cpal::Stream, VoiceError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels);
    let device_rate = config.sample_rate.0;
    let mut resampler = if device_rate == target_rate {
        None
    } else {
        Some(StreamResampler::new(device_rate, target_rate)?)
    };
    let mut mono = Vec::new();
    let mut resampled = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                // Convert to mono by averaging
                for frame in data.chunks(channels) {
                    let sum: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum();
                    mono.push(sum / frame.len() as f32);
                }
                let samples: &[f32] = match resampler.as_mut() {
                    Some(resampler) => {
                        resampled.clear();
                        resampler.process(&mono, &mut resampled);
                        &resampled
                    }
                    None => &mono,
                };
                if samples.is_empty() {
                    return;
                }
                if let Some(sink) = sink.lock().as_mut() {
                    sink(samples);
                }
            },
            |err| tracing::error!(error = %err, "Microphone stream error"),
            None,
        )
        .map_err(|e| VoiceError::Device(format!("failed to open microphone stream: {e}")))
}

impl InputSource for CpalInputSource {
    fn sample_rate(&self) -> u32 {
        self.target_rate
    }

    fn start(&mut self, sink: SampleSink) -> Result<(), VoiceError> {
        if self.stream.is_none() {
            return Err(VoiceError::Device("microphone already released".into()));
        }
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    /// Detaches the sink and signals the stream thread; never waits on it.
    fn stop(&mut self) -> Result<(), VoiceError> {
        self.sink.lock().take();
        self.stream.take();
        Ok(())
    }
}

// ── Speaker ────────────────────────────────────────────────────────

struct Voice {
    handle: PlaybackHandle,
    samples: Vec<f32>,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Scheduled buffers and the frame clock, shared with the device callback.
struct Mixer {
    frames_written: u64,
    voices: Vec<Voice>,
    ended_tx: mpsc::UnboundedSender<PlaybackHandle>,
}

impl Mixer {
    /// Mix the next `frames` output frames into `out` (interleaved).
    fn render<T>(&mut self, out: &mut [T], channels: usize)
    where
        T: SizedSample + FromSample<f32>,
    {
        let base = self.frames_written;
        for (i, frame) in out.chunks_mut(channels).enumerate() {
            let now = base + i as u64;
            let mut value = 0.0f32;
            for voice in &self.voices {
                if now >= voice.start_frame && now < voice.end_frame() {
                    value += voice.samples[(now - voice.start_frame) as usize];
                }
            }
            let sample = T::from_sample(value.clamp(-1.0, 1.0));
            for slot in frame.iter_mut() {
                *slot = sample;
            }
        }
        self.frames_written += (out.len() / channels) as u64;

        let now = self.frames_written;
        let ended_tx = &self.ended_tx;
        self.voices.retain(|voice| {
            if voice.end_frame() <= now {
                let _ = ended_tx.send(voice.handle);
                false
            } else {
                true
            }
        });
    }
}

/// Default output device of the default host.
pub struct CpalSpeaker {
    mixer: Arc<Mutex<Mixer>>,
    device_rate: u32,
    _stream: StreamThread,
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<cpal::Stream, VoiceError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mixer.lock().render(data, channels);
            },
            |err| tracing::error!(error = %err, "Speaker stream error"),
            None,
        )
        .map_err(|e| VoiceError::Device(format!("failed to open speaker stream: {e}")))
}

impl CpalSpeaker {
    /// Open the default speaker. Natural completions arrive on the receiver.
    ///
    /// Blocks until the stream is playing.
    pub fn open() -> Result<(Self, mpsc::UnboundedReceiver<PlaybackHandle>), VoiceError> {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let mixer = Arc::new(Mutex::new(Mixer {
            frames_written: 0,
            voices: Vec::new(),
            ended_tx,
        }));

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| VoiceError::Device("no speaker available".into()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| VoiceError::Device(e.to_string()))?;
        let device_rate = supported.sample_rate().0;
        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "unknown".into()),
            device_rate,
            channels = supported.channels(),
            "Speaker opened"
        );

        let stream_mixer = mixer.clone();
        let stream = StreamThread::spawn("posso-speaker", move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| VoiceError::Device("no speaker available".into()))?;
            let config: StreamConfig = supported.clone().into();
            match supported.sample_format() {
                SampleFormat::F32 => build_output::<f32>(&device, &config, stream_mixer),
                SampleFormat::I16 => build_output::<i16>(&device, &config, stream_mixer),
                SampleFormat::U16 => build_output::<u16>(&device, &config, stream_mixer),
                SampleFormat::I32 => build_output::<i32>(&device, &config, stream_mixer),
                other => Err(VoiceError::Device(format!(
                    "unsupported speaker sample format {other:?}"
                ))),
            }
        })?;

        Ok((
            Self {
                mixer,
                device_rate,
                _stream: stream,
            },
            ended_rx,
        ))
    }
}

impl AudioOutput for CpalSpeaker {
    fn current_time(&self) -> f64 {
        self.mixer.lock().frames_written as f64 / f64::from(self.device_rate)
    }

    fn play(&mut self, handle: PlaybackHandle, buffer: Arc<AudioBuffer>, start_at: f64) -> Result<(), VoiceError> {
        let samples = resample_block(&buffer.to_mono(), buffer.sample_rate(), self.device_rate)?;
        let start_frame = (start_at * f64::from(self.device_rate)).round() as u64;
        self.mixer.lock().voices.push(Voice {
            handle,
            samples,
            start_frame,
        });
        Ok(())
    }

    fn stop(&mut self, handle: PlaybackHandle) -> Result<(), VoiceError> {
        let mut mixer = self.mixer.lock();
        let before = mixer.voices.len();
        mixer.voices.retain(|voice| voice.handle != handle);
        if mixer.voices.len() == before {
            return Err(VoiceError::Device(format!(
                "playback {} already finished",
                handle.id()
            )));
        }
        Ok(())
    }
}
