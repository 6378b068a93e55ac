//! PCM framing helpers shared by the capture and playback paths.
//!
//! Wire format in both directions is signed 16-bit little-endian PCM,
//! base64-encoded inside JSON frames. Everything here is pure: no I/O,
//! no state.

use base64::Engine;

use crate::error::VoiceError;

/// Bytes per PCM sample on the wire.
pub const SAMPLE_WIDTH: usize = 2;

/// Microphone audio sent to the remote service (16kHz PCM mono).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Synthesized speech received from the remote service (24kHz PCM mono).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Full-scale value used to map between `f32` and `i16`.
const PCM_SCALE: f32 = 32_768.0;

// ── Base64 ─────────────────────────────────────────────────────────

/// Decode a base64 payload into raw bytes.
pub fn decode_base64(data: &str) -> Result<Vec<u8>, VoiceError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| VoiceError::Decode(format!("invalid base64 audio payload: {e}")))
}

/// Encode raw bytes as standard base64.
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

// ── Sample conversion ──────────────────────────────────────────────

/// Convert one float sample in `[-1.0, 1.0]` to 16-bit PCM.
///
/// Out-of-range input saturates; NaN maps to silence.
pub fn float_to_pcm(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let scaled = (sample.clamp(-1.0, 1.0) * PCM_SCALE).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert one 16-bit PCM sample back to a float in `[-1.0, 1.0)`.
pub fn pcm_to_float(sample: i16) -> f32 {
    f32::from(sample) / PCM_SCALE
}

/// Reinterpret little-endian wire bytes as PCM samples.
pub fn bytes_to_pcm(bytes: &[u8]) -> Result<Vec<i16>, VoiceError> {
    if bytes.len() % SAMPLE_WIDTH != 0 {
        return Err(VoiceError::Decode(format!(
            "{} bytes is not a whole number of {SAMPLE_WIDTH}-byte samples",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(SAMPLE_WIDTH)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Serialize PCM samples to little-endian wire bytes.
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Quantize float samples straight to wire bytes.
pub fn float_samples_to_pcm_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for &sample in samples {
        out.extend_from_slice(&float_to_pcm(sample).to_le_bytes());
    }
    out
}

fn check_format(sample_rate: u32, channels: u16) -> Result<(), VoiceError> {
    if sample_rate == 0 {
        return Err(VoiceError::Decode("sample rate must be positive".into()));
    }
    if channels == 0 {
        return Err(VoiceError::Decode("channel count must be positive".into()));
    }
    Ok(())
}

// ── Outbound frame ─────────────────────────────────────────────────

/// One captured block of microphone audio, already quantized for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Quantize interleaved float samples into a frame.
    pub fn from_float(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Self, VoiceError> {
        check_format(sample_rate, channels)?;
        Ok(Self {
            samples: samples.iter().copied().map(float_to_pcm).collect(),
            sample_rate,
            channels,
        })
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Little-endian wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        pcm_to_bytes(&self.samples)
    }

    /// MIME type announced alongside the payload, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Playback length of the frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        let frames = self.samples.len() / usize::from(self.channels);
        frames as f64 / f64::from(self.sample_rate)
    }
}

// ── Inbound buffer ─────────────────────────────────────────────────

/// Decoded, playable audio: one float vector per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Build a buffer from planar float data. All channels must be equally long.
    pub fn from_planar(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self, VoiceError> {
        let channel_count = u16::try_from(channels.len())
            .map_err(|_| VoiceError::Decode("too many channels".into()))?;
        check_format(sample_rate, channel_count)?;
        let len = channels[0].len();
        if channels.iter().any(|c| c.len() != len) {
            return Err(VoiceError::Decode("channels differ in length".into()));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Number of sample frames (samples per channel).
    pub fn length(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Duration in seconds on an output clock running at `sample_rate`.
    pub fn duration(&self) -> f64 {
        self.length() as f64 / f64::from(self.sample_rate)
    }

    pub fn channel_data(&self, channel: usize) -> Option<&[f32]> {
        self.channels.get(channel).map(Vec::as_slice)
    }

    /// Average all channels down to one.
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels.len() == 1 {
            return self.channels[0].clone();
        }
        let count = self.channels.len() as f32;
        (0..self.length())
            .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / count)
            .collect()
    }
}

/// Rebuild a playable buffer from interleaved 16-bit PCM wire bytes.
pub fn pcm_bytes_to_audio_buffer(
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<AudioBuffer, VoiceError> {
    check_format(sample_rate, channels)?;
    let samples = bytes_to_pcm(bytes)?;
    let channel_count = usize::from(channels);
    if samples.len() % channel_count != 0 {
        return Err(VoiceError::Decode(format!(
            "{} samples cannot be split evenly across {channel_count} channels",
            samples.len()
        )));
    }

    let frames = samples.len() / channel_count;
    let mut planar = vec![Vec::with_capacity(frames); channel_count];
    for frame in samples.chunks_exact(channel_count) {
        for (channel, &sample) in frame.iter().enumerate() {
            planar[channel].push(pcm_to_float(sample));
        }
    }

    Ok(AudioBuffer {
        sample_rate,
        channels: planar,
    })
}

/// Base64 payload straight to a playable buffer.
pub fn decode_audio_payload(
    data_b64: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<AudioBuffer, VoiceError> {
    let bytes = decode_base64(data_b64)?;
    pcm_bytes_to_audio_buffer(&bytes, sample_rate, channels)
}

// ── Tests ──────────────────────────────────────────────────────────
