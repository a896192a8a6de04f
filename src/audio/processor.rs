//! # Audio Decoding and Preprocessing
//!
//! Turns raw uploads (PCM16 little-endian bytes or WAV files) into mono
//! `f32` samples at the classifier's sample rate, and provides the
//! window normalization and signal features the rest of the audio path uses.
//!
//! ## Key Functions:
//! - **Decoding**: `decode_pcm16le` (byteorder), `decode_wav` (wav)
//! - **Conversion**: `pcm_to_float`, `downmix_to_mono`, `resample_linear`
//! - **Preparation**: `AudioPreprocessor::prepare` combines the above and flags silence
//! - **Model input**: `normalize_window` standardizes a window to zero mean / unit deviation

use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;
use std::io::Cursor;
use thiserror::Error;

/// Added to the standard deviation so a flat window cannot divide by zero.
pub const NORMALIZE_EPSILON: f32 = 1e-6;

/// Accepted range for a declared or decoded sample rate, in Hz.
pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 192_000;

#[derive(Debug, Error)]
pub enum AudioFormatError {
    #[error("audio data is empty")]
    Empty,

    #[error("PCM16 data length must be even, got {0} bytes")]
    OddLength(usize),

    #[error("channel count must be at least 1")]
    NoChannels,

    #[error("sample rate must be greater than 0")]
    NoSampleRate,

    #[error("sample rate {0} Hz is outside {min}..={max}", min = MIN_SAMPLE_RATE, max = MAX_SAMPLE_RATE)]
    SampleRateOutOfRange(u32),

    #[error("unsupported WAV sample format")]
    UnsupportedWav,

    #[error("failed to read WAV data: {0}")]
    Wav(#[from] std::io::Error),
}

/// Format the client declares for a raw PCM upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    fn validate(&self) -> Result<(), AudioFormatError> {
        if self.channels == 0 {
            return Err(AudioFormatError::NoChannels);
        }
        if self.sample_rate == 0 {
            return Err(AudioFormatError::NoSampleRate);
        }
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(AudioFormatError::SampleRateOutOfRange(self.sample_rate));
        }
        Ok(())
    }
}

/// Decode little-endian signed 16-bit PCM.
pub fn decode_pcm16le(data: &[u8]) -> Result<Vec<i16>, AudioFormatError> {
    if data.is_empty() {
        return Err(AudioFormatError::Empty);
    }
    if data.len() % 2 != 0 {
        return Err(AudioFormatError::OddLength(data.len()));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Scale 16-bit integers into [-1.0, 1.0).
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Decode a WAV file into interleaved float samples and its format.
pub fn decode_wav(data: &[u8]) -> Result<(PcmFormat, Vec<f32>), AudioFormatError> {
    if data.is_empty() {
        return Err(AudioFormatError::Empty);
    }

    let mut reader = Cursor::new(data);
    let (header, body) = wav::read(&mut reader)?;
    let format = PcmFormat::new(header.sampling_rate, header.channel_count);
    format.validate()?;

    let samples = match body {
        wav::BitDepth::Eight(raw) => raw
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(raw) => pcm_to_float(&raw),
        wav::BitDepth::TwentyFour(raw) => raw
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(raw) => raw,
        wav::BitDepth::Empty => return Err(AudioFormatError::UnsupportedWav),
    };

    Ok((format, samples))
}

/// Average interleaved channels into one.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }

    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler, adequate for a rubbing-noise classifier.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = (position.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let fraction = (position - index as f64) as f32;
            samples[index] + (samples[next] - samples[index]) * fraction
        })
        .collect()
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Standardize in place: subtract the mean, divide by (std + epsilon).
///
/// This matches how the classifier was trained; peak normalization would
/// shift quiet rubbing noise into a different input distribution.
pub fn normalize_window(window: &mut [f32]) {
    if window.is_empty() {
        return;
    }

    let n = window.len() as f32;
    let mean = window.iter().sum::<f32>() / n;
    let variance = window.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
    let scale = 1.0 / (variance.sqrt() + NORMALIZE_EPSILON);

    for sample in window.iter_mut() {
        *sample = (*sample - mean) * scale;
    }
}

/// Summary statistics for an audio clip.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioFeatures {
    pub length: usize,
    pub duration_seconds: f32,
    pub rms: f32,
    pub peak: f32,
    pub mean: f32,
    pub std: f32,
    pub zero_crossing_rate: f32,
}

impl AudioFeatures {
    pub fn extract(samples: &[f32], sample_rate: u32) -> Self {
        let length = samples.len();
        if length == 0 {
            return Self {
                length,
                duration_seconds: 0.0,
                rms: 0.0,
                peak: 0.0,
                mean: 0.0,
                std: 0.0,
                zero_crossing_rate: 0.0,
            };
        }

        let n = length as f32;
        let mean = samples.iter().sum::<f32>() / n;
        let std = (samples.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n).sqrt();
        let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        let crossings = samples
            .windows(2)
            .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
            .count();

        Self {
            length,
            duration_seconds: if sample_rate > 0 { n / sample_rate as f32 } else { 0.0 },
            rms: rms(samples),
            peak,
            mean,
            std,
            zero_crossing_rate: crossings as f32 / (length.saturating_sub(1)).max(1) as f32,
        }
    }
}

/// Mono samples ready for the ring buffer.
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub samples: Vec<f32>,
    pub rms: f32,
    pub silent: bool,
}

/// Converts device or upload audio into the classifier's format.
#[derive(Debug, Clone)]
pub struct AudioPreprocessor {
    target_rate: u32,
    silence_rms: f32,
    /// Longest chunk worth producing; the ring keeps no more than this.
    max_samples: usize,
}

impl AudioPreprocessor {
    pub fn new(target_rate: u32, silence_rms: f32, max_samples: usize) -> Self {
        Self {
            target_rate,
            silence_rms,
            max_samples: max_samples.max(1),
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Down-mix, resample and measure an interleaved float chunk.
    pub fn prepare(&self, interleaved: &[f32], format: PcmFormat) -> Result<PreparedChunk, AudioFormatError> {
        format.validate()?;
        let mono = downmix_to_mono(interleaved, format.channels);
        let samples = resample_linear(self.trailing_input(&mono, format.sample_rate), format.sample_rate, self.target_rate);
        let level = rms(&samples);

        Ok(PreparedChunk {
            samples,
            rms: level,
            silent: level < self.silence_rms,
        })
    }

    /// Tail of `mono` that still fits in `max_samples` once resampled.
    fn trailing_input<'a>(&self, mono: &'a [f32], from_rate: u32) -> &'a [f32] {
        let target = u64::from(self.target_rate.max(1));
        let needed = (self.max_samples as u64 * u64::from(from_rate)).div_ceil(target) as usize + 1;
        &mono[mono.len().saturating_sub(needed)..]
    }

    /// Decode a raw PCM16 body and prepare it.
    pub fn prepare_pcm16(&self, data: &[u8], format: PcmFormat) -> Result<PreparedChunk, AudioFormatError> {
        let samples = pcm_to_float(&decode_pcm16le(data)?);
        self.prepare(&samples, format)
    }

    /// Decode a WAV body and prepare it.
    pub fn prepare_wav(&self, data: &[u8]) -> Result<PreparedChunk, AudioFormatError> {
        let (format, samples) = decode_wav(data)?;
        self.prepare(&samples, format)
    }
}
