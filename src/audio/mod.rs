//! # Audio Processing Module
//!
//! Everything between raw microphone/upload audio and an OK / NOT OK
//! rubbing-sound verdict.
//!
//! ## Key Components:
//! - **buffer**: fixed-capacity ring of float samples with windowed reads
//! - **processor**: PCM/WAV decoding, down-mix, resampling, normalization, features
//! - **classifier**: the `Classifier` capability and the candle WaveCNN1D implementation
//! - **rubbing**: sliding-window inference over the ring buffer
//!
//! ## Audio Format:
//! - **Sample Rate**: 16kHz by default (`audio.sample_rate`)
//! - **Channels**: Mono after down-mix
//! - **Input encodings**: PCM16 little-endian or WAV (8/16/24-bit, 32-bit float)

pub mod buffer;
pub mod classifier;
pub mod processor;
pub mod rubbing;
