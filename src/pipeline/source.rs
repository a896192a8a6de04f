//! Raw frame and sample supply.
//!
//! The pipeline never talks to hardware directly. A [`DeviceProvider`]
//! opens a [`FrameSource`] per camera index and, optionally, an
//! [`AudioSource`] for the microphone.
//!
//! Two providers ship with the service:
//! - [`NoDevices`]: every open fails, the default on headless hosts
//! - [`ReplayDevices`]: replays recorded image sequences and a WAV file

use crate::audio::processor::{decode_wav, PcmFormat};
use crate::pipeline::PipelineError;
use crate::vision::codec::decode_frame;
use image::RgbImage;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const REPLAY_AUDIO_FILE: &str = "audio.wav";

/// An open camera. Owned by the capture thread alone.
pub trait FrameSource: Send {
    /// Next frame, blocking for at most one frame interval.
    /// `Ok(None)` means nothing is ready yet.
    fn read_frame(&mut self) -> Result<Option<RgbImage>, PipelineError>;
}

/// Interleaved float samples as delivered by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Samples interleaved by channel, in [-1, 1]
    pub samples: Vec<f32>,
    pub format: PcmFormat,
}

/// An open microphone.
pub trait AudioSource: Send {
    /// Everything captured since the previous call; may be empty.
    fn read_chunk(&mut self) -> Result<AudioChunk, PipelineError>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
    /// Whether the camera opened when probed
    pub available: bool,
}

/// Opens cameras and microphones on request.
pub trait DeviceProvider: Send + Sync {
    /// Short label reported in pipeline status.
    fn name(&self) -> &str;

    fn open_camera(&self, index: u32) -> Result<Box<dyn FrameSource>, PipelineError>;

    /// `Ok(None)` when the provider has no microphone.
    fn open_microphone(&self) -> Result<Option<Box<dyn AudioSource>>, PipelineError>;

    /// Try opening each index below `max_cameras`. The default implementation
    /// opens and immediately drops each camera.
    fn probe_cameras(&self, max_cameras: u32) -> Vec<CameraInfo> {
        (0..max_cameras)
            .map(|index| CameraInfo {
                index,
                name: format!("Camera {}", index),
                available: self.open_camera(index).is_ok(),
            })
            .collect()
    }
}

/// Provider for hosts with no capture hardware.
#[derive(Debug, Default)]
pub struct NoDevices;

impl DeviceProvider for NoDevices {
    fn name(&self) -> &str {
        "none"
    }

    fn open_camera(&self, index: u32) -> Result<Box<dyn FrameSource>, PipelineError> {
        Err(PipelineError::DeviceUnavailable(format!("camera {} (no capture devices configured)", index)))
    }

    fn open_microphone(&self) -> Result<Option<Box<dyn AudioSource>>, PipelineError> {
        Ok(None)
    }
}

/// Replays `<dir>/camera<i>/*.{jpg,jpeg,png}` in name order and
/// `<dir>/audio.wav` in real time, both looping.
#[derive(Debug, Clone)]
pub struct ReplayDevices {
    dir: PathBuf,
    fps: u32,
}

impl ReplayDevices {
    /// `fps` is clamped to at least 1.
    pub fn new(dir: impl Into<PathBuf>, fps: u32) -> Self {
        Self {
            dir: dir.into(),
            fps: fps.max(1),
        }
    }

    fn camera_frames(&self, index: u32) -> Result<Vec<PathBuf>, PipelineError> {
        let camera_dir = self.dir.join(format!("camera{}", index));
        let entries = fs::read_dir(&camera_dir)
            .map_err(|e| PipelineError::DeviceUnavailable(format!("{}: {}", camera_dir.display(), e)))?;

        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(PipelineError::DeviceUnavailable(format!(
                "{} contains no images",
                camera_dir.display()
            )));
        }
        Ok(frames)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl DeviceProvider for ReplayDevices {
    fn name(&self) -> &str {
        "replay"
    }

    fn open_camera(&self, index: u32) -> Result<Box<dyn FrameSource>, PipelineError> {
        let frames = self.camera_frames(index)?;
        info!(camera = index, frames = frames.len(), fps = self.fps, "Opened replay camera");
        Ok(Box::new(ReplayCamera {
            frames,
            position: 0,
            interval: Duration::from_secs_f64(1.0 / self.fps as f64),
            next_due: Instant::now(),
        }))
    }

    fn open_microphone(&self) -> Result<Option<Box<dyn AudioSource>>, PipelineError> {
        let path = self.dir.join(REPLAY_AUDIO_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path).map_err(|e| PipelineError::DeviceUnavailable(format!("{}: {}", path.display(), e)))?;
        let (format, samples) =
            decode_wav(&bytes).map_err(|e| PipelineError::DeviceUnavailable(format!("{}: {}", path.display(), e)))?;
        if samples.is_empty() {
            return Ok(None);
        }

        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            samples = samples.len(),
            "Opened replay microphone"
        );
        Ok(Some(Box::new(ReplayMicrophone::new(samples, format))))
    }
}

struct ReplayCamera {
    frames: Vec<PathBuf>,
    position: usize,
    interval: Duration,
    next_due: Instant,
}

impl FrameSource for ReplayCamera {
    fn read_frame(&mut self) -> Result<Option<RgbImage>, PipelineError> {
        let now = Instant::now();
        if now < self.next_due {
            thread::sleep(self.next_due - now);
        }
        self.next_due = Instant::now() + self.interval;

        let path = &self.frames[self.position % self.frames.len()];
        self.position = (self.position + 1) % self.frames.len();

        let bytes = fs::read(path).map_err(|e| PipelineError::DeviceUnavailable(format!("{}: {}", path.display(), e)))?;
        match decode_frame(&bytes) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable replay frame");
                Ok(None)
            }
        }
    }
}

/// Hands out whatever audio would have been captured since the last read.
pub(crate) struct ReplayMicrophone {
    samples: Vec<f32>,
    format: PcmFormat,
    position: usize,
    started: Instant,
    delivered_frames: u64,
}

impl ReplayMicrophone {
    pub(crate) fn new(samples: Vec<f32>, format: PcmFormat) -> Self {
        Self {
            samples,
            format,
            position: 0,
            started: Instant::now(),
            delivered_frames: 0,
        }
    }

    fn take(&mut self, frames: usize) -> Vec<f32> {
        let channels = self.format.channels.max(1) as usize;
        let wanted = frames * channels;
        let mut out = Vec::with_capacity(wanted);
        while out.len() < wanted {
            let remaining = wanted - out.len();
            let available = self.samples.len() - self.position;
            let step = remaining.min(available);
            out.extend_from_slice(&self.samples[self.position..self.position + step]);
            self.position = (self.position + step) % self.samples.len();
        }
        out
    }
}

impl AudioSource for ReplayMicrophone {
    fn read_chunk(&mut self) -> Result<AudioChunk, PipelineError> {
        let due = (self.started.elapsed().as_secs_f64() * self.format.sample_rate as f64) as u64;
        let frames = due.saturating_sub(self.delivered_frames) as usize;
        self.delivered_frames += frames as u64;

        Ok(AudioChunk {
            samples: if frames == 0 { Vec::new() } else { self.take(frames) },
            format: self.format,
        })
    }
}
