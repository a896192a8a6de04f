//! # Capture / Process Pipeline
//!
//! The device-driven path of the service. Two OS threads run per started
//! pipeline:
//!
//! ```text
//! capture thread ──> frame queue (drop-oldest) ──> process thread ──> result queue (drop-oldest)
//!        └────────> audio queue  (drop-oldest) ──────────┘                    └──> latest result
//! ```
//!
//! ## Rules:
//! - Device acquisition happens before any thread is spawned; a failure
//!   leaves nothing running
//! - Both threads watch one `running` flag; shutdown latency is at most one
//!   queue timeout
//! - The capture thread owns the camera outright and takes no locks
//! - `stop()` joins with a deadline, then detaches whatever is still running
//! - Status reads never touch the session lock: the process thread publishes
//!   a snapshot after every frame and audio chunk, so `status()` and
//!   `stage_status()` are safe to call from async handlers. `reset()` and
//!   `start()` do lock the session and belong on a blocking thread.

pub mod queue;
pub mod source;

use crate::config::AppConfig;
use crate::confirmation::StageStatus;
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::source::{AudioChunk, AudioSource, CameraInfo, DeviceProvider, FrameSource};
use crate::session::{EncodedFrame, PuritySession, SessionServices, SessionSummary};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const AUDIO_QUEUE_CAPACITY: usize = 64;
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const PIPELINE_SESSION_ID: &str = "pipeline";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// One processed frame as published by the process thread.
#[derive(Debug, Clone)]
pub struct PipelineFrame {
    /// 1-based publish order since the pipeline was started
    pub sequence: u64,
    pub encoded: EncodedFrame,
}

/// Pipeline state for the purity status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub running: bool,
    /// Name of the device provider (`replay`, `none`)
    pub device: String,
    pub camera_index: Option<u32>,
    /// Whether a microphone was opened alongside the camera
    pub microphone: bool,
    pub started_at: Option<DateTime<Utc>>,
    /// Frames read from the camera since start
    pub frames_captured: u64,
    /// Frames processed and published as results since start
    pub frames_published: u64,
    pub queued_frames: usize,
    pub queued_results: usize,
    /// Frames discarded because the process thread fell behind
    pub dropped_frames: u64,
    /// Results discarded because no client collected them
    pub dropped_results: u64,
    pub status: StageStatus,
    pub session: SessionSummary,
}

/// Returned by a successful [`PipelineController::start`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInfo {
    pub camera_index: u32,
    pub microphone: bool,
    pub started_at: DateTime<Utc>,
}

struct RunningPipeline {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    camera_index: u32,
    join_timeout: Duration,
}

/// What status readers see of a running pipeline.
#[derive(Clone)]
struct RunInfo {
    camera_index: u32,
    microphone: bool,
    started_at: DateTime<Utc>,
    frames: DropOldestQueue<RgbImage>,
}

/// Session state as of the last frame or audio chunk the process thread handled.
#[derive(Clone)]
struct SessionSnapshot {
    status: StageStatus,
    summary: SessionSummary,
}

impl SessionSnapshot {
    fn of(session: &PuritySession) -> Self {
        Self {
            status: session.status(),
            summary: session.summary(),
        }
    }
}

type SharedSnapshot = Arc<RwLock<SessionSnapshot>>;

fn publish(snapshot: &SharedSnapshot, session: &PuritySession) {
    *snapshot.write().unwrap_or_else(PoisonError::into_inner) = SessionSnapshot::of(session);
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    published: AtomicU64,
}

/// Owns the shared device-driven session and its worker threads.
pub struct PipelineController {
    devices: Arc<dyn DeviceProvider>,
    services: SessionServices,
    session: Arc<Mutex<PuritySession>>,
    snapshot: SharedSnapshot,
    latest: Arc<RwLock<Option<Arc<PipelineFrame>>>>,
    results: DropOldestQueue<Arc<PipelineFrame>>,
    counters: Arc<Counters>,
    /// Serializes `start` and `stop`; held while devices open.
    running: Mutex<Option<RunningPipeline>>,
    info: RwLock<Option<RunInfo>>,
}

impl PipelineController {
    pub fn new(devices: Arc<dyn DeviceProvider>, services: SessionServices, config: &AppConfig) -> Self {
        let session = PuritySession::new(PIPELINE_SESSION_ID, &services, config);
        Self {
            snapshot: Arc::new(RwLock::new(SessionSnapshot::of(&session))),
            session: Arc::new(Mutex::new(session)),
            results: DropOldestQueue::new(config.pipeline.result_queue_capacity),
            latest: Arc::new(RwLock::new(None)),
            counters: Arc::new(Counters::default()),
            running: Mutex::new(None),
            info: RwLock::new(None),
            devices,
            services,
        }
    }

    /// Name of the device provider in use.
    pub fn device_name(&self) -> &str {
        self.devices.name()
    }

    /// List which camera indices below `max_cameras` can be opened.
    pub fn probe_cameras(&self, max_cameras: u32) -> Vec<CameraInfo> {
        // an open camera cannot be probed again on most backends
        if self.is_running() {
            warn!("Probing cameras while the pipeline is running");
        }
        self.devices.probe_cameras(max_cameras)
    }

    pub fn is_running(&self) -> bool {
        self.info.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Open devices and spawn the capture and process threads.
    ///
    /// The session is rebuilt from `config`, so a running pipeline keeps
    /// the settings it was started with.
    pub fn start(&self, camera_index: u32, config: &AppConfig) -> Result<StartInfo, PipelineError> {
        let mut slot = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let camera = self.devices.open_camera(camera_index)?;
        let microphone = self.devices.open_microphone()?;
        let has_microphone = microphone.is_some();

        {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            *session = PuritySession::new(PIPELINE_SESSION_ID, &self.services, config);
            publish(&self.snapshot, &session);
        }
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.results.clear();
        self.counters.captured.store(0, Ordering::Relaxed);
        self.counters.published.store(0, Ordering::Relaxed);

        let running = Arc::new(AtomicBool::new(true));
        let frames = DropOldestQueue::new(config.pipeline.frame_queue_capacity);
        let audio = DropOldestQueue::new(AUDIO_QUEUE_CAPACITY);
        let queue_timeout = config.pipeline.queue_timeout();

        let capture = CaptureLoop {
            running: Arc::clone(&running),
            camera,
            microphone,
            frames: frames.clone(),
            audio: audio.clone(),
            counters: Arc::clone(&self.counters),
            retry_delay: queue_timeout,
        };
        let capture_handle = thread::Builder::new()
            .name("purity-capture".into())
            .spawn(move || capture.run())?;

        let process = ProcessLoop {
            running: Arc::clone(&running),
            session: Arc::clone(&self.session),
            snapshot: Arc::clone(&self.snapshot),
            frames: frames.clone(),
            audio,
            results: self.results.clone(),
            latest: Arc::clone(&self.latest),
            counters: Arc::clone(&self.counters),
            queue_timeout,
        };
        let process_handle = match thread::Builder::new()
            .name("purity-process".into())
            .spawn(move || process.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                join_with_deadline(vec![capture_handle], config.pipeline.join_timeout());
                return Err(PipelineError::Spawn(e));
            }
        };

        let started_at = Utc::now();
        info!(
            camera = camera_index,
            microphone = has_microphone,
            device = self.devices.name(),
            "Pipeline started"
        );

        *slot = Some(RunningPipeline {
            running,
            threads: vec![capture_handle, process_handle],
            camera_index,
            join_timeout: config.pipeline.join_timeout(),
        });
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(RunInfo {
            camera_index,
            microphone: has_microphone,
            started_at,
            frames,
        });

        Ok(StartInfo {
            camera_index,
            microphone: has_microphone,
            started_at,
        })
    }

    /// Signal both threads and wait for them. Returns false if nothing was running.
    pub fn stop(&self) -> bool {
        let Some(pipeline) = self.running.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return false;
        };
        self.info.write().unwrap_or_else(PoisonError::into_inner).take();

        pipeline.running.store(false, Ordering::SeqCst);
        join_with_deadline(pipeline.threads, pipeline.join_timeout);
        info!(camera = pipeline.camera_index, "Pipeline stopped");
        true
    }

    /// Reset the pipeline session to RUBBING and drop buffered results.
    ///
    /// Waits for any frame in progress, so call it from a blocking thread.
    pub fn reset(&self) -> StageStatus {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        session.reset();
        publish(&self.snapshot, &session);
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.results.clear();
        session.status()
    }

    /// Most recent result, kept until the next one replaces it. Unlike
    /// [`Self::next_result`] it does not consume anything.
    pub fn latest(&self) -> Option<Arc<PipelineFrame>> {
        self.latest.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Pop the oldest unsent result.
    pub fn next_result(&self) -> Option<Arc<PipelineFrame>> {
        self.results.try_pop()
    }

    /// Stage status as of the last processed frame or audio chunk.
    pub fn stage_status(&self) -> StageStatus {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).status.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        let info = self.info.read().unwrap_or_else(PoisonError::into_inner).clone();
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone();

        PipelineStatus {
            running: info.is_some(),
            device: self.devices.name().to_string(),
            camera_index: info.as_ref().map(|i| i.camera_index),
            microphone: info.as_ref().is_some_and(|i| i.microphone),
            started_at: info.as_ref().map(|i| i.started_at),
            frames_captured: self.counters.captured.load(Ordering::Relaxed),
            frames_published: self.counters.published.load(Ordering::Relaxed),
            queued_frames: info.as_ref().map_or(0, |i| i.frames.len()),
            queued_results: self.results.len(),
            dropped_frames: info.as_ref().map_or(0, |i| i.frames.dropped()),
            dropped_results: self.results.dropped(),
            status: snapshot.status,
            session: snapshot.summary,
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_with_deadline(mut threads: Vec<JoinHandle<()>>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let mut remaining = Vec::new();
        for handle in threads.drain(..) {
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Pipeline thread panicked");
                }
            } else {
                remaining.push(handle);
            }
        }
        threads = remaining;

        if threads.is_empty() {
            return;
        }
        if Instant::now() >= deadline {
            warn!(still_running = threads.len(), "Pipeline shutdown timed out, detaching threads");
            return;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
}

struct CaptureLoop {
    running: Arc<AtomicBool>,
    camera: Box<dyn FrameSource>,
    microphone: Option<Box<dyn AudioSource>>,
    frames: DropOldestQueue<RgbImage>,
    audio: DropOldestQueue<AudioChunk>,
    counters: Arc<Counters>,
    retry_delay: Duration,
}

impl CaptureLoop {
    fn run(mut self) {
        debug!("Capture thread started");
        while self.running.load(Ordering::SeqCst) {
            match self.camera.read_frame() {
                Ok(Some(frame)) => {
                    self.counters.captured.fetch_add(1, Ordering::Relaxed);
                    self.frames.push(frame);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Camera read failed");
                    thread::sleep(self.retry_delay);
                }
            }

            if let Some(microphone) = self.microphone.as_mut() {
                match microphone.read_chunk() {
                    Ok(chunk) if !chunk.samples.is_empty() => self.audio.push(chunk),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Microphone read failed"),
                }
            }
        }
        debug!("Capture thread exiting");
    }
}

struct ProcessLoop {
    running: Arc<AtomicBool>,
    session: Arc<Mutex<PuritySession>>,
    snapshot: SharedSnapshot,
    frames: DropOldestQueue<RgbImage>,
    audio: DropOldestQueue<AudioChunk>,
    results: DropOldestQueue<Arc<PipelineFrame>>,
    latest: Arc<RwLock<Option<Arc<PipelineFrame>>>>,
    counters: Arc<Counters>,
    queue_timeout: Duration,
}

impl ProcessLoop {
    fn run(self) {
        debug!("Process thread started");
        while self.running.load(Ordering::SeqCst) {
            self.drain_audio();

            let Some(frame) = self.frames.pop_timeout(self.queue_timeout) else {
                continue;
            };

            let encoded = {
                let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
                let encoded = session.process_frame_encoded(frame);
                publish(&self.snapshot, &session);
                encoded
            };

            match encoded {
                Ok(encoded) => {
                    let sequence = self.counters.published.fetch_add(1, Ordering::Relaxed) + 1;
                    let published = Arc::new(PipelineFrame { sequence, encoded });
                    *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&published));
                    self.results.push(published);
                }
                Err(e) => warn!(error = %e, "Failed to encode pipeline frame"),
            }
        }
        debug!("Process thread exiting");
    }

    fn drain_audio(&self) {
        while let Some(chunk) = self.audio.try_pop() {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            match session.feed_audio(&chunk.samples, chunk.format) {
                Ok(_) => publish(&self.snapshot, &session),
                Err(e) => warn!(error = %e, "Dropping malformed audio chunk"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::Stage;
    use crate::pipeline::source::tests::StaticDevices;
    use crate::pipeline::source::NoDevices;
    use crate::vision::rubbing::tests::RubbingScene;

    fn services() -> SessionServices {
        SessionServices {
            detector: Arc::new(RubbingScene::new((50.0, 50.0, 150.0, 150.0))),
            classifier: None,
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_device_failure_spawns_nothing() {
        let config = AppConfig::default();
        let controller = PipelineController::new(Arc::new(NoDevices), services(), &config);

        assert!(matches!(controller.start(0, &config), Err(PipelineError::DeviceUnavailable(_))));
        assert!(!controller.is_running());
        assert!(!controller.stop());
    }

    #[test]
    fn test_start_produces_results_and_stop_joins() {
        let config = AppConfig::default();
        let devices = StaticDevices::new(200, 200);
        let opens = Arc::clone(&devices.opens);
        let controller = PipelineController::new(Arc::new(devices), services(), &config);

        let info = controller.start(0, &config).unwrap();
        assert_eq!(info.camera_index, 0);
        assert!(matches!(controller.start(0, &config), Err(PipelineError::AlreadyRunning)));
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        assert!(wait_for(|| controller.latest().is_some_and(|f| f.sequence >= 6)));
        let status = controller.status();
        assert!(status.running);
        assert!(status.queued_results <= config.pipeline.result_queue_capacity);
        assert!(status.queued_frames <= config.pipeline.frame_queue_capacity);
        assert_eq!(status.status.task, Stage::Rubbing);
        assert!(status.session.frames_received >= 6);

        let result = controller.next_result().unwrap();
        assert!(!result.encoded.jpeg.is_empty());

        assert!(controller.stop());
        assert!(!controller.is_running());
        assert!(!controller.status().running);
    }

    #[test]
    fn test_reset_clears_latest() {
        let config = AppConfig::default();
        let controller = PipelineController::new(Arc::new(StaticDevices::new(64, 64)), services(), &config);
        controller.start(0, &config).unwrap();
        assert!(wait_for(|| controller.latest().is_some()));
        controller.stop();

        let status = controller.reset();
        assert_eq!(status.task, Stage::Rubbing);
        assert!(controller.latest().is_none());
        assert!(controller.next_result().is_none());
    }

    #[test]
    fn test_status_does_not_wait_for_session_lock() {
        let config = AppConfig::default();
        let controller = Arc::new(PipelineController::new(
            Arc::new(StaticDevices::new(64, 64)),
            services(),
            &config,
        ));

        // stands in for a frame stuck in a slow detector call
        let _processing = controller.session.lock().unwrap();

        let reader = Arc::clone(&controller);
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = tx.send((reader.status().status.task, reader.stage_status().task, reader.is_running()));
        });
        let (task, stage, running) = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("status reads waited on the session lock");
        assert_eq!(task, Stage::Rubbing);
        assert_eq!(stage, Stage::Rubbing);
        assert!(!running);
    }

    #[test]
    fn test_bad_camera_index() {
        let config = AppConfig::default();
        let controller = PipelineController::new(Arc::new(StaticDevices::new(64, 64)), services(), &config);
        assert!(controller.start(3, &config).is_err());
        let cameras = controller.probe_cameras(2);
        assert!(cameras[0].available);
        assert!(!cameras[1].available);
    }
}
