//! Bounded model calls.
//!
//! Detector and classifier calls are opaque and may hang. A [`BoundedWorker`]
//! owns one long-lived thread per model and runs calls on it one at a time,
//! while the caller stops waiting at the deadline.
//!
//! ## Overdue calls:
//! A call still running past its deadline keeps the worker busy. Until it
//! returns, new calls are refused with [`GuardError::Busy`] instead of being
//! queued behind it, so a hung model costs one thread and no backlog.

use crossbeam_channel::{bounded, RecvTimeoutError, SendTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Calls allowed to wait for the worker at once.
const QUEUE_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("call did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("an earlier call is still running past its deadline")]
    Busy,

    #[error("call panicked")]
    Panicked,

    #[error("worker thread has stopped")]
    WorkerGone,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Job {
    run: Box<dyn FnOnce() + Send>,
    deadline: Instant,
    /// Set by the caller once it stops waiting.
    abandoned: Arc<AtomicBool>,
}

/// Handle to a single worker thread. Clones share the thread, which exits
/// once every handle is dropped.
#[derive(Clone)]
pub struct BoundedWorker {
    name: Arc<str>,
    jobs: Sender<Job>,
    /// Deadline of the call currently running, if any.
    running: Arc<Mutex<Option<Instant>>>,
}

impl BoundedWorker {
    pub fn spawn(name: &str) -> Result<Self, GuardError> {
        let (jobs, queue) = bounded::<Job>(QUEUE_DEPTH);
        let running = Arc::new(Mutex::new(None));

        let worker_running = Arc::clone(&running);
        thread::Builder::new().name(format!("model-{}", name)).spawn(move || {
            for job in queue {
                if job.abandoned.load(Ordering::SeqCst) {
                    continue;
                }
                *worker_running.lock().unwrap_or_else(PoisonError::into_inner) = Some(job.deadline);
                // a panic drops the reply sender, which the caller reports
                let _ = catch_unwind(AssertUnwindSafe(job.run));
                *worker_running.lock().unwrap_or_else(PoisonError::into_inner) = None;
            }
        })?;

        Ok(Self {
            name: Arc::from(name),
            jobs,
            running,
        })
    }

    /// True while a call is running past its deadline.
    pub fn is_overdue(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Run `task` on the worker, giving up after `limit`. `None` runs it
    /// inline on the calling thread with no limit.
    pub fn call<T, F>(&self, limit: Option<Duration>, task: F) -> Result<T, GuardError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let Some(limit) = limit else {
            return Ok(task());
        };
        if self.is_overdue() {
            return Err(GuardError::Busy);
        }

        let deadline = Instant::now() + limit;
        let (reply, answer) = bounded(1);
        let abandoned = Arc::new(AtomicBool::new(false));
        let job = Job {
            run: Box::new(move || {
                // the receiver is gone once the caller has timed out
                let _ = reply.send(task());
            }),
            deadline,
            abandoned: Arc::clone(&abandoned),
        };

        match self.jobs.send_timeout(job, limit) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(GuardError::TimedOut(limit)),
            Err(SendTimeoutError::Disconnected(_)) => return Err(GuardError::WorkerGone),
        }

        match answer.recv_deadline(deadline) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                abandoned.store(true, Ordering::SeqCst);
                warn!(worker = %self.name, limit_ms = limit.as_millis() as u64, "Model call exceeded its deadline");
                Err(GuardError::TimedOut(limit))
            }
            Err(RecvTimeoutError::Disconnected) => Err(GuardError::Panicked),
        }
    }
}
