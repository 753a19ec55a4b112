//! One-shot conversion workers
//!
//! Each in-flight conversion gets its own blocking task and a oneshot result
//! channel. The task owns the pixel buffer, sends exactly one terminal
//! message, and is gone afterwards; nothing is reused between files.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SvgBatchError};
use crate::processing::decode::PixelBuffer;
use crate::processing::trace::{TraceParams, Tracer};

/// Input for a single worker
#[derive(Debug)]
pub struct TraceJob {
    pub file_name: String,
    pub pixels: PixelBuffer,
    pub params: TraceParams,
}

/// Terminal message sent by a worker
#[derive(Debug)]
pub enum WorkerMessage {
    Success { svg: String },
    Error { error: SvgBatchError },
}

/// Handle to a spawned worker
pub struct WorkerChannel {
    file_name: String,
    result: oneshot::Receiver<WorkerMessage>,
    task: JoinHandle<()>,
}

impl WorkerChannel {
    /// Spawn a worker for `job` on the blocking pool
    pub fn spawn(job: TraceJob, tracer: Arc<dyn Tracer>) -> Self {
        let (sender, result) = oneshot::channel();
        let file_name = job.file_name.clone();

        let task = tokio::task::spawn_blocking(move || {
            let TraceJob {
                file_name,
                pixels,
                params,
            } = job;

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| tracer.trace(&pixels, &params)));
            let message = match outcome {
                Ok(Ok(svg)) => WorkerMessage::Success { svg },
                Ok(Err(error)) => WorkerMessage::Error { error },
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    warn!("Worker for {} panicked: {}", file_name, reason);
                    WorkerMessage::Error {
                        error: SvgBatchError::channel_fault(reason),
                    }
                }
            };

            // The receiver is gone when the run was cancelled
            if sender.send(message).is_err() {
                debug!("Discarding result for {}: channel already torn down", file_name);
            }
        });

        Self {
            file_name,
            result,
            task,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Wait for the terminal message, or tear the worker down on cancellation
    pub async fn settle(self, cancel: &CancellationToken) -> Result<String> {
        let Self {
            file_name,
            result,
            task,
        } = self;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                // A trace already running on the blocking pool finishes on its
                // own; only its result is dropped.
                task.abort();
                debug!("Abandoned worker for {}", file_name);
                Err(SvgBatchError::Cancelled)
            }

            message = result => match message {
                Ok(WorkerMessage::Success { svg }) => Ok(svg),
                Ok(WorkerMessage::Error { error }) => Err(error),
                Err(_) => Err(SvgBatchError::channel_fault(
                    "worker exited without sending a result",
                )),
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
