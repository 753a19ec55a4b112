//! Batch scheduling: folder queues, concurrency-bounded waves, control

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConcurrencyScope, ConversionSettings};
use crate::error::Result;
use crate::processing::{ConversionEngine, Tracer};

pub mod control;
pub mod progress;
pub mod state;

pub use control::*;
pub use progress::*;
pub use state::*;

/// Drives queued files through the conversion engine folder by folder.
///
/// Each folder converts in waves: the next `concurrency` queued files run
/// together and the wave fully settles before the next one starts. Folders
/// run side by side.
pub struct BatchScheduler {
    store: Arc<StateStore>,
    engine: Arc<ConversionEngine>,
    controller: Controller,
    progress: ProgressTracker,
}

/// Run-scoped values shared by every folder
struct RunContext<'a> {
    settings: &'a ConversionSettings,
    cancel: CancellationToken,
    limiter: Option<Semaphore>,
}

impl BatchScheduler {
    pub fn new(store: Arc<StateStore>, engine: Arc<ConversionEngine>) -> Self {
        Self {
            store,
            engine,
            controller: Controller::new(),
            progress: ProgressTracker::new(),
        }
    }

    /// Scheduler whose engine uses `tracer` and the store's pixel limit
    pub fn with_tracer(store: Arc<StateStore>, tracer: Arc<dyn Tracer>) -> Self {
        let decoder = crate::processing::ImageDecoder::new(store.limits().max_image_pixels);
        let engine = ConversionEngine::with_decoder(decoder, tracer);
        Self::new(store, Arc::new(engine))
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.controller.is_paused()
    }

    /// Whether the most recent run was cancelled
    pub fn was_cancelled(&self) -> bool {
        self.controller.is_cancelled()
    }

    /// Convert every queued file with `settings`.
    ///
    /// Returns when all folders have drained their queues or the run was
    /// cancelled. Per-file failures are recorded on the files and never
    /// abort the run.
    pub async fn start_all(&self, settings: ConversionSettings) -> Result<GlobalStats> {
        settings.validate()?;
        let _guard = self.controller.begin_run()?;

        let (folders, queued_files) = self.store.begin_run();
        self.progress.emit(ProgressEvent::RunStarted {
            folders: folders.len(),
            queued_files,
        });

        let ctx = RunContext {
            settings: &settings,
            cancel: self.controller.cancel_token(),
            limiter: match settings.concurrency_scope {
                ConcurrencyScope::PerFolder => None,
                ConcurrencyScope::Global => Some(Semaphore::new(settings.concurrency)),
            },
        };

        join_all(folders.into_iter().map(|folder| self.run_folder(folder, &ctx))).await;

        let stats = self.store.finish_run();
        self.progress.emit(ProgressEvent::RunFinished {
            stats: stats.clone(),
        });
        Ok(stats)
    }

    /// Toggle pause. In-flight waves finish; no new wave starts while paused.
    ///
    /// Returns the new pause state, or `false` when no run is active.
    pub fn pause_resume(&self) -> bool {
        if !self.controller.is_running() {
            return false;
        }

        let paused = self.controller.toggle_pause();
        self.store.set_paused(paused);
        if paused {
            info!("Conversion paused");
            self.progress.emit(ProgressEvent::Paused);
        } else {
            info!("Conversion resumed");
            self.progress.emit(ProgressEvent::Resumed);
        }
        paused
    }

    /// Cancel the active run.
    ///
    /// Outstanding workers are torn down, files still `processing` go back to
    /// `queued` and every folder returns to `idle`. Finished work is kept.
    pub fn cancel(&self) -> bool {
        if !self.controller.is_running() {
            return false;
        }

        self.controller.cancel();
        let reverted = self.store.cancel_run();
        info!("Conversion cancelled; {} in-flight files requeued", reverted);
        self.progress.emit(ProgressEvent::Cancelled);
        true
    }

    async fn run_folder(&self, folder: FolderId, ctx: &RunContext<'_>) {
        if let Err(e) = self
            .store
            .begin_folder(folder, || self.controller.is_paused(), &ctx.cancel)
        {
            debug!("Folder {} not started: {}", folder, e);
            return;
        }

        let mut attempted = HashSet::new();
        loop {
            if !self.controller.wait_until_resumed(&ctx.cancel).await {
                break;
            }

            let slice = match self.store.next_slice(folder, ctx.settings.concurrency, &attempted) {
                Ok(slice) if !slice.is_empty() => slice,
                Ok(_) => break,
                Err(e) => {
                    warn!("Folder {} left the run: {}", folder, e);
                    return;
                }
            };

            let size = slice.len();
            attempted.extend(slice.iter().map(|job| job.file));
            debug!("Folder {}: starting wave of {}", folder, size);

            join_all(slice.into_iter().map(|job| self.convert_file(folder, job, ctx))).await;

            if ctx.cancel.is_cancelled() {
                break;
            }

            match self.store.finish_wave(folder) {
                Ok((speed, eta_seconds)) => self.progress.emit(ProgressEvent::WaveCompleted {
                    folder,
                    size,
                    speed,
                    eta_seconds,
                }),
                Err(e) => {
                    warn!("Folder {} left the run: {}", folder, e);
                    return;
                }
            }
        }

        if self.store.complete_folder(folder, &ctx.cancel) {
            info!("Folder {} completed", folder);
            self.progress.emit(ProgressEvent::FolderCompleted { folder });
        }
    }

    async fn convert_file(&self, folder: FolderId, job: FileJob, ctx: &RunContext<'_>) {
        let _permit = match &ctx.limiter {
            Some(limiter) => tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                permit = limiter.acquire() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
            },
            None => None,
        };

        let Some(source) = self.store.start_file(folder, job.file, &ctx.cancel) else {
            return;
        };

        self.progress.emit(ProgressEvent::FileStarted {
            folder,
            file: job.file,
            name: job.name.clone(),
        });

        let started = Instant::now();
        let outcome = self
            .engine
            .convert(source, &job.name, job.mode, ctx.settings, &ctx.cancel)
            .await;
        let elapsed = started.elapsed();

        if let Err(e) = &outcome {
            if !e.is_cancellation() {
                warn!("Failed to convert {}: {}", job.name, e);
            }
        }

        if let Some(applied) =
            self.store
                .apply_outcome(folder, job.file, outcome, elapsed, &ctx.cancel)
        {
            self.progress.emit(ProgressEvent::FileFinished {
                folder,
                file: job.file,
                name: applied.name,
                error: applied.error,
                elapsed,
            });
        }
    }
}
