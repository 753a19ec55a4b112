//! svgbatch - Concurrent batch raster-to-SVG conversion
//!
//! Converts folders of PNG and JPEG images to SVG. Files are grouped by
//! folder, converted in concurrency-bounded waves through isolated workers,
//! and collected into ZIP archives. Runs can be paused, resumed and cancelled
//! while in flight.
//!
//! # Features
//!
//! - **Folder queues**: up to 3 folders of 120 images each
//! - **Bounded concurrency**: 1-8 conversions per folder wave, or a global cap
//! - **Isolated workers**: a crashing conversion fails one file, not the run
//! - **Live progress**: per-folder speed and ETA, broadcast progress events
//! - **Two modes**: crisp black & white, or 4-level posterized grayscale
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use svgbatch::{BatchScheduler, ConversionMode, ConversionSettings, StateStore};
//! use svgbatch::processing::{read_folder, VtracerBackend};
//!
//! # async fn run() -> svgbatch::Result<()> {
//! let store = Arc::new(StateStore::default());
//! let upload = read_folder(Path::new("logos")).await?;
//! store.add_folder(upload, ConversionMode::BlackWhite)?;
//!
//! let scheduler = BatchScheduler::with_tracer(Arc::clone(&store), Arc::new(VtracerBackend::new()));
//! let stats = scheduler.start_all(ConversionSettings::new().concurrency(4)).await?;
//! println!("{} converted, {} failed", stats.converted, stats.failed);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod parallel;
pub mod processing;

// Re-export commonly used types
pub use config::{ConcurrencyScope, Config, ConversionMode, ConversionProfile, ConversionSettings};
pub use error::{Result, SvgBatchError};
pub use parallel::{
    BatchScheduler, ControlAction, FinalReport, FolderStatus, FileStatus, GlobalStats,
    ProgressEvent, StateSnapshot, StateStore,
};
pub use processing::{ConversionEngine, Selection, Tracer, VtracerBackend};

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging with the default subscriber
///
/// Honors `RUST_LOG`, falling back to `info`. Safe to call more than once;
/// only the first call installs a subscriber.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish(),
    )
    .is_ok()
    {
        debug!("svgbatch v{} initialized", VERSION);
    }

    log_capabilities();
    Ok(())
}

/// Initialize logging from a [`Config`]
pub fn init_with_config(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.logging.level)
        .map_err(|e| SvgBatchError::config(format!("Invalid log level '{}': {}", config.logging.level, e)))?;

    let installed = if config.logging.json_format {
        tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish(),
        )
        .is_ok()
    } else {
        tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish(),
        )
        .is_ok()
    };

    if installed {
        info!("svgbatch v{} initialized with custom config", VERSION);
    }

    log_capabilities();
    Ok(())
}

fn log_capabilities() {
    debug!("Worker threads available: {}", num_cpus::get());
    debug!(
        "Decoders: PNG {}, JPEG {}",
        image::ImageFormat::Png.can_read(),
        image::ImageFormat::Jpeg.can_read()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_init() {
        // Should not fail on multiple calls
        let _ = init();
        let _ = init();
    }

    #[test]
    fn test_init_with_default_config() {
        assert!(init_with_config(&Config::default()).is_ok());
    }
}
