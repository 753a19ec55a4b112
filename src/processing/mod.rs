//! Per-file conversion: decode, downscale, trace inside a worker

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ConversionMode, ConversionSettings};
use crate::error::{ErrorContext, Result, SvgBatchError};

pub mod archive;
pub mod decode;
pub mod trace;
pub mod validation;
pub mod worker;

pub use archive::*;
pub use decode::*;
pub use trace::*;
pub use validation::*;
pub use worker::*;

/// Output of one successful conversion
#[derive(Debug, Clone)]
pub struct ConvertedSvg {
    pub svg: String,
    /// Dimensions of the pixels that were traced
    pub width: u32,
    pub height: u32,
}

/// Converts a single source blob to SVG
pub struct ConversionEngine {
    decoder: ImageDecoder,
    tracer: Arc<dyn Tracer>,
}

impl ConversionEngine {
    /// Create an engine with the default decoder
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        Self::with_decoder(ImageDecoder::default(), tracer)
    }

    pub fn with_decoder(decoder: ImageDecoder, tracer: Arc<dyn Tracer>) -> Self {
        Self { decoder, tracer }
    }

    /// Engine backed by `vtracer`
    pub fn vtracer(decoder: ImageDecoder) -> Self {
        Self::with_decoder(decoder, Arc::new(VtracerBackend::new()))
    }

    /// Run one file through decode and trace.
    ///
    /// Returns [`SvgBatchError::Cancelled`] as soon as `cancel` fires; any
    /// worker still running is torn down and its result discarded.
    pub async fn convert(
        &self,
        source: Arc<[u8]>,
        file_name: &str,
        mode: ConversionMode,
        settings: &ConversionSettings,
        cancel: &CancellationToken,
    ) -> Result<ConvertedSvg> {
        if cancel.is_cancelled() {
            return Err(SvgBatchError::Cancelled);
        }

        let pixels = self
            .decode(source, settings.downscale_limit(), cancel)
            .await
            .with_file_context(file_name)?;
        let (width, height) = (pixels.width(), pixels.height());

        let job = TraceJob {
            file_name: file_name.to_string(),
            pixels,
            params: TraceParams::resolve(mode, settings),
        };

        let svg = WorkerChannel::spawn(job, Arc::clone(&self.tracer))
            .settle(cancel)
            .await?;

        debug!("Converted {} ({}x{}, {} bytes of SVG)", file_name, width, height, svg.len());

        Ok(ConvertedSvg { svg, width, height })
    }

    async fn decode(
        &self,
        source: Arc<[u8]>,
        max_width: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<PixelBuffer> {
        let decoder = self.decoder.clone();
        let task = tokio::task::spawn_blocking(move || decoder.decode_for_trace(&source, max_width));

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(SvgBatchError::Cancelled),

            joined = task => joined.map_err(|e| {
                SvgBatchError::channel_fault(format!("Decode task failed: {}", e))
            })?,
        }
    }
}
