//! Trace adapter: maps a conversion mode and settings onto the vectorizer

use image::RgbaImage;
use rayon::prelude::*;
use tracing::debug;

use crate::config::{ConversionMode, ConversionSettings};
use crate::error::{Result, SvgBatchError};
use crate::processing::decode::PixelBuffer;

/// Parameters handed to the tracing routine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceParams {
    /// Number of gray levels the image is quantized to before tracing
    pub colors: u8,
    /// Straight-line fitting tolerance
    pub line_threshold: f32,
    /// Curve fitting tolerance
    pub curve_threshold: f32,
    /// Paths enclosing fewer pixels than this are dropped
    pub path_omit: usize,
    /// Gaussian blur sigma applied first; 0 disables blurring
    pub blur_radius: f32,
}

impl TraceParams {
    /// Mode defaults
    pub fn for_mode(mode: ConversionMode) -> Self {
        match mode {
            ConversionMode::BlackWhite => Self {
                colors: 2,
                line_threshold: 0.5,
                curve_threshold: 1.0,
                path_omit: 8,
                blur_radius: 0.0,
            },
            ConversionMode::Posterize => Self {
                colors: 4,
                line_threshold: 1.0,
                curve_threshold: 1.0,
                path_omit: 8,
                blur_radius: 1.0,
            },
        }
    }

    /// Apply user settings on top of the mode defaults
    pub fn with_settings(mut self, settings: &TraceSettings) -> Self {
        if let Some(smoothness) = settings.smoothness {
            self.line_threshold *= smoothness;
            self.curve_threshold *= smoothness;
        }
        if let Some(level) = settings.noise_reduction {
            self.blur_radius = f32::from(level);
        }
        self
    }

    /// Mode defaults modulated by the run's settings snapshot
    pub fn resolve(mode: ConversionMode, settings: &ConversionSettings) -> Self {
        Self::for_mode(mode).with_settings(&TraceSettings::from(settings))
    }
}

/// Optional tuning knobs; `None` keeps the mode default
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TraceSettings {
    pub smoothness: Option<f32>,
    pub noise_reduction: Option<u8>,
}

impl From<&ConversionSettings> for TraceSettings {
    fn from(settings: &ConversionSettings) -> Self {
        Self {
            smoothness: Some(settings.smoothness),
            noise_reduction: Some(settings.noise_reduction),
        }
    }
}

/// The external vectorization routine
pub trait Tracer: Send + Sync {
    /// Convert pixels to SVG markup
    fn trace(&self, pixels: &PixelBuffer, params: &TraceParams) -> Result<String>;
}

/// Tracer backed by the `vtracer` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct VtracerBackend;

impl VtracerBackend {
    pub fn new() -> Self {
        Self
    }

    fn vtracer_config(params: &TraceParams) -> vtracer::Config {
        let color_mode = if params.colors <= 2 {
            vtracer::ColorMode::Binary
        } else {
            vtracer::ColorMode::Color
        };

        vtracer::Config {
            color_mode,
            filter_speckle: params.path_omit,
            // Pixels are already quantized, so keep every remaining level
            color_precision: 8,
            layer_difference: 1,
            length_threshold: f64::from((4.0 * params.line_threshold).clamp(3.5, 10.0)),
            corner_threshold: (60.0 * params.curve_threshold).clamp(0.0, 180.0) as i32,
            path_precision: Some(2),
            ..vtracer::Config::default()
        }
    }
}

impl Tracer for VtracerBackend {
    fn trace(&self, pixels: &PixelBuffer, params: &TraceParams) -> Result<String> {
        let prepared = prepare_pixels(pixels.as_image(), params);
        let (width, height) = prepared.dimensions();

        debug!(
            "Tracing {}x{} with {} levels, blur {:.1}",
            width, height, params.colors, params.blur_radius
        );

        let image = visioncortex::ColorImage {
            pixels: prepared.into_raw(),
            width: width as usize,
            height: height as usize,
        };

        let svg = vtracer::convert(image, Self::vtracer_config(params))
            .map_err(SvgBatchError::tracing)?;

        Ok(svg.to_string())
    }
}

/// Blur and posterize pixels the way the tracer expects them
pub fn prepare_pixels(image: &RgbaImage, params: &TraceParams) -> RgbaImage {
    let mut prepared = if params.blur_radius > 0.0 {
        imageproc::filter::gaussian_blur_f32(image, params.blur_radius)
    } else {
        image.clone()
    };

    quantize_gray(&mut prepared, params.colors);
    prepared
}

/// Flatten alpha onto white and reduce to `levels` evenly spaced grays
pub fn quantize_gray(image: &mut RgbaImage, levels: u8) {
    let levels = u32::from(levels.max(2));
    let step = 255 / (levels - 1);

    let raw: &mut [u8] = image;
    raw.par_chunks_mut(4).for_each(|px| {
        let alpha = u32::from(px[3]);
        let luma = (299 * u32::from(px[0]) + 587 * u32::from(px[1]) + 114 * u32::from(px[2])) / 1000;
        let flattened = (luma * alpha + 255 * (255 - alpha)) / 255;

        let bucket = (flattened * levels / 256).min(levels - 1);
        let value = (bucket * step).min(255) as u8;

        px[0] = value;
        px[1] = value;
        px[2] = value;
        px[3] = 255;
    });
}
