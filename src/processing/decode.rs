//! Image decoding and pre-trace downscaling

use image::imageops::FilterType;
use image::RgbaImage;
use tracing::debug;

use crate::error::{Result, SvgBatchError};

/// Raster formats accepted for conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Png,
    Jpeg,
}

impl SourceFormat {
    /// MIME type for this format
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }
}

impl From<SourceFormat> for image::ImageFormat {
    fn from(format: SourceFormat) -> Self {
        match format {
            SourceFormat::Png => image::ImageFormat::Png,
            SourceFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }
}

/// Sniff the format from content, ignoring the file name
pub fn detect_format(data: &[u8]) -> Result<SourceFormat> {
    match infer::get(data).map(|kind| kind.mime_type()) {
        Some("image/png") => Ok(SourceFormat::Png),
        Some("image/jpeg") => Ok(SourceFormat::Jpeg),
        Some(other) => Err(SvgBatchError::unsupported_format(other, None)),
        None => Err(SvgBatchError::unsupported_format("unknown", None)),
    }
}

/// Decoded RGBA pixels owned by exactly one conversion
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    image: RgbaImage,
}

impl PixelBuffer {
    /// Wrap an already decoded image
    pub fn from_rgba(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Raw RGBA bytes, row-major
    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn as_image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// Shrink to `max_width` when wider, keeping the aspect ratio
    pub fn downscale(self, max_width: u32) -> Self {
        let (width, height) = downscale_dimensions(self.width(), self.height(), max_width);
        if width == self.width() {
            return self;
        }

        debug!(
            "Downscaling {}x{} -> {}x{}",
            self.width(),
            self.height(),
            width,
            height
        );

        Self {
            image: image::imageops::resize(&self.image, width, height, FilterType::Triangle),
        }
    }
}

/// Target dimensions for a width-limited downscale.
///
/// Images at or under `max_width` are left alone; wider images are scaled so
/// the width equals `max_width` and the height shrinks by the same factor.
pub fn downscale_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if max_width == 0 || width <= max_width {
        return (width, height);
    }

    let scaled = (u64::from(height) * u64::from(max_width)) as f64 / f64::from(width);
    (max_width, (scaled.round() as u32).max(1))
}

/// Image decoder with a pixel-count ceiling
#[derive(Debug, Clone)]
pub struct ImageDecoder {
    max_pixels: u64,
}

impl ImageDecoder {
    /// Create a decoder with the given pixel limit
    pub fn new(max_pixels: u64) -> Self {
        Self { max_pixels }
    }

    /// Decode PNG or JPEG bytes into an RGBA pixel buffer
    pub fn decode(&self, data: &[u8]) -> Result<PixelBuffer> {
        if data.is_empty() {
            return Err(SvgBatchError::decode("file is empty", None));
        }

        let format = detect_format(data)?;
        let reader = image::io::Reader::with_format(std::io::Cursor::new(data), format.into());

        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| SvgBatchError::decode(e.to_string(), None))?;

        if u64::from(width) * u64::from(height) > self.max_pixels {
            return Err(SvgBatchError::image_too_large(width, height, self.max_pixels, None));
        }
        if width == 0 || height == 0 {
            return Err(SvgBatchError::decode("image has no pixels", None));
        }

        let image = image::load_from_memory_with_format(data, format.into())
            .map_err(|e| SvgBatchError::decode(e.to_string(), None))?;

        debug!("Decoded {:?} image {}x{}", format, width, height);

        Ok(PixelBuffer::from_rgba(image.to_rgba8()))
    }

    /// Decode, then downscale when a width limit is given
    pub fn decode_for_trace(&self, data: &[u8], max_width: Option<u32>) -> Result<PixelBuffer> {
        let pixels = self.decode(data)?;
        Ok(match max_width {
            Some(limit) => pixels.downscale(limit),
            None => pixels,
        })
    }
}

impl Default for ImageDecoder {
    fn default() -> Self {
        Self::new(crate::config::LimitsConfig::default().max_image_pixels)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Checkerboard test image encoded in the given format
    pub(crate) fn encode(width: u32, height: u32, format: ImageOutputFormat) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image).write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_downscale_dimensions_preserves_aspect() {
        assert_eq!(downscale_dimensions(1600, 1200, 800), (800, 600));
        assert_eq!(downscale_dimensions(1920, 1080, 1280), (1280, 720));
    }

    #[test]
    fn test_downscale_dimensions_noop_when_narrow() {
        assert_eq!(downscale_dimensions(640, 480, 800), (640, 480));
        assert_eq!(downscale_dimensions(800, 2000, 800), (800, 2000));
    }

    #[test]
    fn test_downscale_never_collapses_height() {
        assert_eq!(downscale_dimensions(10_000, 1, 100), (100, 1));
    }

    #[test]
    fn test_detect_format() {
        let png = encode(8, 8, ImageOutputFormat::Png);
        assert_eq!(detect_format(&png).unwrap(), SourceFormat::Png);

        let jpeg = encode(8, 8, ImageOutputFormat::Jpeg(90));
        assert_eq!(detect_format(&jpeg).unwrap(), SourceFormat::Jpeg);

        assert!(detect_format(b"GIF89a........").is_err());
        assert!(detect_format(b"not an image at all").is_err());
    }

    #[test]
    fn test_decode_png() {
        let png = encode(16, 12, ImageOutputFormat::Png);
        let pixels = ImageDecoder::default().decode(&png).unwrap();
        assert_eq!((pixels.width(), pixels.height()), (16, 12));
        assert_eq!(pixels.as_raw().len(), 16 * 12 * 4);
    }

    #[test]
    fn test_decode_corrupt_png() {
        let mut png = encode(16, 16, ImageOutputFormat::Png);
        png.truncate(40);
        let err = ImageDecoder::default().decode(&png).unwrap_err();
        assert!(matches!(err, SvgBatchError::DecodeError { .. }));
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn test_decode_empty() {
        assert!(ImageDecoder::default().decode(&[]).is_err());
    }

    #[test]
    fn test_decode_pixel_limit() {
        let png = encode(20, 20, ImageOutputFormat::Png);
        let err = ImageDecoder::new(100).decode(&png).unwrap_err();
        assert!(matches!(err, SvgBatchError::ImageTooLarge { width: 20, height: 20, .. }));
    }

    #[test]
    fn test_decode_for_trace_downscales() {
        let png = encode(1600, 1200, ImageOutputFormat::Png);
        let decoder = ImageDecoder::default();

        let pixels = decoder.decode_for_trace(&png, Some(800)).unwrap();
        assert_eq!((pixels.width(), pixels.height()), (800, 600));

        let pixels = decoder.decode_for_trace(&png, None).unwrap();
        assert_eq!((pixels.width(), pixels.height()), (1600, 1200));
    }
}
