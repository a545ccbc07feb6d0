use std::borrow::Cow;
use std::io::Cursor;

use camino::Utf8Path;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ImageFormat};

use crate::transform::Transform;

/// Re-encodes raster images in their own format with stronger settings.
///
/// PNG files are recompressed losslessly, JPEG files are re-encoded at the
/// configured quality. Other formats, and results that would come out larger
/// than the source, are passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransform {
    jpeg_quality: u8,
}

impl Default for ImageTransform {
    fn default() -> Self {
        // A sensible default for most web images
        Self { jpeg_quality: 80 }
    }
}

impl ImageTransform {
    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    fn encode(&self, format: ImageFormat, img: &DynamicImage) -> anyhow::Result<Option<Vec<u8>>> {
        let mut out = Cursor::new(Vec::new());

        match format {
            ImageFormat::Png => {
                let encoder = PngEncoder::new_with_quality(
                    &mut out,
                    CompressionType::Best,
                    FilterType::Adaptive,
                );
                img.write_with_encoder(encoder)?;
            }
            ImageFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut out, self.jpeg_quality);
                DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;
            }
            _ => return Ok(None),
        }

        Ok(Some(out.into_inner()))
    }
}

impl Transform for ImageTransform {
    fn identity(&self) -> &str {
        "image"
    }

    fn version(&self) -> Cow<'_, str> {
        Cow::Owned(format!("png-best;jpeg-q{}", self.jpeg_quality))
    }

    fn apply(&self, path: &Utf8Path, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let format = image::guess_format(input)?;

        if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
            tracing::debug!("{path}: {format:?} is copied as-is");
            return Ok(input.to_vec());
        }

        let img = image::load_from_memory_with_format(input, format)?;

        match self.encode(format, &img)? {
            Some(out) if out.len() < input.len() => Ok(out),
            _ => Ok(input.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png_fixture() -> Vec<u8> {
        let img = RgbaImage::from_fn(32, 32, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            }
        });

        // Store uncompressed so that recompression has something to win.
        let mut out = Cursor::new(Vec::new());
        let encoder =
            PngEncoder::new_with_quality(&mut out, CompressionType::Fast, FilterType::NoFilter);
        DynamicImage::ImageRgba8(img).write_with_encoder(encoder).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_png_stays_png() {
        let input = png_fixture();
        let out = ImageTransform::default()
            .apply(Utf8Path::new("a.png"), &input)
            .unwrap();

        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
        assert!(out.len() <= input.len());
    }

    #[test]
    fn test_not_an_image() {
        assert!(
            ImageTransform::default()
                .apply(Utf8Path::new("a.png"), b"plain text")
                .is_err()
        );
    }

    #[test]
    fn test_quality_changes_version() {
        let a = ImageTransform::default();
        let b = ImageTransform::default().jpeg_quality(60);
        assert_ne!(a.version(), b.version());
    }
}
