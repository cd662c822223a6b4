use std::path::Path;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use ocrd_browser_core::{DecodeError, DecodedImage, ImageDecoder, PreviewImage};
use tracing::{debug, instrument};

const PLACEHOLDER_SIZE: u32 = 48;
const PLACEHOLDER_FILL: [u8; 4] = [210, 210, 210, 255];
const PLACEHOLDER_FRAME: [u8; 4] = [120, 120, 120, 255];
const PLACEHOLDER_FRAME_WIDTH: u32 = 3;

/// Decodes page images from disk with the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageDecoder {
    filter: ScaleFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScaleFilter {
    Nearest,
    #[default]
    Triangle,
    Lanczos3,
}

impl From<ScaleFilter> for FilterType {
    fn from(filter: ScaleFilter) -> Self {
        match filter {
            ScaleFilter::Nearest => FilterType::Nearest,
            ScaleFilter::Triangle => FilterType::Triangle,
            ScaleFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

impl FileImageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(filter: ScaleFilter) -> Self {
        Self { filter }
    }

    pub fn decode(&self, path: &Path) -> Result<DynamicImage, DecodeError> {
        ImageReader::open(path)?
            .with_guessed_format()?
            .decode()
            .map_err(|err| DecodeError::Format(err.to_string()))
    }
}

impl ImageDecoder for FileImageDecoder {
    #[instrument(skip(self))]
    fn decode_scaled(&self, path: &Path, target_width: u32) -> Result<DecodedImage, DecodeError> {
        let image = self.decode(path)?;
        let thumbnail = scale_to_width(&image, target_width, self.filter);
        debug!(
            width = image.width(),
            height = image.height(),
            thumb_height = thumbnail.height,
            "decoded page image"
        );
        Ok(DecodedImage {
            original_width: image.width(),
            original_height: image.height(),
            thumbnail,
        })
    }
}

/// Resizes `image` to exactly `width` pixels wide, keeping the aspect ratio.
pub fn scale_to_width(image: &DynamicImage, width: u32, filter: ScaleFilter) -> PreviewImage {
    let width = width.max(1);
    let height = scaled_height(image.width(), image.height(), width);
    let resized = image.resize_exact(width, height, filter.into()).to_rgba8();
    PreviewImage {
        width,
        height,
        pixels: resized.into_raw(),
    }
}

fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    if width == 0 {
        return 1;
    }
    let scaled = (f64::from(height) * f64::from(target_width) / f64::from(width)).round();
    (scaled as u32).max(1)
}

/// Framed grey square shown for rows that are not realized yet or failed to load.
pub fn loading_placeholder() -> Arc<PreviewImage> {
    let mut image = PreviewImage::placeholder(PLACEHOLDER_SIZE, PLACEHOLDER_FILL);
    let size = image.width;
    for y in 0..size {
        for x in 0..size {
            let on_frame = x < PLACEHOLDER_FRAME_WIDTH
                || y < PLACEHOLDER_FRAME_WIDTH
                || x >= size - PLACEHOLDER_FRAME_WIDTH
                || y >= size - PLACEHOLDER_FRAME_WIDTH;
            if on_frame {
                let offset = ((y * size + x) * 4) as usize;
                image.pixels[offset..offset + 4].copy_from_slice(&PLACEHOLDER_FRAME);
            }
        }
    }
    Arc::new(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::tempdir;

    #[test]
    fn decode_scaled_keeps_aspect_ratio() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("page.png");
        RgbaImage::from_pixel(200, 300, Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let decoded = FileImageDecoder::new().decode_scaled(&path, 100).unwrap();
        assert_eq!(decoded.original_width, 200);
        assert_eq!(decoded.original_height, 300);
        assert_eq!(decoded.thumbnail.width, 100);
        assert_eq!(decoded.thumbnail.height, 150);
        assert_eq!(decoded.thumbnail.pixels.len(), 100 * 150 * 4);
        assert_eq!(&decoded.thumbnail.pixels[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let result = FileImageDecoder::new().decode_scaled(&dir.path().join("gone.png"), 100);
        assert!(matches!(result, Err(DecodeError::Io(_))));
    }

    #[test]
    fn garbage_is_a_format_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("page.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        let result = FileImageDecoder::with_filter(ScaleFilter::Nearest).decode_scaled(&path, 100);
        assert!(matches!(result, Err(DecodeError::Format(_))));
    }

    #[test]
    fn scaled_height_never_collapses() {
        assert_eq!(scaled_height(1000, 1, 100), 1);
        assert_eq!(scaled_height(0, 10, 100), 1);
        assert_eq!(scaled_height(100, 100, 100), 100);
    }

    #[test]
    fn placeholder_has_a_frame() {
        let image = loading_placeholder();
        assert_eq!(image.width, PLACEHOLDER_SIZE);
        assert_eq!(&image.pixels[..4], &PLACEHOLDER_FRAME);
        let center = ((PLACEHOLDER_SIZE / 2 * PLACEHOLDER_SIZE + PLACEHOLDER_SIZE / 2) * 4) as usize;
        assert_eq!(&image.pixels[center..center + 4], &PLACEHOLDER_FILL);
    }
}
