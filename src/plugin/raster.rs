//! Backend for plain raster images (PNG, JPEG).
//!
//! Single-resolution images are decoded once at open time. Lower pyramid
//! levels are synthesized by halving until the image fits in one tile, and
//! are flagged as generated in the [`SlideInfo`]. There are no associated
//! label or macro images.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage};
use tracing::debug;

use crate::error::SlideError;
use crate::slide::{
    rgb_channels, Channel, ChannelColor, Extent, Level, PixelBuffer, PixelData, PixelSizeNm,
    SlideHandle, SlideInfo, SlideReader,
};

use super::backend::{has_extension, SlideBackend};

/// Plugin name of the raster backend.
pub const RASTER_PLUGIN_NAME: &str = "raster";

/// Tile extent reported for raster images.
pub const RASTER_TILE_SIZE: u32 = 256;

const RASTER_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

// =============================================================================
// Backend
// =============================================================================

/// Opens PNG and JPEG files as single-level slides with generated levels.
#[derive(Debug, Clone, Default)]
pub struct RasterBackend {
    priority: i32,
}

impl RasterBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a priority other than the default 0.
    pub fn with_priority(priority: i32) -> Self {
        Self { priority }
    }
}

#[async_trait]
impl SlideBackend for RasterBackend {
    fn name(&self) -> &str {
        RASTER_PLUGIN_NAME
    }

    fn supports(&self, path: &Path) -> bool {
        has_extension(path, RASTER_EXTENSIONS)
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn supported_extensions(&self) -> Vec<String> {
        RASTER_EXTENSIONS.iter().map(|e| e.to_string()).collect()
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn SlideHandle>, SlideError> {
        let owned: PathBuf = path.to_path_buf();
        let image = tokio::task::spawn_blocking(move || image::open(&owned))
            .await
            .map_err(|e| SlideError::Io(format!("decode task failed: {}", e)))?
            .map_err(|e| match e {
                image::ImageError::IoError(io) => SlideError::from(io),
                other => SlideError::Decode(other.to_string()),
            })?;

        let slide = RasterSlide::from_image(path.display().to_string(), image)?;
        debug!(
            "Raster slide {} has {} levels",
            slide.info.id,
            slide.info.levels.len()
        );
        Ok(Box::new(slide))
    }
}

// =============================================================================
// Slide
// =============================================================================

struct RasterData {
    /// Full resolution image, kept for thumbnails
    base: DynamicImage,
    /// One buffer per pyramid level
    levels: Vec<PixelBuffer>,
}

/// An opened raster image.
pub struct RasterSlide {
    info: SlideInfo,
    data: RwLock<Option<RasterData>>,
}

impl RasterSlide {
    /// Build a slide from a decoded image.
    pub fn from_image(id: String, image: DynamicImage) -> Result<Self, SlideError> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(SlideError::Decode("image is empty".to_string()));
        }

        let base_buffer = to_pixel_buffer(&image)?;
        let channel_count = base_buffer.channels();
        let bit_depth = base_buffer.bit_depth();

        let mut levels = vec![Level {
            extent: Extent::new(width, height),
            downsample_factor: 1.0,
            generated: false,
        }];
        let mut buffers = vec![base_buffer];

        let mut downsample = 1.0;
        loop {
            let previous = levels[levels.len() - 1].extent;
            if previous.x.max(previous.y) <= RASTER_TILE_SIZE || previous.x.min(previous.y) < 2 {
                break;
            }
            downsample *= 2.0;
            let level_w = ((width as f64 / downsample).round() as u32).max(1);
            let level_h = ((height as f64 / downsample).round() as u32).max(1);
            let resized = image.resize_exact(level_w, level_h, FilterType::Triangle);
            buffers.push(to_pixel_buffer(&resized)?);
            levels.push(Level {
                extent: Extent::new(level_w, level_h),
                downsample_factor: downsample,
                generated: true,
            });
        }

        let channels = if channel_count == 1 {
            vec![Channel {
                id: 0,
                name: "Luminance".to_string(),
                color: ChannelColor::rgb(255, 255, 255),
                bit_depth,
            }]
        } else {
            rgb_channels(bit_depth)
        };

        let info = SlideInfo {
            id,
            extent: Extent::new(width, height),
            // Plain raster files carry no physical pixel size
            pixel_size_nm: PixelSizeNm::default(),
            channels,
            channel_depth: bit_depth,
            tile_extent: Extent::new(RASTER_TILE_SIZE, RASTER_TILE_SIZE),
            levels,
        };

        Ok(Self {
            info,
            data: RwLock::new(Some(RasterData {
                base: image,
                levels: buffers,
            })),
        })
    }

    fn with_level<T>(
        &self,
        level: usize,
        f: impl FnOnce(&PixelBuffer) -> Result<T, SlideError>,
    ) -> Result<T, SlideError> {
        let guard = self.data.read().map_err(|_| SlideError::Closed)?;
        let data = guard.as_ref().ok_or(SlideError::Closed)?;
        let buffer = data.levels.get(level).ok_or(SlideError::UnsupportedLevel {
            level,
            max_levels: data.levels.len(),
        })?;
        f(buffer)
    }
}

#[async_trait]
impl SlideReader for RasterSlide {
    fn get_info(&self) -> &SlideInfo {
        &self.info
    }

    async fn get_region(
        &self,
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<PixelBuffer, SlideError> {
        self.with_level(level, |buffer| {
            let fits_x = x.checked_add(width).is_some_and(|end| end <= buffer.width());
            let fits_y = y.checked_add(height).is_some_and(|end| end <= buffer.height());
            if width == 0 || height == 0 || !fits_x || !fits_y {
                return Err(SlideError::OutOfBounds {
                    level,
                    x,
                    y,
                    width,
                    height,
                });
            }
            Ok(buffer.crop(x, y, width, height))
        })
    }

    async fn get_tile(
        &self,
        level: usize,
        tile_x: u32,
        tile_y: u32,
    ) -> Result<PixelBuffer, SlideError> {
        let tile = self.info.tile_extent;
        self.with_level(level, |buffer| {
            let x = tile_x.checked_mul(tile.x).filter(|&x| x < buffer.width());
            let y = tile_y.checked_mul(tile.y).filter(|&y| y < buffer.height());
            match (x, y) {
                (Some(x), Some(y)) => Ok(buffer.crop(x, y, tile.x, tile.y)),
                _ => Err(SlideError::OutOfBounds {
                    level,
                    x: tile_x.saturating_mul(tile.x),
                    y: tile_y.saturating_mul(tile.y),
                    width: tile.x,
                    height: tile.y,
                }),
            }
        })
    }

    async fn get_thumbnail(
        &self,
        max_width: u32,
        max_height: u32,
    ) -> Result<PixelBuffer, SlideError> {
        let guard = self.data.read().map_err(|_| SlideError::Closed)?;
        let data = guard.as_ref().ok_or(SlideError::Closed)?;
        let thumbnail = data.base.thumbnail(max_width.max(1), max_height.max(1));
        to_pixel_buffer(&thumbnail)
    }

    async fn get_label(&self) -> Result<PixelBuffer, SlideError> {
        Err(SlideError::NotFound("label".to_string()))
    }

    async fn get_macro(&self) -> Result<PixelBuffer, SlideError> {
        Err(SlideError::NotFound("macro".to_string()))
    }
}

#[async_trait]
impl SlideHandle for RasterSlide {
    async fn close(&self) {
        if let Ok(mut guard) = self.data.write() {
            guard.take();
        }
    }
}

// =============================================================================
// Conversion
// =============================================================================

/// Convert a decoded image to a channel-major buffer.
///
/// Grayscale images keep one channel; everything else becomes RGB. Alpha is
/// dropped. 16-bit images stay 16-bit.
fn to_pixel_buffer(image: &DynamicImage) -> Result<PixelBuffer, SlideError> {
    let (width, height) = (image.width(), image.height());
    match image.color() {
        ColorType::L8 | ColorType::La8 => {
            PixelBuffer::new(width, height, 1, image.to_luma8().into_raw())
        }
        ColorType::L16 | ColorType::La16 => {
            PixelBuffer::new(width, height, 1, image.to_luma16().into_raw())
        }
        ColorType::Rgb16 | ColorType::Rgba16 => {
            planar(width, height, 3, image.to_rgb16().into_raw())
        }
        _ => planar(width, height, 3, image.to_rgb8().into_raw()),
    }
}

fn planar<T>(width: u32, height: u32, channels: usize, interleaved: Vec<T>) -> Result<PixelBuffer, SlideError>
where
    T: Copy + Default,
    Vec<T>: Into<PixelData>,
{
    let plane = width as usize * height as usize;
    let mut out = vec![T::default(); interleaved.len()];
    for (i, pixel) in interleaved.chunks_exact(channels).enumerate() {
        for (c, &sample) in pixel.iter().enumerate() {
            out[c * plane + i] = sample;
        }
    }
    PixelBuffer::new(width, height, channels, out)
}
