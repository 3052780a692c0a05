//! Region and tile normalization.
//!
//! Callers may ask for rectangles that are partially or entirely outside a
//! pyramid level. The engine turns every such request into a buffer of
//! exactly the requested size:
//!
//! ```text
//!   requested rectangle            level extent
//!   ┌───────────────────┐
//!   │  background       │
//!   │      ┌────────────┼──────────────┐
//!   │      │  overlap   │              │
//!   │      │  (1 read)  │              │
//!   └──────┼────────────┘              │
//!          │                           │
//!          └───────────────────────────┘
//! ```
//!
//! - no overlap: zero reads, the result is filled with the background
//! - full overlap: one read, returned unchanged
//! - partial overlap: one read of the clamped rectangle, pasted onto a
//!   background canvas
//!
//! Filling a canvas without any read still needs the channel count and bit
//! depth the backend produces. That layout is learned from a 1x1 sample read
//! the first time it is needed for a slide level, or for free from any real
//! read, and is remembered afterwards.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::error::RegionError;
use crate::slide::{Background, PixelBuffer, PixelLayout, SlideInfo, SlideReader};

/// Default maximum number of pixels in a region request (2500 x 2500).
pub const DEFAULT_MAX_REGION_PIXELS: u64 = 6_250_000;

/// Number of `(slide, level)` layouts remembered.
const LAYOUT_CACHE_CAPACITY: usize = 4096;

// =============================================================================
// Overlap
// =============================================================================

/// Intersection of a requested rectangle with a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overlap {
    /// Top-left corner of the overlap in level coordinates
    pub src_x: u32,
    pub src_y: u32,

    /// Size of the overlap
    pub width: u32,
    pub height: u32,

    /// Where the overlap lands in the requested rectangle
    pub dst_x: u32,
    pub dst_y: u32,
}

impl Overlap {
    /// Intersect `[start, start + size)` with `[0, level)` on both axes.
    ///
    /// Returns `None` when the intersection is empty.
    pub fn compute(
        start_x: i64,
        start_y: i64,
        size_x: u32,
        size_y: u32,
        level_width: u32,
        level_height: u32,
    ) -> Option<Self> {
        let (src_x, width, dst_x) = intersect(start_x, size_x, level_width)?;
        let (src_y, height, dst_y) = intersect(start_y, size_y, level_height)?;
        Some(Self {
            src_x,
            src_y,
            width,
            height,
            dst_x,
            dst_y,
        })
    }

    /// Whether the overlap covers the whole requested rectangle.
    pub fn covers(&self, size_x: u32, size_y: u32) -> bool {
        self.width == size_x && self.height == size_y
    }
}

/// One-dimensional intersection: `(source start, length, destination offset)`.
fn intersect(start: i64, size: u32, extent: u32) -> Option<(u32, u32, u32)> {
    let begin = start.max(0);
    let end = start.saturating_add(size as i64).min(extent as i64);
    if end <= begin {
        return None;
    }
    Some((begin as u32, (end - begin) as u32, (begin - start) as u32))
}

// =============================================================================
// Engine
// =============================================================================

/// Identifies one level of one opened slide.
///
/// The declared metadata is part of the key, so a slide that is reopened
/// with different metadata (e.g. after its file was replaced) is sampled
/// again instead of reusing the old layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LayoutKey {
    slide_id: String,
    level: usize,
    extent: (u32, u32),
    channels: usize,
    channel_depth: u8,
}

impl LayoutKey {
    fn new(slide_info: &SlideInfo, level: usize) -> Self {
        let extent = slide_info
            .levels
            .get(level)
            .map_or((0, 0), |l| (l.extent.x, l.extent.y));
        Self {
            slide_id: slide_info.id.clone(),
            level,
            extent,
            channels: slide_info.channels.len(),
            channel_depth: slide_info.channel_depth,
        }
    }
}

/// Normalizes region and tile requests against a slide's pyramid.
pub struct RegionGeometryEngine {
    /// Upper bound for `size_x * size_y` of region requests
    max_region_pixels: Option<u64>,

    /// Layout produced by each slide level
    layouts: Mutex<LruCache<LayoutKey, Arc<OnceCell<PixelLayout>>>>,
}

impl Default for RegionGeometryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionGeometryEngine {
    /// Create an engine with the default region size limit.
    pub fn new() -> Self {
        Self::with_max_region_pixels(Some(DEFAULT_MAX_REGION_PIXELS))
    }

    /// Create an engine with a custom region size limit (`None` = unlimited).
    pub fn with_max_region_pixels(max_region_pixels: Option<u64>) -> Self {
        Self {
            max_region_pixels,
            layouts: Mutex::new(LruCache::new(
                NonZeroUsize::new(LAYOUT_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Read an arbitrary rectangle of `level`, padding with `background`.
    ///
    /// The result is always exactly `size_x x size_y`.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_region<R: SlideReader + ?Sized>(
        &self,
        handle: &R,
        slide_info: &SlideInfo,
        level: usize,
        start_x: i64,
        start_y: i64,
        size_x: u32,
        size_y: u32,
        background: &Background,
    ) -> Result<PixelBuffer, RegionError> {
        if size_x == 0 || size_y == 0 {
            return Err(RegionError::InvalidSize {
                width: size_x,
                height: size_y,
            });
        }
        if let Some(max) = self.max_region_pixels {
            let pixels = size_x as u64 * size_y as u64;
            if pixels > max {
                return Err(RegionError::RegionTooLarge { pixels, max });
            }
        }
        let extent = slide_info.level(level)?.extent;

        let Some(overlap) = Overlap::compute(start_x, start_y, size_x, size_y, extent.x, extent.y)
        else {
            let layout = self.layout_for(handle, slide_info, level).await?;
            return PixelBuffer::filled(size_x, size_y, layout, background);
        };

        let read = handle
            .get_region(
                level,
                overlap.src_x,
                overlap.src_y,
                overlap.width,
                overlap.height,
            )
            .await?;
        self.remember_layout(slide_info, level, read.layout()).await;

        if overlap.covers(size_x, size_y) {
            return finish_unpadded(read, size_x, size_y, background);
        }
        compose(read, size_x, size_y, overlap.dst_x, overlap.dst_y, background)
    }

    /// Read tile `(tile_x, tile_y)` of `level`, padding with `background`.
    ///
    /// The result always has the slide's declared tile extent, including
    /// edge tiles and tiles outside the grid.
    pub async fn get_tile<R: SlideReader + ?Sized>(
        &self,
        handle: &R,
        slide_info: &SlideInfo,
        level: usize,
        tile_x: i64,
        tile_y: i64,
        background: &Background,
    ) -> Result<PixelBuffer, RegionError> {
        let extent = slide_info.level(level)?.extent;
        let (tile_w, tile_h) = (slide_info.tile_extent.x, slide_info.tile_extent.y);
        let origin_x = tile_x.saturating_mul(tile_w as i64);
        let origin_y = tile_y.saturating_mul(tile_h as i64);

        let Some(overlap) = Overlap::compute(origin_x, origin_y, tile_w, tile_h, extent.x, extent.y)
        else {
            let layout = self.layout_for(handle, slide_info, level).await?;
            return PixelBuffer::filled(tile_w, tile_h, layout, background);
        };

        if overlap.covers(tile_w, tile_h) {
            // Fully inside, so both indices are non-negative and fit in u32
            let raw = handle
                .get_tile(level, tile_x as u32, tile_y as u32)
                .await?;
            self.remember_layout(slide_info, level, raw.layout()).await;
            return finish_unpadded(raw, tile_w, tile_h, background);
        }

        let read = handle
            .get_region(
                level,
                overlap.src_x,
                overlap.src_y,
                overlap.width,
                overlap.height,
            )
            .await?;
        self.remember_layout(slide_info, level, read.layout()).await;
        compose(read, tile_w, tile_h, overlap.dst_x, overlap.dst_y, background)
    }

    /// Adapt an 8-bit display colour to the samples `level` produces.
    ///
    /// The colour is resolved against the channel count and bit depth of the
    /// backend's buffers, not the declared channel list. A colour with a
    /// different number of values than the buffers have channels collapses to
    /// a scalar.
    pub async fn padding_for<R: SlideReader + ?Sized>(
        &self,
        handle: &R,
        slide_info: &SlideInfo,
        level: usize,
        colour: &Background,
    ) -> Result<Background, RegionError> {
        slide_info.level(level)?;
        let layout = self.layout_for(handle, slide_info, level).await?;
        Ok(colour.adapt_8bit(layout.channels, layout.bit_depth))
    }

    /// Layout of buffers the backend produces for `level`, read at most once.
    async fn layout_for<R: SlideReader + ?Sized>(
        &self,
        handle: &R,
        slide_info: &SlideInfo,
        level: usize,
    ) -> Result<PixelLayout, RegionError> {
        let cell = self.layout_cell(slide_info, level).await;
        let layout = cell
            .get_or_try_init(|| async {
                let extent = slide_info.level(level)?.extent;
                if extent.x == 0 || extent.y == 0 {
                    // Nothing to sample; trust the declared metadata
                    return Ok::<_, RegionError>(PixelLayout {
                        channels: slide_info.channels.len().max(1),
                        bit_depth: slide_info.channel_depth,
                    });
                }
                let sample = handle.get_region(level, 0, 0, 1, 1).await?;
                debug!(
                    "Sampled layout of {} level {}: {} channels, {} bit",
                    slide_info.id,
                    level,
                    sample.channels(),
                    sample.bit_depth()
                );
                Ok(sample.layout())
            })
            .await?;
        Ok(*layout)
    }

    async fn remember_layout(&self, slide_info: &SlideInfo, level: usize, layout: PixelLayout) {
        let cell = self.layout_cell(slide_info, level).await;
        // Already known is fine
        let _ = cell.set(layout);
    }

    async fn layout_cell(&self, slide_info: &SlideInfo, level: usize) -> Arc<OnceCell<PixelLayout>> {
        let mut layouts = self.layouts.lock().await;
        layouts
            .get_or_insert(LayoutKey::new(slide_info, level), || Arc::new(OnceCell::new()))
            .clone()
    }
}

/// Return a read that already covers the request, normalizing its size if
/// the backend returned something else.
fn finish_unpadded(
    read: PixelBuffer,
    width: u32,
    height: u32,
    background: &Background,
) -> Result<PixelBuffer, RegionError> {
    background.resolve(read.channels())?;
    if read.width() == width && read.height() == height {
        return Ok(read);
    }
    compose(read, width, height, 0, 0, background)
}

/// Paste `read` at `(dst_x, dst_y)` onto a background canvas.
fn compose(
    read: PixelBuffer,
    width: u32,
    height: u32,
    dst_x: u32,
    dst_y: u32,
    background: &Background,
) -> Result<PixelBuffer, RegionError> {
    let mut canvas = PixelBuffer::filled(width, height, read.layout(), background)?;
    canvas.paste(&read, dst_x, dst_y)?;
    Ok(canvas)
}
