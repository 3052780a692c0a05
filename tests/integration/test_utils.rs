//! Test utilities for integration tests.
//!
//! This module provides a synthetic slide backend whose pixels follow a known
//! pattern, call counters for verifying read behavior, and an in-memory
//! storage resolver.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use wsi_service::{
    has_extension, Channel, ChannelColor, Extent, Level, PixelBuffer, PixelSizeNm, ResolveError,
    SlideBackend, SlideError, SlideHandle, SlideInfo, SlideReader, StorageAddress,
    StorageResolver,
};

// =============================================================================
// Pixel Pattern
// =============================================================================

/// Value of channel `c` at `(x, y)` of `level` for every mock slide.
pub fn pattern(level: usize, channel: usize, x: u32, y: u32) -> u64 {
    (x as u64 + 3 * y as u64 + 7 * channel as u64 + 11 * level as u64) % 251
}

/// Build a buffer of the pattern for a rectangle of `level`.
pub fn pattern_buffer(
    level: usize,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    channels: usize,
    bit_depth: u8,
) -> PixelBuffer {
    let mut samples = Vec::with_capacity((width * height) as usize * channels);
    for c in 0..channels {
        for row in 0..height {
            for col in 0..width {
                samples.push(pattern(level, c, x + col, y + row));
            }
        }
    }
    let result = match bit_depth {
        8 => PixelBuffer::new(
            width,
            height,
            channels,
            samples.into_iter().map(|v| v as u8).collect::<Vec<_>>(),
        ),
        16 => PixelBuffer::new(
            width,
            height,
            channels,
            samples.into_iter().map(|v| (v * 100) as u16).collect::<Vec<_>>(),
        ),
        _ => PixelBuffer::new(width, height, channels, samples),
    };
    result.unwrap()
}

// =============================================================================
// Mock Slide
// =============================================================================

/// Shape of a synthetic slide.
#[derive(Debug, Clone, Copy)]
pub struct MockSlideSpec {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    /// Number of levels, each half the size of the previous one
    pub levels: usize,
    pub channels: usize,
    pub bit_depth: u8,
}

impl Default for MockSlideSpec {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 1000,
            tile_size: 256,
            levels: 3,
            channels: 3,
            bit_depth: 8,
        }
    }
}

impl MockSlideSpec {
    pub fn info(&self, id: &str) -> SlideInfo {
        let levels = (0..self.levels)
            .map(|i| {
                let factor = 1u32 << i;
                Level {
                    extent: Extent::new(self.width / factor, self.height / factor),
                    downsample_factor: factor as f64,
                    generated: false,
                }
            })
            .collect();
        let channels = (0..self.channels)
            .map(|id| Channel {
                id,
                name: format!("Channel {}", id),
                color: ChannelColor::rgb(255, 255, 255),
                bit_depth: self.bit_depth,
            })
            .collect();

        SlideInfo {
            id: id.to_string(),
            extent: Extent::new(self.width, self.height),
            pixel_size_nm: PixelSizeNm {
                x: 250.0,
                y: 250.0,
                z: None,
            },
            channels,
            channel_depth: self.bit_depth,
            tile_extent: Extent::new(self.tile_size, self.tile_size),
            levels,
        }
    }
}

/// Calls observed on mock slides.
#[derive(Debug, Default)]
pub struct CallLog {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub regions: Mutex<Vec<(usize, u32, u32, u32, u32)>>,
    pub tiles: Mutex<Vec<(usize, u32, u32)>>,
}

impl CallLog {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn regions(&self) -> Vec<(usize, u32, u32, u32, u32)> {
        self.regions.lock().unwrap().clone()
    }

    pub fn tiles(&self) -> Vec<(usize, u32, u32)> {
        self.tiles.lock().unwrap().clone()
    }

    /// Total number of pixel reads of any kind.
    pub fn reads(&self) -> usize {
        self.regions.lock().unwrap().len() + self.tiles.lock().unwrap().len()
    }

    pub fn clear_reads(&self) {
        self.regions.lock().unwrap().clear();
        self.tiles.lock().unwrap().clear();
    }
}

/// An opened synthetic slide.
pub struct MockSlide {
    spec: MockSlideSpec,
    info: SlideInfo,
    log: Arc<CallLog>,
    read_delay: Duration,
}

impl MockSlide {
    pub fn new(spec: MockSlideSpec, id: &str, log: Arc<CallLog>) -> Self {
        Self {
            spec,
            info: spec.info(id),
            log,
            read_delay: Duration::ZERO,
        }
    }

    /// Declare `count` channels in the metadata while reads keep producing
    /// `MockSlideSpec::channels` channels.
    pub fn with_declared_channels(mut self, count: usize) -> Self {
        let declared = MockSlideSpec {
            channels: count,
            ..self.spec
        };
        self.info.channels = declared.info(&self.info.id).channels;
        self
    }

    fn level_extent(&self, level: usize) -> Result<Extent, SlideError> {
        self.info
            .levels
            .get(level)
            .map(|l| l.extent)
            .ok_or(SlideError::UnsupportedLevel {
                level,
                max_levels: self.info.levels.len(),
            })
    }

    async fn delay(&self) {
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
    }
}

#[async_trait]
impl SlideReader for MockSlide {
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
        self.log
            .regions
            .lock()
            .unwrap()
            .push((level, x, y, width, height));
        self.delay().await;

        let extent = self.level_extent(level)?;
        if x as u64 + width as u64 > extent.x as u64 || y as u64 + height as u64 > extent.y as u64
        {
            return Err(SlideError::OutOfBounds {
                level,
                x,
                y,
                width,
                height,
            });
        }
        Ok(pattern_buffer(
            level,
            x,
            y,
            width,
            height,
            self.spec.channels,
            self.spec.bit_depth,
        ))
    }

    async fn get_tile(
        &self,
        level: usize,
        tile_x: u32,
        tile_y: u32,
    ) -> Result<PixelBuffer, SlideError> {
        self.log.tiles.lock().unwrap().push((level, tile_x, tile_y));
        self.delay().await;

        let extent = self.level_extent(level)?;
        let size = self.spec.tile_size;
        let (x, y) = (tile_x * size, tile_y * size);
        if x >= extent.x || y >= extent.y {
            return Err(SlideError::OutOfBounds {
                level,
                x,
                y,
                width: size,
                height: size,
            });
        }
        // Edge tiles are clipped to the level
        let width = size.min(extent.x - x);
        let height = size.min(extent.y - y);
        Ok(pattern_buffer(
            level,
            x,
            y,
            width,
            height,
            self.spec.channels,
            self.spec.bit_depth,
        ))
    }

    async fn get_thumbnail(
        &self,
        max_width: u32,
        max_height: u32,
    ) -> Result<PixelBuffer, SlideError> {
        let width = max_width.min(self.spec.width);
        let height = max_height.min(self.spec.height);
        Ok(pattern_buffer(
            0,
            0,
            0,
            width,
            height,
            self.spec.channels,
            self.spec.bit_depth,
        ))
    }

    async fn get_label(&self) -> Result<PixelBuffer, SlideError> {
        Err(SlideError::NotFound("label".to_string()))
    }

    async fn get_macro(&self) -> Result<PixelBuffer, SlideError> {
        Err(SlideError::NotFound("macro".to_string()))
    }
}

#[async_trait]
impl SlideHandle for MockSlide {
    async fn close(&self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Mock Backend
// =============================================================================

/// A backend producing [`MockSlide`]s for files with given extensions.
pub struct MockBackend {
    name: String,
    extensions: Vec<String>,
    priority: i32,
    spec: MockSlideSpec,
    fail_with: Option<SlideError>,
    read_delay: Duration,
    log: Arc<CallLog>,
}

impl MockBackend {
    pub fn new(name: &str, extensions: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            priority: 0,
            spec: MockSlideSpec::default(),
            fail_with: None,
            read_delay: Duration::ZERO,
            log: Arc::new(CallLog::default()),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_spec(mut self, spec: MockSlideSpec) -> Self {
        self.spec = spec;
        self
    }

    /// Every open fails with `error`.
    pub fn failing(mut self, error: SlideError) -> Self {
        self.fail_with = Some(error);
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Shared call log of every slide this backend opens.
    pub fn log(&self) -> Arc<CallLog> {
        self.log.clone()
    }
}

#[async_trait]
impl SlideBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, path: &Path) -> bool {
        let extensions: Vec<&str> = self.extensions.iter().map(String::as_str).collect();
        has_extension(path, &extensions)
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn supported_extensions(&self) -> Vec<String> {
        self.extensions.clone()
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn SlideHandle>, SlideError> {
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        let mut slide = MockSlide::new(self.spec, &path.display().to_string(), self.log.clone());
        slide.read_delay = self.read_delay;
        Ok(Box::new(slide))
    }
}

// =============================================================================
// Mock Resolver
// =============================================================================

/// In-memory slide id to path mapping.
#[derive(Default)]
pub struct MockResolver {
    slides: HashMap<String, PathBuf>,
    unavailable: bool,
    lookups: AtomicUsize,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slide(mut self, slide_id: &str, path: impl Into<PathBuf>) -> Self {
        self.slides.insert(slide_id.to_string(), path.into());
        self
    }

    /// Every lookup fails as if the mapping service were down.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageResolver for MockResolver {
    async fn resolve(&self, slide_id: &str) -> Result<StorageAddress, ResolveError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(ResolveError::Unavailable("connection refused".to_string()));
        }
        self.slides
            .get(slide_id)
            .map(StorageAddress::single)
            .ok_or_else(|| ResolveError::NotFound(slide_id.to_string()))
    }
}
