//! Slide metadata computed once when a handle is opened.
//!
//! A [`SlideInfo`] is immutable for the lifetime of its handle. Backends build
//! it at open time; the plugin registry calls [`SlideInfo::validate`] before a
//! handle is handed to the cache so every consumer can rely on the pyramid
//! invariants below:
//!
//! - level 0 has downsample factor 1
//! - downsample factors are strictly increasing
//! - each level extent matches level 0 divided by its downsample factor,
//!   within [`LEVEL_EXTENT_TOLERANCE`]
//! - the tile extent is non-zero in both directions

use serde::{Deserialize, Serialize};

use crate::error::{RegionError, SlideError};

/// Relative tolerance between a level's declared extent and the extent
/// derived from its downsample factor. Deviations below one pixel are always
/// accepted.
pub const LEVEL_EXTENT_TOLERANCE: f64 = 0.01;

/// Width, height and depth in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub x: u32,
    pub y: u32,
    /// Number of z layers; 1 for planar images
    pub z: u32,
}

impl Extent {
    /// A planar extent (single z layer).
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y, z: 1 }
    }
}

/// Physical pixel size in nanometers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PixelSizeNm {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

/// RGBA display colour of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl ChannelColor {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 0 }
    }
}

/// A single image channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: usize,
    pub name: String,
    pub color: ChannelColor,
    /// Bits per sample
    pub bit_depth: u8,
}

/// One resolution layer of the pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub extent: Extent,
    pub downsample_factor: f64,
    /// `true` if the level was synthesized rather than stored in the file
    pub generated: bool,
}

/// Immutable description of an opened slide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlideInfo {
    /// Identifier the slide was opened under
    pub id: String,
    /// Extent of level 0
    pub extent: Extent,
    pub pixel_size_nm: PixelSizeNm,
    pub channels: Vec<Channel>,
    /// Bit depth shared by all channels
    pub channel_depth: u8,
    pub tile_extent: Extent,
    pub levels: Vec<Level>,
}

impl SlideInfo {
    /// Number of pyramid levels.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Get a level, failing with `InvalidLevel` if out of range.
    pub fn level(&self, level: usize) -> Result<&Level, RegionError> {
        self.levels.get(level).ok_or(RegionError::InvalidLevel {
            level,
            max_levels: self.levels.len(),
        })
    }

    /// Number of tiles in X and Y direction for a level, counting partial
    /// edge tiles.
    pub fn tile_count(&self, level: usize) -> Result<(u32, u32), RegionError> {
        let extent = self.level(level)?.extent;
        Ok((
            extent.x.div_ceil(self.tile_extent.x.max(1)),
            extent.y.div_ceil(self.tile_extent.y.max(1)),
        ))
    }

    /// Verify the pyramid invariants.
    pub fn validate(&self) -> Result<(), SlideError> {
        if self.tile_extent.x == 0 || self.tile_extent.y == 0 {
            return Err(SlideError::InvalidInfo(format!(
                "tile extent must be non-zero, got {}x{}",
                self.tile_extent.x, self.tile_extent.y
            )));
        }

        let Some(base) = self.levels.first() else {
            return Err(SlideError::InvalidInfo("slide has no levels".to_string()));
        };

        if base.downsample_factor != 1.0 {
            return Err(SlideError::InvalidInfo(format!(
                "level 0 must have downsample factor 1, got {}",
                base.downsample_factor
            )));
        }

        for (index, pair) in self.levels.windows(2).enumerate() {
            if pair[1].downsample_factor <= pair[0].downsample_factor {
                return Err(SlideError::InvalidInfo(format!(
                    "downsample factor of level {} ({}) is not greater than level {} ({})",
                    index + 1,
                    pair[1].downsample_factor,
                    index,
                    pair[0].downsample_factor
                )));
            }
        }

        for (index, level) in self.levels.iter().enumerate().skip(1) {
            let expected_x = base.extent.x as f64 / level.downsample_factor;
            let expected_y = base.extent.y as f64 / level.downsample_factor;
            if !within_tolerance(level.extent.x, expected_x)
                || !within_tolerance(level.extent.y, expected_y)
            {
                return Err(SlideError::InvalidInfo(format!(
                    "level {} extent {}x{} does not match downsample {} of {}x{}",
                    index,
                    level.extent.x,
                    level.extent.y,
                    level.downsample_factor,
                    base.extent.x,
                    base.extent.y
                )));
            }
        }

        Ok(())
    }
}

fn within_tolerance(actual: u32, expected: f64) -> bool {
    let allowed = (expected * LEVEL_EXTENT_TOLERANCE).max(1.0);
    (actual as f64 - expected).abs() <= allowed
}

/// Standard red, green and blue channels for 8-bit brightfield images.
pub fn rgb_channels(bit_depth: u8) -> Vec<Channel> {
    [
        ("Red", ChannelColor::rgb(255, 0, 0)),
        ("Green", ChannelColor::rgb(0, 255, 0)),
        ("Blue", ChannelColor::rgb(0, 0, 255)),
    ]
    .into_iter()
    .enumerate()
    .map(|(id, (name, color))| Channel {
        id,
        name: name.to_string(),
        color,
        bit_depth,
    })
    .collect()
}
