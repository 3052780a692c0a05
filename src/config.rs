//! Configuration management for the WSI service.
//!
//! This module provides the command line interface of the `wsi-service`
//! binary:
//! - Command-line arguments via clap
//! - Environment variables with `WSI_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Environment Variables
//!
//! - `WSI_DATA_DIR` - Data directory laid out as `<case>/<slide>` (required)
//! - `WSI_INACTIVE_TIMEOUT` - Seconds before an idle slide is closed (default: 600)
//! - `WSI_MAX_OPEN_SLIDES` - Max simultaneously open slides (default: 100)
//! - `WSI_MAX_REGION_PIXELS` - Max pixels of one region request (default: 6250000)
//! - `WSI_PADDING_COLOR` - Colour outside the image, `#RRGGBB` (default: #FFFFFF)
//!
//! Plugin priorities are read separately from `PLUGIN_PRIORITY_<NAME>`
//! variables when the registry is built.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::region::{IntensityRange, DEFAULT_MAX_REGION_PIXELS};
use crate::slide::{Background, CacheConfig, DEFAULT_MAX_OPEN_SLIDES};

// =============================================================================
// Default Values
// =============================================================================

/// Default idle timeout in seconds.
pub const DEFAULT_INACTIVE_TIMEOUT_SECS: u64 = 600;

/// Default padding colour.
pub const DEFAULT_PADDING_COLOR: &str = "#FFFFFF";

/// Default thumbnail bound in pixels.
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 500;

// =============================================================================
// CLI Arguments
// =============================================================================

/// WSI Service - region and tile access to Whole Slide Images.
///
/// Opens slides from a local data directory through format plugins, keeps
/// them open while they are in use, and writes regions, tiles and
/// thumbnails as PNG.
#[derive(Parser, Debug, Clone)]
#[command(name = "wsi-service")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub service: ServiceConfig,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Validate global options and the selected command.
    pub fn validate(&self) -> Result<(), String> {
        self.service.validate()?;
        match &self.command {
            Command::Region(args) => args.validate(),
            Command::Tile(args) => args.intensity.range().map(|_| ()),
            Command::Thumbnail(args) => args.validate(),
            Command::Slides | Command::Plugins | Command::Info(_) => Ok(()),
        }
    }
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct ServiceConfig {
    /// Data directory; each sub-directory is a case, each supported file in
    /// a case is a slide.
    #[arg(long, env = "WSI_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Seconds a slide may stay unused before it is closed.
    #[arg(long, default_value_t = DEFAULT_INACTIVE_TIMEOUT_SECS, env = "WSI_INACTIVE_TIMEOUT")]
    pub inactive_timeout: u64,

    /// Maximum number of simultaneously open slides.
    #[arg(long, default_value_t = DEFAULT_MAX_OPEN_SLIDES, env = "WSI_MAX_OPEN_SLIDES")]
    pub max_open_slides: usize,

    /// Maximum number of pixels in one region request.
    #[arg(long, default_value_t = DEFAULT_MAX_REGION_PIXELS, env = "WSI_MAX_REGION_PIXELS")]
    pub max_region_pixels: u64,

    /// Colour used for areas outside the image (#RRGGBB or #RGB).
    #[arg(long, default_value = DEFAULT_PADDING_COLOR, env = "WSI_PADDING_COLOR")]
    pub padding_color: Background,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl ServiceConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.data_dir.as_os_str().is_empty() {
            return Err("Data directory is required. Set --data-dir or WSI_DATA_DIR".to_string());
        }
        if self.inactive_timeout == 0 {
            return Err("inactive_timeout must be greater than 0".to_string());
        }
        if self.max_open_slides == 0 {
            return Err("max_open_slides must be greater than 0".to_string());
        }
        if self.max_region_pixels == 0 {
            return Err("max_region_pixels must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Cache settings derived from the options.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            inactive_timeout: Duration::from_secs(self.inactive_timeout),
            max_open_slides: self.max_open_slides,
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List cases and slides found in the data directory.
    Slides,

    /// List registered format plugins and their priorities.
    Plugins,

    /// Print slide metadata as JSON.
    Info(SlideArgs),

    /// Write a region of a slide level as PNG.
    Region(RegionArgs),

    /// Write a tile of a slide level as PNG.
    Tile(TileArgs),

    /// Write a slide thumbnail as PNG.
    Thumbnail(ThumbnailArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SlideArgs {
    /// Slide identifier as listed by `slides`.
    pub slide_id: String,
}

/// Intensity rescaling options.
#[derive(Args, Debug, Clone, Default)]
pub struct IntensityArgs {
    /// Lower intensity bound (requires --upper).
    #[arg(long)]
    pub lower: Option<f64>,

    /// Upper intensity bound (requires --lower).
    #[arg(long)]
    pub upper: Option<f64>,

    /// Stretch between the minimum and maximum of the selected channels.
    #[arg(long, default_value_t = false, conflicts_with_all = ["lower", "upper"])]
    pub auto: bool,
}

impl IntensityArgs {
    /// The intensity range these options select.
    pub fn range(&self) -> Result<IntensityRange, String> {
        match (self.lower, self.upper, self.auto) {
            (None, None, false) => Ok(IntensityRange::Default),
            (None, None, true) => Ok(IntensityRange::Auto),
            (Some(lower), Some(upper), false) => Ok(IntensityRange::Explicit { lower, upper }),
            (_, _, true) => Err("--auto cannot be combined with --lower/--upper".to_string()),
            _ => Err("--lower and --upper must be given together".to_string()),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RegionArgs {
    pub slide_id: String,

    /// Pyramid level (0 = full resolution).
    #[arg(long, default_value_t = 0)]
    pub level: usize,

    /// Left edge in level pixels; may be negative.
    #[arg(long, allow_hyphen_values = true)]
    pub x: i64,

    /// Top edge in level pixels; may be negative.
    #[arg(long, allow_hyphen_values = true)]
    pub y: i64,

    #[arg(long)]
    pub width: u32,

    #[arg(long)]
    pub height: u32,

    /// Channels to show, comma-separated (default: all).
    #[arg(long, value_delimiter = ',')]
    pub channels: Vec<usize>,

    #[command(flatten)]
    pub intensity: IntensityArgs,

    /// Output PNG file.
    #[arg(short, long)]
    pub output: PathBuf,
}

impl RegionArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("Region width and height must be greater than 0".to_string());
        }
        self.intensity.range().map(|_| ())
    }
}

#[derive(Args, Debug, Clone)]
pub struct TileArgs {
    pub slide_id: String,

    /// Pyramid level (0 = full resolution).
    #[arg(long, default_value_t = 0)]
    pub level: usize,

    /// Tile column; may be negative.
    #[arg(long, allow_hyphen_values = true)]
    pub tile_x: i64,

    /// Tile row; may be negative.
    #[arg(long, allow_hyphen_values = true)]
    pub tile_y: i64,

    /// Channels to show, comma-separated (default: all).
    #[arg(long, value_delimiter = ',')]
    pub channels: Vec<usize>,

    #[command(flatten)]
    pub intensity: IntensityArgs,

    /// Output PNG file.
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ThumbnailArgs {
    pub slide_id: String,

    #[arg(long, default_value_t = DEFAULT_THUMBNAIL_SIZE)]
    pub max_width: u32,

    #[arg(long, default_value_t = DEFAULT_THUMBNAIL_SIZE)]
    pub max_height: u32,

    /// Output PNG file.
    #[arg(short, long)]
    pub output: PathBuf,
}

impl ThumbnailArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_width == 0 || self.max_height == 0 {
            return Err("Thumbnail bounds must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
