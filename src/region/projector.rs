//! Projection of multi-channel buffers onto displayable 8-bit images.
//!
//! Two steps, in order:
//!
//! 1. Channel reduction. The selected channels are the requested ones (all
//!    channels when nothing is requested), truncated to the first three. One
//!    selected channel yields a grayscale image; two or three yield RGB with
//!    missing channels set to zero.
//! 2. Intensity rescaling. Samples deeper than 8 bit are mapped to
//!    `0..=255` with `clip(round((v - lower) / (upper - lower) * 255), 0, 255)`.
//!    8-bit data is passed through unchanged in every range mode; explicit
//!    bounds are still validated.
//!
//! Keeping only the first three channels of a fluorescence stack is lossy;
//! there is no spectral unmixing.

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};

use crate::error::ProjectionError;
use crate::slide::PixelBuffer;

/// Maximum number of channels in a display image.
const DISPLAY_CHANNELS: usize = 3;

/// Bounds used when rescaling samples to 8 bit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum IntensityRange {
    /// `[0, 255]` for 8-bit data; `[0, 2^B / (B / 4)]` for deeper data
    #[default]
    Default,

    /// Caller-provided bounds; must satisfy `0 <= lower < upper < 2^B`.
    /// Only applied to data deeper than 8 bit.
    Explicit { lower: f64, upper: f64 },

    /// Minimum and maximum of the selected channels of data deeper than 8 bit
    Auto,
}

/// Upper rescaling bound used for `IntensityRange::Default`.
pub fn default_upper(bit_depth: u8) -> f64 {
    if bit_depth > 8 {
        2f64.powi(bit_depth as i32) / (bit_depth as f64 / 4.0)
    } else {
        255.0
    }
}

// =============================================================================
// Display Image
// =============================================================================

/// An 8-bit image ready for encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayImage {
    Gray(GrayImage),
    Rgb(RgbImage),
}

impl DisplayImage {
    pub fn width(&self) -> u32 {
        match self {
            DisplayImage::Gray(img) => img.width(),
            DisplayImage::Rgb(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            DisplayImage::Gray(img) => img.height(),
            DisplayImage::Rgb(img) => img.height(),
        }
    }

    /// 1 for grayscale, 3 for RGB.
    pub fn channel_count(&self) -> usize {
        match self {
            DisplayImage::Gray(_) => 1,
            DisplayImage::Rgb(_) => 3,
        }
    }

    /// Convert for use with the `image` encoders.
    pub fn into_dynamic(self) -> DynamicImage {
        match self {
            DisplayImage::Gray(img) => DynamicImage::ImageLuma8(img),
            DisplayImage::Rgb(img) => DynamicImage::ImageRgb8(img),
        }
    }
}

// =============================================================================
// Channel Projector
// =============================================================================

/// Turns pixel buffers plus a channel selection into display images.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelProjector {
    range: IntensityRange,
}

impl ChannelProjector {
    /// Projector using the default intensity range.
    pub fn new() -> Self {
        Self::default()
    }

    /// Projector using `range` for every projection.
    pub fn with_range(range: IntensityRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> IntensityRange {
        self.range
    }

    /// Project `buffer` onto a display image.
    ///
    /// `requested` lists channel indices; `None` or an empty list selects
    /// every channel.
    pub fn project(
        &self,
        buffer: &PixelBuffer,
        requested: Option<&[usize]>,
    ) -> Result<DisplayImage, ProjectionError> {
        let selected = select_channels(buffer.channels(), requested)?;
        let planes = self.rescaled_planes(buffer, &selected)?;
        let (width, height) = (buffer.width(), buffer.height());

        if let [plane] = planes.as_slice() {
            return Ok(DisplayImage::Gray(GrayImage::from_fn(width, height, |x, y| {
                Luma([plane[pixel_index(width, x, y)]])
            })));
        }

        let sample = |channel: usize, index: usize| planes.get(channel).map_or(0, |p| p[index]);
        Ok(DisplayImage::Rgb(RgbImage::from_fn(width, height, |x, y| {
            let index = pixel_index(width, x, y);
            Rgb([sample(0, index), sample(1, index), sample(2, index)])
        })))
    }

    /// 8-bit planes of the selected channels.
    fn rescaled_planes(
        &self,
        buffer: &PixelBuffer,
        selected: &[usize],
    ) -> Result<Vec<Vec<u8>>, ProjectionError> {
        let bit_depth = buffer.bit_depth();

        if let IntensityRange::Explicit { lower, upper } = self.range {
            validate_range(lower, upper, bit_depth)?;
        }
        // 8-bit data is displayable as is, whatever the range
        if bit_depth == 8 {
            return Ok(selected
                .iter()
                .map(|&c| buffer.plane_u8(c).map(<[u8]>::to_vec).unwrap_or_default())
                .collect());
        }

        let values: Vec<Vec<u64>> = selected.iter().map(|&c| buffer.plane_values(c)).collect();
        let (lower, upper) = match self.range {
            IntensityRange::Default => (0.0, default_upper(bit_depth)),
            IntensityRange::Explicit { lower, upper } => (lower, upper),
            IntensityRange::Auto => auto_range(&values),
        };

        Ok(values
            .iter()
            .map(|plane| plane.iter().map(|&v| rescale(v, lower, upper)).collect())
            .collect())
    }
}

/// Resolve and validate the channel selection.
///
/// Every requested index is checked, including those dropped by the
/// three-channel truncation.
pub fn select_channels(
    channels: usize,
    requested: Option<&[usize]>,
) -> Result<Vec<usize>, ProjectionError> {
    let mut selected = match requested {
        None | Some([]) => (0..channels).collect::<Vec<_>>(),
        Some(list) => {
            for (i, &channel) in list.iter().enumerate() {
                if channel >= channels {
                    return Err(ProjectionError::ChannelOutOfBounds { channel, channels });
                }
                if list[..i].contains(&channel) {
                    return Err(ProjectionError::DuplicateChannel(channel));
                }
            }
            list.to_vec()
        }
    };
    selected.truncate(DISPLAY_CHANNELS);
    Ok(selected)
}

fn validate_range(lower: f64, upper: f64, bit_depth: u8) -> Result<(), ProjectionError> {
    let limit = 2f64.powi(bit_depth as i32);
    if !(0.0 <= lower && lower < upper && upper < limit) {
        return Err(ProjectionError::InvalidIntensityRange {
            lower,
            upper,
            bit_depth,
        });
    }
    Ok(())
}

fn auto_range(planes: &[Vec<u64>]) -> (f64, f64) {
    let mut samples = planes.iter().flatten().copied();
    let Some(first) = samples.next() else {
        return (0.0, 1.0);
    };
    let (min, max) = samples.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if max == min {
        // Flat input maps to black
        return (min as f64, min as f64 + 1.0);
    }
    (min as f64, max as f64)
}

#[inline]
fn rescale(value: u64, lower: f64, upper: f64) -> u8 {
    ((value as f64 - lower) / (upper - lower) * 255.0)
        .round()
        .clamp(0.0, 255.0) as u8
}

#[inline]
fn pixel_index(width: u32, x: u32, y: u32) -> usize {
    y as usize * width as usize + x as usize
}
