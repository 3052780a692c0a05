//! Channel-major pixel buffers and background fill values.
//!
//! A [`PixelBuffer`] stores one plane per channel, each plane `width * height`
//! samples in row-major order. All channels share one sample type.

use std::str::FromStr;

use crate::error::{RegionError, SlideError};

// =============================================================================
// Pixel Data
// =============================================================================

/// Sample storage for a pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
}

impl PixelData {
    /// Bits per sample.
    pub fn bit_depth(&self) -> u8 {
        match self {
            PixelData::U8(_) => 8,
            PixelData::U16(_) => 16,
            PixelData::U32(_) => 32,
            PixelData::U64(_) => 64,
        }
    }

    /// Total number of samples.
    pub fn len(&self) -> usize {
        match self {
            PixelData::U8(v) => v.len(),
            PixelData::U16(v) => v.len(),
            PixelData::U32(v) => v.len(),
            PixelData::U64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate `len` samples of the given bit depth, set to zero.
    fn zeroed(bit_depth: u8, len: usize) -> Option<Self> {
        match bit_depth {
            8 => Some(PixelData::U8(vec![0; len])),
            16 => Some(PixelData::U16(vec![0; len])),
            32 => Some(PixelData::U32(vec![0; len])),
            64 => Some(PixelData::U64(vec![0; len])),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for PixelData {
    fn from(v: Vec<u8>) -> Self {
        PixelData::U8(v)
    }
}

impl From<Vec<u16>> for PixelData {
    fn from(v: Vec<u16>) -> Self {
        PixelData::U16(v)
    }
}

impl From<Vec<u32>> for PixelData {
    fn from(v: Vec<u32>) -> Self {
        PixelData::U32(v)
    }
}

impl From<Vec<u64>> for PixelData {
    fn from(v: Vec<u64>) -> Self {
        PixelData::U64(v)
    }
}

/// Channel count and bit depth of a buffer, without its samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelLayout {
    pub channels: usize,
    pub bit_depth: u8,
}

// =============================================================================
// Pixel Buffer
// =============================================================================

/// A multi-channel, channel-major image buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    channels: usize,
    data: PixelData,
}

impl PixelBuffer {
    /// Create a buffer, checking that the sample count matches the dimensions.
    pub fn new(
        width: u32,
        height: u32,
        channels: usize,
        data: impl Into<PixelData>,
    ) -> Result<Self, SlideError> {
        let data = data.into();
        let expected = width as usize * height as usize * channels;
        if data.len() != expected {
            return Err(SlideError::Decode(format!(
                "buffer has {} samples, expected {} for {}x{}x{}",
                data.len(),
                expected,
                width,
                height,
                channels
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Create a buffer with every sample set from `background`.
    pub fn filled(
        width: u32,
        height: u32,
        layout: PixelLayout,
        background: &Background,
    ) -> Result<Self, RegionError> {
        let values = background.resolve(layout.channels)?;
        let plane = width as usize * height as usize;
        let mut data = PixelData::zeroed(layout.bit_depth, plane * layout.channels).ok_or_else(
            || {
                RegionError::Backend(SlideError::Decode(format!(
                    "unsupported bit depth {}",
                    layout.bit_depth
                )))
            },
        )?;

        for (channel, value) in values.into_iter().enumerate() {
            let range = channel * plane..(channel + 1) * plane;
            match &mut data {
                PixelData::U8(v) => v[range].fill(value.min(u8::MAX as u64) as u8),
                PixelData::U16(v) => v[range].fill(value.min(u16::MAX as u64) as u16),
                PixelData::U32(v) => v[range].fill(value.min(u32::MAX as u64) as u32),
                PixelData::U64(v) => v[range].fill(value),
            }
        }

        Ok(Self {
            width,
            height,
            channels: layout.channels,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn bit_depth(&self) -> u8 {
        self.data.bit_depth()
    }

    pub fn layout(&self) -> PixelLayout {
        PixelLayout {
            channels: self.channels,
            bit_depth: self.bit_depth(),
        }
    }

    pub fn data(&self) -> &PixelData {
        &self.data
    }

    pub fn into_data(self) -> PixelData {
        self.data
    }

    fn plane_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Read one sample, widened to `u64`.
    pub fn sample(&self, channel: usize, x: u32, y: u32) -> Option<u64> {
        if channel >= self.channels || x >= self.width || y >= self.height {
            return None;
        }
        let index = channel * self.plane_len() + y as usize * self.width as usize + x as usize;
        Some(match &self.data {
            PixelData::U8(v) => v[index] as u64,
            PixelData::U16(v) => v[index] as u64,
            PixelData::U32(v) => v[index] as u64,
            PixelData::U64(v) => v[index],
        })
    }

    /// All samples of one channel, widened to `u64`.
    pub fn plane_values(&self, channel: usize) -> Vec<u64> {
        if channel >= self.channels {
            return Vec::new();
        }
        let range = channel * self.plane_len()..(channel + 1) * self.plane_len();
        match &self.data {
            PixelData::U8(v) => v[range].iter().map(|&s| s as u64).collect(),
            PixelData::U16(v) => v[range].iter().map(|&s| s as u64).collect(),
            PixelData::U32(v) => v[range].iter().map(|&s| s as u64).collect(),
            PixelData::U64(v) => v[range].to_vec(),
        }
    }

    /// Borrow one channel's samples when the buffer is 8-bit.
    pub fn plane_u8(&self, channel: usize) -> Option<&[u8]> {
        match &self.data {
            PixelData::U8(v) if channel < self.channels => {
                Some(&v[channel * self.plane_len()..(channel + 1) * self.plane_len()])
            }
            _ => None,
        }
    }

    /// Copy `src` into this buffer with its top-left corner at `(dst_x, dst_y)`.
    ///
    /// Parts of `src` that fall outside this buffer are dropped.
    pub fn paste(&mut self, src: &PixelBuffer, dst_x: u32, dst_y: u32) -> Result<(), RegionError> {
        if src.channels != self.channels {
            return Err(RegionError::ChannelMismatch {
                background: self.channels,
                channels: src.channels,
            });
        }

        let copy_w = src.width.min(self.width.saturating_sub(dst_x)) as usize;
        let copy_h = src.height.min(self.height.saturating_sub(dst_y)) as usize;
        if copy_w == 0 || copy_h == 0 {
            return Ok(());
        }

        let geometry = PasteGeometry {
            channels: self.channels,
            dst_w: self.width as usize,
            dst_plane: self.plane_len(),
            src_w: src.width as usize,
            src_plane: src.plane_len(),
            dst_x: dst_x as usize,
            dst_y: dst_y as usize,
            copy_w,
            copy_h,
        };

        match (&mut self.data, &src.data) {
            (PixelData::U8(d), PixelData::U8(s)) => geometry.copy(d, s),
            (PixelData::U16(d), PixelData::U16(s)) => geometry.copy(d, s),
            (PixelData::U32(d), PixelData::U32(s)) => geometry.copy(d, s),
            (PixelData::U64(d), PixelData::U64(s)) => geometry.copy(d, s),
            (d, s) => {
                return Err(RegionError::Backend(SlideError::Decode(format!(
                    "cannot paste {}-bit data into {}-bit buffer",
                    s.bit_depth(),
                    d.bit_depth()
                ))))
            }
        }

        Ok(())
    }

    /// Extract a sub-rectangle, clipped to the buffer.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> PixelBuffer {
        let x = x.min(self.width);
        let y = y.min(self.height);
        let width = width.min(self.width - x);
        let height = height.min(self.height - y);

        let layout = self.layout();
        let mut out = PixelBuffer {
            width,
            height,
            channels: self.channels,
            data: PixelData::zeroed(layout.bit_depth, width as usize * height as usize * self.channels)
                .unwrap_or(PixelData::U8(Vec::new())),
        };
        if width == 0 || height == 0 {
            return out;
        }

        let geometry = CropGeometry {
            channels: self.channels,
            src_w: self.width as usize,
            src_plane: self.plane_len(),
            x: x as usize,
            y: y as usize,
            width: width as usize,
            height: height as usize,
        };

        match (&mut out.data, &self.data) {
            (PixelData::U8(d), PixelData::U8(s)) => geometry.copy(d, s),
            (PixelData::U16(d), PixelData::U16(s)) => geometry.copy(d, s),
            (PixelData::U32(d), PixelData::U32(s)) => geometry.copy(d, s),
            (PixelData::U64(d), PixelData::U64(s)) => geometry.copy(d, s),
            _ => {}
        }

        out
    }
}

struct PasteGeometry {
    channels: usize,
    dst_w: usize,
    dst_plane: usize,
    src_w: usize,
    src_plane: usize,
    dst_x: usize,
    dst_y: usize,
    copy_w: usize,
    copy_h: usize,
}

impl PasteGeometry {
    fn copy<T: Copy>(&self, dst: &mut [T], src: &[T]) {
        for c in 0..self.channels {
            for row in 0..self.copy_h {
                let s = c * self.src_plane + row * self.src_w;
                let d = c * self.dst_plane + (self.dst_y + row) * self.dst_w + self.dst_x;
                dst[d..d + self.copy_w].copy_from_slice(&src[s..s + self.copy_w]);
            }
        }
    }
}

struct CropGeometry {
    channels: usize,
    src_w: usize,
    src_plane: usize,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
}

impl CropGeometry {
    fn copy<T: Copy>(&self, dst: &mut [T], src: &[T]) {
        let dst_plane = self.width * self.height;
        for c in 0..self.channels {
            for row in 0..self.height {
                let s = c * self.src_plane + (self.y + row) * self.src_w + self.x;
                let d = c * dst_plane + row * self.width;
                dst[d..d + self.width].copy_from_slice(&src[s..s + self.width]);
            }
        }
    }
}

// =============================================================================
// Background
// =============================================================================

/// Fill value for the parts of a request outside the image.
///
/// Values are in sample units and saturate at the buffer's maximum sample
/// value, so `Background::white()` is white at any bit depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Background {
    /// Same value for every channel
    Scalar(u64),
    /// One value per channel
    PerChannel(Vec<u64>),
}

impl Default for Background {
    fn default() -> Self {
        Background::Scalar(0)
    }
}

impl Background {
    /// Maximum value in every channel.
    pub const fn white() -> Self {
        Background::Scalar(u64::MAX)
    }

    /// Parse a `#RRGGBB` or `#RGB` colour into a three channel background.
    pub fn from_hex(value: &str) -> Option<Self> {
        let digits = value.strip_prefix('#')?;
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let expanded: String = match digits.len() {
            3 => digits.chars().flat_map(|c| [c, c]).collect(),
            6 => digits.to_string(),
            _ => return None,
        };
        let rgb = (0..3)
            .map(|i| u64::from_str_radix(&expanded[i * 2..i * 2 + 2], 16))
            .collect::<Result<Vec<_>, _>>()
            .ok()?;
        Some(Background::PerChannel(rgb))
    }

    /// Adapt an 8-bit colour, as parsed by [`Background::from_hex`], to a
    /// buffer of `channels` channels at `bit_depth` bits.
    ///
    /// Values are stretched to the full sample range. A colour whose value
    /// count differs from `channels` collapses to the mean of its values.
    pub fn adapt_8bit(&self, channels: usize, bit_depth: u8) -> Background {
        let max = if bit_depth >= 64 {
            u64::MAX
        } else {
            (1u64 << bit_depth) - 1
        };
        let stretch = |v: u64| (v.min(255) as u128 * max as u128 / 255) as u64;
        match self {
            Background::Scalar(value) => Background::Scalar(*value),
            Background::PerChannel(values) if values.len() == channels => {
                Background::PerChannel(values.iter().map(|&v| stretch(v)).collect())
            }
            Background::PerChannel(values) => {
                let mean = values.iter().sum::<u64>() / values.len().max(1) as u64;
                Background::Scalar(stretch(mean))
            }
        }
    }

    /// Per-channel fill values for a buffer with `channels` channels.
    pub fn resolve(&self, channels: usize) -> Result<Vec<u64>, RegionError> {
        match self {
            Background::Scalar(value) => Ok(vec![*value; channels]),
            Background::PerChannel(values) if values.len() == channels => Ok(values.clone()),
            Background::PerChannel(values) => Err(RegionError::ChannelMismatch {
                background: values.len(),
                channels,
            }),
        }
    }
}

impl FromStr for Background {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Background::from_hex(s)
            .ok_or_else(|| format!("invalid colour '{}': expected #RRGGBB or #RGB", s))
    }
}
