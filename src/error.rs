use std::fmt;

use thiserror::Error;

/// Errors raised by a format backend through the slide handle contract.
///
/// The geometry engine and the projector never interpret these; they are
/// propagated as-is once a real read has been determined to be necessary.
#[derive(Debug, Clone, Error)]
pub enum SlideError {
    /// The backend does not provide the requested pyramid level
    #[error("Unsupported level {level} (slide has {max_levels} levels)")]
    UnsupportedLevel { level: usize, max_levels: usize },

    /// The requested read would not fit in memory
    #[error("Out of memory: cannot allocate {requested} bytes")]
    OutOfMemory { requested: u64 },

    /// Associated image (label, macro) is not present in the file
    #[error("Associated image not found: {0}")]
    NotFound(String),

    /// Rectangle passed to the backend lies outside the level
    #[error("Rectangle ({x}, {y}, {width}x{height}) is outside level {level}")]
    OutOfBounds {
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    /// The handle has already been closed
    #[error("Slide handle is closed")]
    Closed,

    /// Slide metadata violates pyramid invariants
    #[error("Invalid slide info: {0}")]
    InvalidInfo(String),

    /// Backend specific decode failure
    #[error("Decode error: {0}")]
    Decode(String),

    /// File system or network error while reading the slide
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SlideError {
    fn from(err: std::io::Error) -> Self {
        SlideError::Io(err.to_string())
    }
}

/// A single failed open attempt, recorded while resolving plugins.
#[derive(Debug, Clone)]
pub struct PluginAttempt {
    /// Name of the backend that was tried
    pub plugin: String,

    /// Error it returned
    pub error: SlideError,
}

impl fmt::Display for PluginAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.plugin, self.error)
    }
}

/// Errors raised while choosing and running a format backend for a file.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    /// The explicitly requested plugin cannot handle the file
    #[error("Plugin {plugin} does not support {path}")]
    UnsupportedFormat { plugin: String, path: String },

    /// The explicitly requested plugin is not registered
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    /// No registered backend supports the file
    #[error("No plugin available for {path}")]
    NoPluginAvailable { path: String },

    /// Every candidate backend failed to open the file
    #[error("All plugins failed to open {path}: {}", join_attempts(.attempts))]
    AllPluginsFailed {
        path: String,
        attempts: Vec<PluginAttempt>,
    },
}

fn join_attempts(attempts: &[PluginAttempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the external storage mapping.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The identifier has no storage address
    #[error("No storage address for slide {0}")]
    NotFound(String),

    /// The mapping could not be reached or read
    #[error("Storage mapping unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by the expiring slide cache.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Storage resolution failed; safe to retry later
    #[error("Slide {slide_id} unavailable: {reason}")]
    SlideUnavailable { slide_id: String, reason: String },

    /// No backend could open the resolved file
    #[error(transparent)]
    Open(#[from] PluginError),

    /// The cache has been shut down
    #[error("Slide cache is shut down")]
    ShutDown,
}

/// Errors from region and tile normalization.
#[derive(Debug, Clone, Error)]
pub enum RegionError {
    /// Level index is not part of the pyramid
    #[error("Invalid level {level}: the coarsest available level is {}", .max_levels.saturating_sub(1))]
    InvalidLevel { level: usize, max_levels: usize },

    /// Region width or height is zero
    #[error("Invalid region size {width}x{height}: both dimensions must be > 0")]
    InvalidSize { width: u32, height: u32 },

    /// Region has more pixels than allowed
    #[error("Requested region has {pixels} pixels, the maximum is {max}")]
    RegionTooLarge { pixels: u64, max: u64 },

    /// Background value count does not match the buffer's channel count
    #[error("Background has {background} values but the buffer has {channels} channels")]
    ChannelMismatch { background: usize, channels: usize },

    /// The backend read failed
    #[error(transparent)]
    Backend(#[from] SlideError),
}

/// Errors from channel projection.
#[derive(Debug, Clone, Error)]
pub enum ProjectionError {
    /// Requested channel index is not present in the buffer
    #[error("Channel {channel} exceeds channel bounds (max: {})", .channels.saturating_sub(1))]
    ChannelOutOfBounds { channel: usize, channels: usize },

    /// Requested channel list contains a repeated index
    #[error("Duplicate channel {0} in request")]
    DuplicateChannel(usize),

    /// Explicit intensity bounds are not valid for the bit depth
    #[error("Invalid intensity range [{lower}, {upper}] for {bit_depth}-bit data")]
    InvalidIntensityRange {
        lower: f64,
        upper: f64,
        bit_depth: u8,
    },
}

/// The pipeline phase an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    Resolve,
    Open,
    Read,
    Normalize,
}

impl fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorPhase::Resolve => "resolve",
            ErrorPhase::Open => "open",
            ErrorPhase::Read => "read",
            ErrorPhase::Normalize => "normalize",
        };
        f.write_str(name)
    }
}

/// How an error should be surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller input error, never retried
    Client,
    /// Unexpected failure, not retried
    Server,
    /// Temporary unavailability, safe to retry later
    Unavailable,
}

/// Umbrella error for the full resolve, open, read, normalize pipeline.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Region(#[from] RegionError),

    #[error("{0}")]
    Projection(#[from] ProjectionError),

    #[error("{0}")]
    Slide(#[from] SlideError),
}

impl ServiceError {
    /// The phase that produced this error.
    pub fn phase(&self) -> ErrorPhase {
        match self {
            ServiceError::Cache(CacheError::SlideUnavailable { .. })
            | ServiceError::Cache(CacheError::ShutDown) => ErrorPhase::Resolve,
            ServiceError::Cache(CacheError::Open(_)) => ErrorPhase::Open,
            ServiceError::Region(RegionError::Backend(_)) | ServiceError::Slide(_) => {
                ErrorPhase::Read
            }
            ServiceError::Region(_) | ServiceError::Projection(_) => ErrorPhase::Normalize,
        }
    }

    /// Classify the error for the outer API layer.
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::Cache(CacheError::SlideUnavailable { .. })
            | ServiceError::Cache(CacheError::ShutDown) => ErrorClass::Unavailable,
            ServiceError::Cache(CacheError::Open(_)) => ErrorClass::Server,
            ServiceError::Region(RegionError::Backend(err)) | ServiceError::Slide(err) => {
                slide_error_class(err)
            }
            ServiceError::Region(_) | ServiceError::Projection(_) => ErrorClass::Client,
        }
    }

    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Unavailable
    }
}

fn slide_error_class(err: &SlideError) -> ErrorClass {
    match err {
        SlideError::UnsupportedLevel { .. } | SlideError::NotFound(_) => ErrorClass::Client,
        _ => ErrorClass::Server,
    }
}
