use std::path::PathBuf;
use thiserror::Error;

/// Problems with the run configuration. Fatal: they abort before or during
/// the job that trips them and are never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Per-detector lists in the JSON config disagree in length.
    #[error("per-detector setting `{field}` has {found} entries, expected {expected}")]
    DetectorListLength {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    /// Number of file patterns on the command line differs from detector count.
    #[error("{patterns} file patterns given for {detectors} detectors")]
    PatternCount { patterns: usize, detectors: usize },

    /// Expanded file lists differ in length so image sets cannot be formed.
    #[error("file pattern `{pattern}` matched {found} files, expected {expected}")]
    ImageCountMismatch {
        pattern: String,
        expected: usize,
        found: usize,
    },

    /// A file pattern could not be parsed as a glob.
    #[error("invalid file pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("unknown data operation `{0}` (expected flipud, fliplr, rotcw or rotccw)")]
    UnknownDataOp(String),

    #[error("unsupported export format `{0}`")]
    UnsupportedFormat(String),

    #[error("export format `{0}` requires 2D integration")]
    FormatNeeds2d(&'static str),

    #[error("export format `{format}` cannot be written with radial unit `{unit}`")]
    FormatUnit { format: &'static str, unit: String },

    #[error("unknown radial unit `{0}`")]
    UnknownUnit(String),

    #[error("calibration file {path}: missing key `{key}`")]
    MissingCalibrationKey { path: PathBuf, key: &'static str },

    #[error("calibration file {path}: bad value for `{key}`: {value}")]
    BadCalibrationValue {
        path: PathBuf,
        key: String,
        value: String,
    },

    #[error("invalid integration setting: {0}")]
    Invalid(String),
}

/// Top-level error for loading, integrating, remapping and exporting.
#[derive(Error, Debug)]
pub enum CakeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to parse config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("coordinate cache {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    #[error("frame shape {found:?} does not match detector shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("interpolation failed: {0}")]
    Interpolation(#[from] cake_math::InterpolationError),

    #[error("integration failed: {0}")]
    Integration(String),
}

impl CakeError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CakeError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = CakeError> = std::result::Result<T, E>;
