//! Expansion of per-detector file patterns into image sets.

use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::ConfigError;

/// One capture: frame `i` belongs to detector `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSet {
    /// Position in discovery order
    pub index: usize,
    pub frames: Vec<PathBuf>,
}

impl ImageSet {
    /// Output stem: `output_dir` joined with the first frame's file stem.
    pub fn stem(&self, output_dir: &Path) -> PathBuf {
        let name = self
            .frames
            .first()
            .and_then(|f| f.file_stem())
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        output_dir.join(name)
    }
}

/// Expand one glob pattern into a sorted file list.
pub fn expand_pattern(pattern: &str) -> Result<Vec<PathBuf>, ConfigError> {
    let paths = glob::glob(pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut files: Vec<PathBuf> = paths
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Skipping unreadable match of {}: {}", pattern, e);
                None
            }
        })
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// Expand every pattern and zip the sorted lists position by position.
///
/// All patterns must match the same number of files.
pub fn discover_image_sets<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<ImageSet>, ConfigError> {
    let lists = patterns
        .iter()
        .map(|p| expand_pattern(p.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let Some(expected) = lists.first().map(Vec::len) else {
        return Ok(Vec::new());
    };
    for (pattern, list) in patterns.iter().zip(&lists).skip(1) {
        if list.len() != expected {
            return Err(ConfigError::ImageCountMismatch {
                pattern: pattern.as_ref().to_string(),
                expected,
                found: list.len(),
            });
        }
    }

    Ok((0..expected)
        .map(|index| ImageSet {
            index,
            frames: lists.iter().map(|list| list[index].clone()).collect(),
        })
        .collect())
}
