//! On-disk store of computed coordinate maps, one file per detector.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::CoordinateMap;
use crate::error::{CakeError, Result};

/// Identity of a coordinate map: frame shape plus both histogram axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheKey {
    pub shape: (usize, usize),
    pub radial: Vec<f64>,
    pub azimuthal: Vec<f64>,
}

/// Stored layout: the key fields followed by the two maps.
#[derive(Serialize, Deserialize)]
struct CacheRecord {
    shape: (usize, usize),
    radial: Vec<f64>,
    azimuthal: Vec<f64>,
    x: Array2<f64>,
    y: Array2<f64>,
}

/// Directory-backed coordinate map cache.
#[derive(Debug, Clone)]
pub struct CoordinateCache {
    dir: PathBuf,
}

impl CoordinateCache {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache file of detector `index`.
    pub fn path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("binned_detector_coord{index}.bin"))
    }

    /// Stored map for `key`, or `None` when absent, stale or unreadable.
    ///
    /// Keys are compared exactly, element by element.
    pub fn load(&self, index: usize, key: &CacheKey) -> Option<CoordinateMap> {
        let path = self.path(index);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(_) => {
                debug!("No coordinate cache at {}", path.display());
                return None;
            }
        };

        let record: CacheRecord = match bincode::deserialize_from(BufReader::new(file)) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "Ignoring unreadable coordinate cache {}: {}",
                    path.display(),
                    e
                );
                return None;
            }
        };

        if record.shape != key.shape || record.radial != key.radial || record.azimuthal != key.azimuthal
        {
            debug!("Coordinate cache {} is stale", path.display());
            return None;
        }

        Some(CoordinateMap {
            x: record.x,
            y: record.y,
        })
    }

    /// Replace detector `index`'s cache file with `map` under `key`.
    ///
    /// The record is written to a temporary file in the cache directory and
    /// renamed over the target, so readers see the old or the new file.
    pub fn store(&self, index: usize, key: &CacheKey, map: &CoordinateMap) -> Result<()> {
        let path = self.path(index);
        std::fs::create_dir_all(&self.dir).map_err(|e| CakeError::io(&self.dir, e))?;

        let record = CacheRecord {
            shape: key.shape,
            radial: key.radial.clone(),
            azimuthal: key.azimuthal.clone(),
            x: map.x.clone(),
            y: map.y.clone(),
        };

        let tmp = NamedTempFile::new_in(&self.dir).map_err(|e| CakeError::io(&self.dir, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            bincode::serialize_into(&mut writer, &record).map_err(|source| CakeError::Cache {
                path: path.clone(),
                source,
            })?;
            writer.flush().map_err(|e| CakeError::io(&path, e))?;
        }
        tmp.persist(&path)
            .map_err(|e| CakeError::io(&path, e.error))?;
        debug!("Stored coordinate cache {}", path.display());
        Ok(())
    }
}
