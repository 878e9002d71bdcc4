//! Detector calibration: PONI geometry, correction frames and static masks.
//!
//! One [`Detector`] is built per physical detector at startup and shared
//! read-only by every job afterwards. Missing calibration or mask files are
//! fatal here, before any batch work begins.

use ndarray::{Array2, Zip};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::config::IntegrationConfig;
use crate::error::{CakeError, ConfigError, Result};
use crate::image_proc::{apply_ops, load_frame, load_mask, parse_ops, DataOp};

/// Detector geometry in the PONI convention (SI units, radians).
///
/// Axis "1" is the slow axis (array rows), axis "2" the fast axis (columns).
#[derive(Debug, Clone, PartialEq)]
pub struct PoniGeometry {
    pub pixel1: f64,
    pub pixel2: f64,
    pub distance: f64,
    pub poni1: f64,
    pub poni2: f64,
    pub rot1: f64,
    pub rot2: f64,
    pub rot3: f64,
    pub wavelength: Option<f64>,
}

/// Pixel sizes as stored in the `Detector_config` entry of newer PONI files.
#[derive(Deserialize)]
struct DetectorConfigEntry {
    pixel1: f64,
    pixel2: f64,
}

/// Per-pixel angles for one detector, in degrees.
#[derive(Debug, Clone)]
pub struct AngularGrid {
    /// Scattering angle 2θ of every pixel centre
    pub tth: Array2<f64>,
    /// Azimuthal angle χ of every pixel centre, in [0, 360)
    pub chi: Array2<f64>,
    /// Solid angle relative to a pixel at normal incidence
    pub solid_angle: Array2<f64>,
}

impl AngularGrid {
    pub fn dim(&self) -> (usize, usize) {
        self.tth.dim()
    }
}

impl PoniGeometry {
    /// Read a PONI calibration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CakeError::io(path, e))?;
        Ok(Self::parse(&text, path)?)
    }

    /// Parse `Key: value` lines. Comment lines start with `#`.
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut pixel1 = None;
        let mut pixel2 = None;
        let mut distance = None;
        let mut poni1 = None;
        let mut poni2 = None;
        let mut rot1 = None;
        let mut rot2 = None;
        let mut rot3 = None;
        let mut wavelength = None;

        let bad = |key: &str, value: &str| ConfigError::BadCalibrationValue {
            path: path.to_path_buf(),
            key: key.to_string(),
            value: value.to_string(),
        };

        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            if key == "Detector_config" {
                let entry: DetectorConfigEntry =
                    serde_json::from_str(value).map_err(|_| bad(key, value))?;
                pixel1 = pixel1.or(Some(entry.pixel1));
                pixel2 = pixel2.or(Some(entry.pixel2));
                continue;
            }

            let slot = match key {
                "PixelSize1" => &mut pixel1,
                "PixelSize2" => &mut pixel2,
                "Distance" => &mut distance,
                "Poni1" => &mut poni1,
                "Poni2" => &mut poni2,
                "Rot1" => &mut rot1,
                "Rot2" => &mut rot2,
                "Rot3" => &mut rot3,
                "Wavelength" => &mut wavelength,
                _ => continue,
            };
            *slot = Some(value.parse::<f64>().map_err(|_| bad(key, value))?);
        }

        let require = |value: Option<f64>, key: &'static str| {
            value.ok_or_else(|| ConfigError::MissingCalibrationKey {
                path: path.to_path_buf(),
                key,
            })
        };

        Ok(Self {
            pixel1: require(pixel1, "PixelSize1")?,
            pixel2: require(pixel2, "PixelSize2")?,
            distance: require(distance, "Distance")?,
            poni1: require(poni1, "Poni1")?,
            poni2: require(poni2, "Poni2")?,
            rot1: require(rot1, "Rot1")?,
            rot2: require(rot2, "Rot2")?,
            rot3: require(rot3, "Rot3")?,
            wavelength,
        })
    }

    /// Lab-frame position of pixel centre (row, col) relative to the sample.
    ///
    /// Returns (t1, t2, t3): t3 along the beam, t1/t2 transverse.
    pub fn pixel_position(&self, row: usize, col: usize) -> (f64, f64, f64) {
        let p1 = (row as f64 + 0.5) * self.pixel1 - self.poni1;
        let p2 = (col as f64 + 0.5) * self.pixel2 - self.poni2;
        let l = self.distance;
        let (s1, c1) = self.rot1.sin_cos();
        let (s2, c2) = self.rot2.sin_cos();
        let (s3, c3) = self.rot3.sin_cos();

        let t1 = p1 * c2 * c3 + p2 * (c3 * s1 * s2 - c1 * s3) - l * (c1 * c3 * s2 + s1 * s3);
        let t2 = p1 * c2 * s3 + p2 * (c1 * c3 + s1 * s2 * s3) - l * (-(c3 * s1) + c1 * s2 * s3);
        let t3 = p1 * s2 - p2 * c2 * s1 + l * c1 * c2;
        (t1, t2, t3)
    }

    /// 2θ, χ (degrees) and solid angle of every pixel centre of a `shape` frame.
    ///
    /// χ uses the 0° branch cut, i.e. lies in [0, 360).
    pub fn angular_grid(&self, shape: (usize, usize)) -> AngularGrid {
        let mut tth = Array2::zeros(shape);
        let mut chi = Array2::zeros(shape);
        let mut solid_angle = Array2::zeros(shape);
        Zip::indexed(&mut tth)
            .and(&mut chi)
            .and(&mut solid_angle)
            .par_for_each(|(row, col), tth, chi, solid| {
                let (t1, t2, t3) = self.pixel_position(row, col);
                *tth = t1.hypot(t2).atan2(t3).to_degrees();
                *chi = t1.atan2(t2).to_degrees().rem_euclid(360.0);
                let r = (t1 * t1 + t2 * t2 + t3 * t3).sqrt();
                *solid = (self.distance / r).powi(3);
            });
        AngularGrid {
            tth,
            chi,
            solid_angle,
        }
    }
}

/// Calibrated detector: geometry plus the images that correct its frames.
///
/// Immutable after construction.
#[derive(Debug, Clone)]
pub struct Detector {
    pub index: usize,
    pub poni_path: PathBuf,
    pub geometry: PoniGeometry,
    pub ops: Vec<DataOp>,
    /// Static defect mask (true = excluded)
    pub mask: Option<Array2<bool>>,
    /// Normalised bright + dark frame subtracted from every raw frame
    pub correction: Option<Array2<f64>>,
    grid: OnceCell<Arc<AngularGrid>>,
}

impl Detector {
    /// Build detector `index` from the integration configuration.
    pub fn from_config(config: &IntegrationConfig, index: usize) -> Result<Self> {
        let poni_path = config.poni_file[index].clone();
        let geometry = PoniGeometry::load(&poni_path)?;
        let ops = match config.data_ops.get(index) {
            Some(spec) => parse_ops(spec)?,
            None => Vec::new(),
        };

        let mask = if config.do_mask {
            Some(apply_ops(load_mask(&config.mask_file[index])?, &ops))
        } else {
            None
        };

        let load_normalized = |path: &Path, norm: f64| -> Result<Array2<f64>> {
            Ok(apply_ops(load_frame(path)?, &ops) / norm)
        };

        let mut correction = None;
        if config.do_bright {
            correction = Some(load_normalized(&config.bright_file[index], config.bright_norm)?);
        }
        if config.do_dark {
            let dark = load_normalized(&config.dark_file[index], config.dark_norm)?;
            correction = Some(match correction {
                Some(bright) => {
                    check_shape(bright.dim(), dark.dim())?;
                    bright + dark
                }
                None => dark,
            });
        }

        debug!(
            "Detector {} from {}: ops={:?}, mask={}, correction={}",
            index,
            poni_path.display(),
            ops,
            mask.is_some(),
            correction.is_some()
        );

        Ok(Self {
            index,
            poni_path,
            geometry,
            ops,
            mask,
            correction,
            grid: OnceCell::new(),
        })
    }

    /// Bare detector with no mask, correction frames or data ops.
    pub fn from_geometry(index: usize, geometry: PoniGeometry) -> Self {
        Self {
            index,
            poni_path: PathBuf::new(),
            geometry,
            ops: Vec::new(),
            mask: None,
            correction: None,
            grid: OnceCell::new(),
        }
    }

    /// Build one detector per configured calibration file.
    pub fn from_config_all(config: &IntegrationConfig) -> Result<Vec<Self>> {
        config.validate()?;
        (0..config.detector_count())
            .map(|i| Self::from_config(config, i))
            .collect()
    }

    /// Load a raw frame, orient it and subtract the correction frame.
    pub fn load_image<P: AsRef<Path>>(&self, path: P) -> Result<Array2<f64>> {
        let frame = apply_ops(load_frame(path)?, &self.ops);
        match &self.correction {
            Some(correction) => {
                check_shape(correction.dim(), frame.dim())?;
                Ok(frame - correction)
            }
            None => Ok(frame),
        }
    }

    /// Mask for one frame: static defects plus every pixel reading `<= 0`.
    pub fn frame_mask(&self, frame: &Array2<f64>) -> Result<Array2<bool>> {
        let mut mask = frame.mapv(|v| v <= 0.0);
        if let Some(static_mask) = &self.mask {
            check_shape(static_mask.dim(), frame.dim())?;
            Zip::from(&mut mask)
                .and(static_mask)
                .for_each(|m, &s| *m = *m || s);
        }
        Ok(mask)
    }

    /// Pixel angles for frames of `shape`, computed once per detector.
    ///
    /// A request for a different shape than the memoised one is computed
    /// fresh and not retained.
    pub fn angular_grid(&self, shape: (usize, usize)) -> Arc<AngularGrid> {
        let grid = self
            .grid
            .get_or_init(|| Arc::new(self.geometry.angular_grid(shape)));
        if grid.dim() == shape {
            Arc::clone(grid)
        } else {
            Arc::new(self.geometry.angular_grid(shape))
        }
    }

    /// Sample-to-detector distance in millimetres.
    pub fn distance_mm(&self) -> f64 {
        self.geometry.distance * 1e3
    }
}

fn check_shape(expected: (usize, usize), found: (usize, usize)) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(CakeError::ShapeMismatch { expected, found })
    }
}
