//! Test helpers for cakemap
//!
//! Builds throwaway detector setups on disk: PONI calibration files, 16-bit
//! TIFF frames and masks, and JSON integration configs, all inside a
//! [`TempDir`] that is removed when the fixture drops.

use image::{ImageBuffer, Luma};
use ndarray::Array2;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Error type for test helper operations
#[derive(thiserror::Error, Debug)]
pub enum TestHelperError {
    #[error("fixture I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write image: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestHelperError>;

/// Flat detector geometry written as a PONI file.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSpec {
    pub rows: usize,
    pub cols: usize,
    /// Square pixel pitch in metres
    pub pixel: f64,
    pub distance: f64,
    pub poni1: f64,
    pub poni2: f64,
    pub wavelength: f64,
}

impl DetectorSpec {
    /// Square detector with the beam through its centre, 100 µm pixels at 10 cm.
    pub fn centred(size: usize) -> Self {
        let half = size as f64 * 1e-4 / 2.0;
        Self {
            rows: size,
            cols: size,
            pixel: 1e-4,
            distance: 0.1,
            poni1: half,
            poni2: half,
            wavelength: 1e-10,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn poni_text(&self) -> String {
        format!(
            "# Nota: C-Order, 1 refers to the Y axis, 2 to the X axis\n\
             PixelSize1: {p}\n\
             PixelSize2: {p}\n\
             Distance: {d}\n\
             Poni1: {p1}\n\
             Poni2: {p2}\n\
             Rot1: 0.0\n\
             Rot2: 0.0\n\
             Rot3: 0.0\n\
             Wavelength: {w}\n",
            p = self.pixel,
            d = self.distance,
            p1 = self.poni1,
            p2 = self.poni2,
            w = self.wavelength,
        )
    }
}

/// Write a 16-bit grayscale TIFF.
pub fn write_u16_tiff<P: AsRef<Path>>(path: P, frame: &Array2<u16>) -> Result<()> {
    let (rows, cols) = frame.dim();
    let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_fn(cols as u32, rows as u32, |x, y| {
            Luma([frame[[y as usize, x as usize]]])
        });
    buffer.save(path)?;
    Ok(())
}

/// Temporary directory holding one synthetic experiment.
pub struct Fixture {
    dir: TempDir,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: TempDir::new()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Create (if needed) and return a subdirectory.
    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let path = self.path().join(name);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Write `<name>.poni` for `spec`.
    pub fn write_poni(&self, name: &str, spec: &DetectorSpec) -> Result<PathBuf> {
        let path = self.path().join(format!("{name}.poni"));
        std::fs::write(&path, spec.poni_text())?;
        Ok(path)
    }

    /// Write a frame of constant `value` under `dir/name`.
    pub fn write_uniform_frame(
        &self,
        dir: &Path,
        name: &str,
        spec: &DetectorSpec,
        value: u16,
    ) -> Result<PathBuf> {
        let path = dir.join(name);
        write_u16_tiff(&path, &Array2::from_elem(spec.shape(), value))?;
        Ok(path)
    }

    /// Write an arbitrary frame under `dir/name`.
    pub fn write_frame(&self, dir: &Path, name: &str, frame: &Array2<u16>) -> Result<PathBuf> {
        let path = dir.join(name);
        write_u16_tiff(&path, frame)?;
        Ok(path)
    }

    /// Write a JSON config: [`base_config`] for `ponis` with `overrides`
    /// merged on top.
    pub fn write_config(&self, name: &str, ponis: &[PathBuf], overrides: Value) -> Result<PathBuf> {
        let mut config = base_config(ponis);
        if let (Value::Object(base), Value::Object(extra)) = (&mut config, overrides) {
            base.extend(extra);
        }
        let path = self.path().join(name);
        std::fs::write(&path, config.to_string())?;
        Ok(path)
    }

    /// Glob matching `prefix*.tif` inside `dir`.
    pub fn pattern(dir: &Path, prefix: &str) -> String {
        dir.join(format!("{prefix}*.tif")).to_string_lossy().into_owned()
    }
}

/// Minimal uncorrected 1D setup over `ponis`.
pub fn base_config(ponis: &[PathBuf]) -> Value {
    let n = ponis.len();
    json!({
        "poni_file": ponis,
        "do_mask": false,
        "mask_file": vec![""; n],
        "do_dark": false,
        "dark_file": vec![""; n],
        "do_bright": false,
        "bright_file": vec![""; n],
        "data_ops": vec![""; n],
        "do_2D": false,
        "unit": "2th_deg",
        "npt_radial": 5,
        "do_radial_range": false,
        "npt_azimuth": 1,
        "do_solid_angle": false,
        "do_polarization": false,
        "do_remove_nan": true,
        "error_model": "poisson"
    })
}

/// Numeric rows of a whitespace separated text file; header lines skipped.
pub fn numeric_rows<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<f64>>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter_map(|line| {
            let fields: Option<Vec<f64>> =
                line.split_whitespace().map(|f| f.parse().ok()).collect();
            fields.filter(|f| !f.is_empty())
        })
        .collect())
}
