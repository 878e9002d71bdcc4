//! JSON integration settings (`*.azimint.json`).
//!
//! Per-detector entries are parallel lists indexed by detector; everything
//! else applies to the whole run. Missing keys fall back to the values
//! written by [`IntegrationConfig::write_template`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CakeError, ConfigError, Result};
use crate::image_proc::parse_ops;
use crate::integrator::{ErrorModel, IntegrationParams, RadialUnit};

/// File name used by `--template`.
pub const TEMPLATE_FILE: &str = "template.azimint.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// PONI calibration file per detector
    pub poni_file: Vec<PathBuf>,
    pub do_mask: bool,
    /// Static defect mask image per detector (nonzero = masked)
    pub mask_file: Vec<PathBuf>,
    pub do_dark: bool,
    pub dark_file: Vec<PathBuf>,
    pub dark_norm: f64,
    pub do_bright: bool,
    pub bright_file: Vec<PathBuf>,
    pub bright_norm: f64,
    /// Space separated orientation ops per detector, e.g. `"flipud rotcw"`
    pub data_ops: Vec<String>,
    pub do_polarization: bool,
    pub polarization_factor: f64,
    #[serde(rename = "do_2D")]
    pub do_2d: bool,
    pub unit: RadialUnit,
    pub npt_radial: usize,
    pub do_radial_range: bool,
    pub radial_range: [f64; 2],
    pub npt_azimuth: usize,
    pub do_azimuthal_range: bool,
    pub azimuth_range: [f64; 2],
    pub chi_discontinuity_at_0: bool,
    pub do_solid_angle: bool,
    pub do_remove_nan: bool,
    pub error_model: ErrorModel,
    /// Integration method selector, passed through to the integrator
    pub method: Vec<String>,
    pub opencl_device: String,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            poni_file: vec![PathBuf::new()],
            do_mask: true,
            mask_file: vec![PathBuf::new()],
            do_dark: false,
            dark_file: vec![PathBuf::new()],
            dark_norm: 1.0,
            do_bright: false,
            bright_file: vec![PathBuf::new()],
            bright_norm: 1.0,
            data_ops: vec![String::new()],
            do_polarization: false,
            polarization_factor: 0.99,
            do_2d: false,
            unit: RadialUnit::TwoThetaDeg,
            npt_radial: 2000,
            do_radial_range: true,
            radial_range: [8.0, 70.0],
            npt_azimuth: 72,
            do_azimuthal_range: false,
            azimuth_range: [0.0, 360.0],
            chi_discontinuity_at_0: true,
            do_solid_angle: true,
            do_remove_nan: true,
            error_model: ErrorModel::Poisson,
            method: vec!["full".into(), "histogram".into(), "cython".into()],
            opencl_device: "cpu".into(),
        }
    }
}

impl IntegrationConfig {
    /// Load and validate a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CakeError::io(path, e))?;
        let config: Self = serde_json::from_str(&text).map_err(|source| CakeError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default settings as a starting point for a new setup.
    pub fn write_template<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&Self::default()).map_err(|source| {
            CakeError::Json {
                path: path.to_path_buf(),
                source,
            }
        })?;
        std::fs::write(path, json).map_err(|e| CakeError::io(path, e))
    }

    /// Number of detectors, one per calibration file.
    pub fn detector_count(&self) -> usize {
        self.poni_file.len()
    }

    /// Whether the run produces caked (azimuth × radial) output.
    pub fn is_2d(&self) -> bool {
        self.do_2d || self.npt_azimuth != 1
    }

    /// Check per-detector list lengths, op names and bin counts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let expected = self.detector_count();
        if expected == 0 {
            return Err(ConfigError::Invalid("no calibration files configured".into()));
        }

        let mut lists: Vec<(&'static str, usize)> = Vec::new();
        if self.do_mask {
            lists.push(("mask_file", self.mask_file.len()));
        }
        if self.do_dark {
            lists.push(("dark_file", self.dark_file.len()));
        }
        if self.do_bright {
            lists.push(("bright_file", self.bright_file.len()));
        }
        if !self.data_ops.is_empty() {
            lists.push(("data_ops", self.data_ops.len()));
        }
        for (field, found) in lists {
            if found != expected {
                return Err(ConfigError::DetectorListLength {
                    field,
                    expected,
                    found,
                });
            }
        }

        for spec in &self.data_ops {
            parse_ops(spec)?;
        }

        if self.npt_radial == 0 || self.npt_azimuth == 0 {
            return Err(ConfigError::Invalid(
                "npt_radial and npt_azimuth must be positive".into(),
            ));
        }
        if self.dark_norm == 0.0 || self.bright_norm == 0.0 {
            return Err(ConfigError::Invalid(
                "dark_norm and bright_norm must be nonzero".into(),
            ));
        }
        Ok(())
    }

    /// Integration settings handed to the integrator for every image set.
    pub fn integration_params(&self) -> IntegrationParams {
        IntegrationParams {
            npt_radial: self.npt_radial,
            npt_azimuth: if self.is_2d() {
                Some(self.npt_azimuth)
            } else {
                None
            },
            unit: self.unit,
            radial_range: self.do_radial_range.then_some(self.radial_range),
            azimuth_range: if self.do_azimuthal_range {
                self.azimuth_range
            } else {
                [0.0, 360.0]
            },
            polarization_factor: self.do_polarization.then_some(self.polarization_factor),
            correct_solid_angle: self.do_solid_angle,
            error_model: self.error_model,
            method: self.method.clone(),
        }
    }
}
