//! Azimuthal integration seam.
//!
//! The pipeline only depends on the [`Integrator`] trait: frames and masks
//! go in, a polar histogram comes out. [`HistogramIntegrator`] is the
//! bundled implementation.

mod histogram;

pub use histogram::HistogramIntegrator;

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::calibration::Detector;
use crate::error::{ConfigError, Result};

/// Physical quantity of the radial histogram axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadialUnit {
    #[serde(rename = "2th_deg")]
    TwoThetaDeg,
    #[serde(rename = "2th_rad")]
    TwoThetaRad,
    #[serde(rename = "q_nm^-1")]
    QNm,
    #[serde(rename = "q_A^-1")]
    QA,
}

impl RadialUnit {
    pub fn name(self) -> &'static str {
        match self {
            RadialUnit::TwoThetaDeg => "2th_deg",
            RadialUnit::TwoThetaRad => "2th_rad",
            RadialUnit::QNm => "q_nm^-1",
            RadialUnit::QA => "q_A^-1",
        }
    }

    pub fn needs_wavelength(self) -> bool {
        matches!(self, RadialUnit::QNm | RadialUnit::QA)
    }

    /// Convert a scattering angle 2θ in degrees to this unit.
    ///
    /// `wavelength` is in metres and only read for q units.
    pub fn from_tth_deg(self, tth_deg: f64, wavelength: f64) -> f64 {
        match self {
            RadialUnit::TwoThetaDeg => tth_deg,
            RadialUnit::TwoThetaRad => tth_deg.to_radians(),
            RadialUnit::QNm | RadialUnit::QA => {
                let q_per_m =
                    4.0 * std::f64::consts::PI * (tth_deg.to_radians() / 2.0).sin() / wavelength;
                if self == RadialUnit::QNm {
                    q_per_m * 1e-9
                } else {
                    q_per_m * 1e-10
                }
            }
        }
    }
}

impl fmt::Display for RadialUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RadialUnit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            RadialUnit::TwoThetaDeg,
            RadialUnit::TwoThetaRad,
            RadialUnit::QNm,
            RadialUnit::QA,
        ]
        .into_iter()
        .find(|unit| unit.name() == s)
        .ok_or_else(|| ConfigError::UnknownUnit(s.to_string()))
    }
}

/// Uncertainty model requested from the integrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorModel {
    #[serde(alias = "Poisson")]
    Poisson,
    #[serde(alias = "Azimuthal")]
    Azimuthal,
    #[serde(alias = "None", alias = "")]
    None,
}

/// Binning and correction settings for one integration call.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationParams {
    pub npt_radial: usize,
    /// `None` requests a 1D pattern
    pub npt_azimuth: Option<usize>,
    pub unit: RadialUnit,
    /// Explicit radial range; `None` spans the unmasked pixels
    pub radial_range: Option<[f64; 2]>,
    /// Azimuthal range in degrees
    pub azimuth_range: [f64; 2],
    pub polarization_factor: Option<f64>,
    pub correct_solid_angle: bool,
    pub error_model: ErrorModel,
    pub method: Vec<String>,
}

/// Raw output of an integrator.
#[derive(Debug, Clone)]
pub struct BinnedResult {
    pub radial: Array1<f64>,
    /// Azimuthal bin centres in degrees, present for 2D results
    pub azimuthal: Option<Array1<f64>>,
    /// (azimuth, radial) intensities; one row for 1D results
    pub intensity: Array2<f64>,
    pub sigma: Option<Array2<f64>>,
    pub unit: RadialUnit,
}

/// Integrated pattern with a guaranteed uncertainty array.
#[derive(Debug, Clone)]
pub struct Histogram {
    pub radial: Array1<f64>,
    pub azimuthal: Option<Array1<f64>>,
    pub intensity: Array2<f64>,
    pub sigma: Array2<f64>,
    pub unit: RadialUnit,
}

impl BinnedResult {
    /// Fill in `1/sqrt(I)` uncertainties when the integrator gave none.
    ///
    /// Negative intensities become NaN first, in the exported intensity too.
    pub fn into_histogram(self) -> Histogram {
        let BinnedResult {
            radial,
            azimuthal,
            mut intensity,
            sigma,
            unit,
        } = self;

        let sigma = match sigma {
            Some(sigma) => sigma,
            None => {
                intensity.mapv_inplace(|v| if v < 0.0 { f64::NAN } else { v });
                intensity.mapv(|v| 1.0 / v.sqrt())
            }
        };

        Histogram {
            radial,
            azimuthal,
            intensity,
            sigma,
            unit,
        }
    }
}

impl Histogram {
    pub fn is_2d(&self) -> bool {
        self.azimuthal.is_some()
    }

    /// Spectrum of azimuth row `i`.
    pub fn row(&self, i: usize) -> (ArrayView1<'_, f64>, ArrayView1<'_, f64>) {
        (self.intensity.row(i), self.sigma.row(i))
    }
}

/// Reduces detector frames to a polar histogram.
pub trait Integrator: Send + Sync {
    /// Integrate one image set.
    ///
    /// `frames[i]` and `masks[i]` belong to `detectors[i]`; masked pixels
    /// (true) are excluded.
    fn integrate(
        &self,
        detectors: &[Detector],
        frames: &[Array2<f64>],
        masks: &[Array2<bool>],
        params: &IntegrationParams,
    ) -> Result<BinnedResult>;
}
