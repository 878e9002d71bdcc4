use ndarray::{Array1, Array2, Zip};
use tracing::debug;

use super::{BinnedResult, ErrorModel, IntegrationParams, Integrator};
use crate::calibration::Detector;
use crate::error::{CakeError, ConfigError, Result};

/// Plain pixel-centre histogramming over every detector of a set.
///
/// Each unmasked pixel lands in exactly one (azimuth, radial) bin; a bin's
/// intensity is the mean of its corrected pixel values and NaN when empty.
/// No pixel splitting is done.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistogramIntegrator;

/// Evenly spaced bins over `[lo, hi]`, upper edge inclusive.
#[derive(Debug, Clone, Copy)]
struct Bins {
    lo: f64,
    hi: f64,
    count: usize,
}

impl Bins {
    fn width(&self) -> f64 {
        (self.hi - self.lo) / self.count as f64
    }

    fn index(&self, value: f64) -> Option<usize> {
        if !(value >= self.lo && value <= self.hi) {
            return None;
        }
        let width = self.width();
        if width <= 0.0 {
            return Some(0);
        }
        let i = ((value - self.lo) / width).floor() as usize;
        Some(i.min(self.count - 1))
    }

    fn centers(&self) -> Array1<f64> {
        let width = self.width();
        Array1::from_shape_fn(self.count, |i| self.lo + (i as f64 + 0.5) * width)
    }
}

/// One unmasked pixel ready for binning.
struct Sample {
    radial: f64,
    chi: f64,
    value: f64,
}

impl HistogramIntegrator {
    fn samples(
        detectors: &[Detector],
        frames: &[Array2<f64>],
        masks: &[Array2<bool>],
        params: &IntegrationParams,
    ) -> Result<Vec<Sample>> {
        let mut samples = Vec::new();
        for ((detector, frame), mask) in detectors.iter().zip(frames).zip(masks) {
            if frame.dim() != mask.dim() {
                return Err(CakeError::ShapeMismatch {
                    expected: frame.dim(),
                    found: mask.dim(),
                });
            }

            let wavelength = match detector.geometry.wavelength {
                Some(w) => w,
                None if params.unit.needs_wavelength() => {
                    return Err(ConfigError::Invalid(format!(
                        "radial unit {} needs a wavelength in {}",
                        params.unit,
                        detector.poni_path.display()
                    ))
                    .into())
                }
                None => f64::NAN,
            };

            let grid = detector.angular_grid(frame.dim());
            Zip::from(frame)
                .and(mask)
                .and(&grid.tth)
                .and(&grid.chi)
                .and(&grid.solid_angle)
                .for_each(|&value, &masked, &tth, &chi, &solid| {
                    if masked || !value.is_finite() {
                        return;
                    }
                    let mut value = value;
                    if params.correct_solid_angle {
                        value /= solid;
                    }
                    if let Some(factor) = params.polarization_factor {
                        value /= polarization(tth, chi, factor);
                    }
                    samples.push(Sample {
                        radial: params.unit.from_tth_deg(tth, wavelength),
                        chi,
                        value,
                    });
                });
        }
        Ok(samples)
    }
}

/// Polarization correction factor for a linearly polarized beam.
fn polarization(tth_deg: f64, chi_deg: f64, factor: f64) -> f64 {
    let (s, c) = tth_deg.to_radians().sin_cos();
    let cos2chi = (2.0 * chi_deg.to_radians()).cos();
    0.5 * (1.0 + c * c - factor * cos2chi * s * s)
}

impl Integrator for HistogramIntegrator {
    fn integrate(
        &self,
        detectors: &[Detector],
        frames: &[Array2<f64>],
        masks: &[Array2<bool>],
        params: &IntegrationParams,
    ) -> Result<BinnedResult> {
        if detectors.len() != frames.len() || frames.len() != masks.len() {
            return Err(CakeError::Integration(format!(
                "{} detectors, {} frames and {} masks",
                detectors.len(),
                frames.len(),
                masks.len()
            )));
        }

        let samples = Self::samples(detectors, frames, masks, params)?;

        let [r_lo, r_hi] = match params.radial_range {
            Some(range) => range,
            None => samples
                .iter()
                .fold([f64::INFINITY, f64::NEG_INFINITY], |[lo, hi], s| {
                    [lo.min(s.radial), hi.max(s.radial)]
                }),
        };
        if !(r_lo.is_finite() && r_hi.is_finite()) {
            return Err(CakeError::Integration(
                "no unmasked pixels to define a radial range".into(),
            ));
        }

        let radial_bins = Bins {
            lo: r_lo,
            hi: r_hi,
            count: params.npt_radial,
        };
        let azimuth_bins = Bins {
            lo: params.azimuth_range[0],
            hi: params.azimuth_range[1],
            count: params.npt_azimuth.unwrap_or(1),
        };

        let shape = (azimuth_bins.count, radial_bins.count);
        let mut sum = Array2::<f64>::zeros(shape);
        let mut count = Array2::<f64>::zeros(shape);
        let mut dropped = 0usize;
        for sample in &samples {
            match (azimuth_bins.index(sample.chi), radial_bins.index(sample.radial)) {
                (Some(a), Some(r)) => {
                    sum[[a, r]] += sample.value;
                    count[[a, r]] += 1.0;
                }
                _ => dropped += 1,
            }
        }
        debug!(
            "Binned {} pixels into {:?} bins, {} outside range",
            samples.len() - dropped,
            shape,
            dropped
        );

        let intensity = Zip::from(&sum)
            .and(&count)
            .map_collect(|&s, &n| if n > 0.0 { s / n } else { f64::NAN });
        let sigma = match params.error_model {
            ErrorModel::Poisson => Some(
                Zip::from(&sum)
                    .and(&count)
                    .map_collect(|&s, &n| if n > 0.0 { s.sqrt() / n } else { f64::NAN }),
            ),
            _ => None,
        };

        Ok(BinnedResult {
            radial: radial_bins.centers(),
            azimuthal: params.npt_azimuth.map(|_| azimuth_bins.centers()),
            intensity,
            sigma,
            unit: params.unit,
        })
    }
}
