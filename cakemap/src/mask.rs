//! Bin-level validity mask shared by intensity, coordinates and uncertainty.

use ndarray::{Array2, ArrayView2, Zip};

use crate::error::{CakeError, Result};

/// Valid entries of one azimuth row, in radial order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskedRow {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub intensity: Vec<f64>,
    pub sigma: Vec<f64>,
}

impl MaskedRow {
    pub fn len(&self) -> usize {
        self.intensity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensity.is_empty()
    }
}

/// Four same-shaped (azimuth, radial) arrays under one mask.
#[derive(Debug, Clone)]
pub struct MaskedBins {
    /// true = excluded
    pub mask: Array2<bool>,
    pub intensity: Array2<f64>,
    pub x: Array2<f64>,
    pub y: Array2<f64>,
    pub sigma: Array2<f64>,
}

/// Builds [`MaskedBins`] from integrated and resampled arrays.
pub struct MaskComposer;

impl MaskComposer {
    /// Mask every bin whose coordinates or intensity are non-finite, or whose
    /// intensity is exactly zero.
    pub fn compose(
        intensity: ArrayView2<f64>,
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        sigma: ArrayView2<f64>,
    ) -> Result<MaskedBins> {
        let expected = intensity.dim();
        for found in [x.dim(), y.dim(), sigma.dim()] {
            if found != expected {
                return Err(CakeError::ShapeMismatch { expected, found });
            }
        }

        let mask = Zip::from(&intensity)
            .and(&x)
            .and(&y)
            .map_collect(|&i, &x, &y| {
                !x.is_finite() || !y.is_finite() || !i.is_finite() || i == 0.0
            });

        Ok(MaskedBins {
            mask,
            intensity: intensity.to_owned(),
            x: x.to_owned(),
            y: y.to_owned(),
            sigma: sigma.to_owned(),
        })
    }
}

impl MaskedBins {
    pub fn rows(&self) -> usize {
        self.mask.nrows()
    }

    /// Number of unmasked bins.
    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|&&m| !m).count()
    }

    /// Unmasked entries of azimuth row `i`; all four vectors have equal length.
    pub fn row(&self, i: usize) -> MaskedRow {
        let mut row = MaskedRow::default();
        Zip::from(self.mask.row(i))
            .and(self.x.row(i))
            .and(self.y.row(i))
            .and(self.intensity.row(i))
            .and(self.sigma.row(i))
            .for_each(|&masked, &x, &y, &intensity, &sigma| {
                if !masked {
                    row.x.push(x);
                    row.y.push(y);
                    row.intensity.push(intensity);
                    row.sigma.push(sigma);
                }
            });
        row
    }
}
