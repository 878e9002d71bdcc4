//! Mapping of polar histogram bins back onto detector pixel coordinates.
//!
//! For each (azimuth, radial) bin centre the resampler finds the detector
//! position whose pixel angles interpolate to that centre. The pixel grid's
//! (χ, radial) samples are triangulated by [`cake_math::MeshInterpolator`]
//! and the column and row indices are interpolated barycentrically.

mod cache;

pub use cache::{CacheKey, CoordinateCache};

use cake_math::MeshInterpolator;
use ndarray::{Array1, Array2, ArrayView1};
use tracing::{debug, info};

use crate::calibration::{AngularGrid, Detector};
use crate::error::{ConfigError, Result};
use crate::integrator::RadialUnit;

/// Widest χ spread (degrees) a mesh triangle may have before it is treated
/// as straddling the branch cut and dropped.
const MAX_CHI_SPAN: f64 = 180.0;

/// Detector-plane position (mm) of every histogram bin.
///
/// Both arrays are (azimuth, radial) shaped. `x` follows the detector's
/// second (column) axis and `y` its first (row) axis, each measured from the
/// point of normal incidence. Bins that fall off the detector are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateMap {
    pub x: Array2<f64>,
    pub y: Array2<f64>,
}

/// Result of resampling one detector.
#[derive(Debug, Clone)]
pub struct Resampled {
    pub map: CoordinateMap,
    /// Azimuthal axis after the branch-cut shift (unchanged if none applied)
    pub azimuthal: Array1<f64>,
    pub wrapped: bool,
    pub cache_hit: bool,
}

/// True when the rounded pixel χ values reach both 0° and 360°.
pub fn spans_branch_cut(chi: &Array2<f64>) -> bool {
    let (mut has_zero, mut has_full) = (false, false);
    for &c in chi.iter() {
        let rounded = c.round();
        has_zero |= rounded == 0.0;
        has_full |= rounded == 360.0;
        if has_zero && has_full {
            return true;
        }
    }
    false
}

/// Move angles at or past 180° down by a full turn.
///
/// The result lies in [-180, 180): exactly 180° becomes -180°, matching the
/// χ ≥ 180 rule applied to pixel angles rather than a (-180, 180] range.
pub fn shift_branch_cut(angle: f64) -> f64 {
    if angle >= 180.0 {
        angle - 360.0
    } else {
        angle
    }
}

/// Computes [`CoordinateMap`]s, reusing cached ones when the key matches.
#[derive(Debug, Clone)]
pub struct GeometricResampler {
    cache: CoordinateCache,
}

impl GeometricResampler {
    pub fn new(cache: CoordinateCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &CoordinateCache {
        &self.cache
    }

    /// Coordinate map of `detector` for frames of `shape` and the given axes.
    pub fn resample(
        &self,
        detector: &Detector,
        shape: (usize, usize),
        unit: RadialUnit,
        radial: ArrayView1<f64>,
        azimuthal: ArrayView1<f64>,
    ) -> Result<Resampled> {
        let grid = detector.angular_grid(shape);
        let wrapped = spans_branch_cut(&grid.chi);
        let azimuthal = if wrapped {
            azimuthal.mapv(shift_branch_cut)
        } else {
            azimuthal.to_owned()
        };

        let key = CacheKey {
            shape,
            radial: radial.to_vec(),
            azimuthal: azimuthal.to_vec(),
        };

        if let Some(map) = self.cache.load(detector.index, &key) {
            debug!("Coordinate cache hit for detector {}", detector.index);
            return Ok(Resampled {
                map,
                azimuthal,
                wrapped,
                cache_hit: true,
            });
        }

        info!(
            "Computing binned detector coordinates for detector {} ({}x{} pixels, {}x{} bins)",
            detector.index,
            shape.0,
            shape.1,
            azimuthal.len(),
            radial.len()
        );
        let map = compute_map(detector, &grid, unit, radial, azimuthal.view(), wrapped)?;
        self.cache.store(detector.index, &key, &map)?;

        Ok(Resampled {
            map,
            azimuthal,
            wrapped,
            cache_hit: false,
        })
    }
}

fn compute_map(
    detector: &Detector,
    grid: &AngularGrid,
    unit: RadialUnit,
    radial: ArrayView1<f64>,
    azimuthal: ArrayView1<f64>,
    wrapped: bool,
) -> Result<CoordinateMap> {
    let geometry = &detector.geometry;
    let wavelength = match geometry.wavelength {
        Some(w) => w,
        None if unit.needs_wavelength() => {
            return Err(ConfigError::Invalid(format!(
                "radial unit {unit} needs a wavelength in {}",
                detector.poni_path.display()
            ))
            .into())
        }
        None => f64::NAN,
    };

    let chi = if wrapped {
        grid.chi.mapv(shift_branch_cut)
    } else {
        grid.chi.clone()
    };
    let pixel_radial = grid.tth.mapv(|tth| unit.from_tth_deg(tth, wavelength));

    let mesh = MeshInterpolator::from_grid(chi.view(), pixel_radial.view(), Some(MAX_CHI_SPAN))?;
    let (rows, cols) = grid.dim();
    let row_index: Vec<f64> = (0..rows * cols).map(|n| (n / cols) as f64).collect();
    let col_index: Vec<f64> = (0..rows * cols).map(|n| (n % cols) as f64).collect();

    let queries: Vec<(f64, f64)> = azimuthal
        .iter()
        .flat_map(|&az| radial.iter().map(move |&r| (az, r)))
        .collect();
    let located = mesh.par_locate(&queries);

    let n_radial = radial.len();
    let mut x = Array2::from_elem((azimuthal.len(), n_radial), f64::NAN);
    let mut y = x.clone();
    for (n, hit) in located.iter().enumerate() {
        if let Some(b) = hit {
            let bin = [n / n_radial, n % n_radial];
            x[bin] = (b.apply(&col_index) * geometry.pixel2 - geometry.poni2) * 1e3;
            y[bin] = (b.apply(&row_index) * geometry.pixel1 - geometry.poni1) * 1e3;
        }
    }

    Ok(CoordinateMap { x, y })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::PoniGeometry;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::TempDir;

    fn detector(poni1: f64, poni2: f64) -> Detector {
        Detector::from_geometry(
            0,
            PoniGeometry {
                pixel1: 1e-4,
                pixel2: 1e-4,
                distance: 0.1,
                poni1,
                poni2,
                rot1: 0.0,
                rot2: 0.0,
                rot3: 0.0,
                wavelength: Some(1e-10),
            },
        )
    }

    #[test]
    fn test_branch_cut_detection() {
        assert!(spans_branch_cut(&array![[0.2, 359.7], [90.0, 180.0]]));
        assert!(!spans_branch_cut(&array![[0.2, 300.0], [90.0, 180.0]]));
        assert!(!spans_branch_cut(&array![[10.0, 359.7]]));
    }

    #[test]
    fn test_shift_maps_into_half_open_turn() {
        assert_eq!(shift_branch_cut(350.0), -10.0);
        assert_eq!(shift_branch_cut(10.0), 10.0);
        assert_eq!(shift_branch_cut(190.0), -170.0);
        assert_eq!(shift_branch_cut(180.0), -180.0);
        assert_eq!(shift_branch_cut(179.9), 179.9);
    }

    #[test]
    fn test_off_centre_detector_maps_bins_back_to_pixels() {
        // Beam lands above the frame: χ stays inside (0, 180)
        let det = detector(-0.0005, 0.0010);
        let shape = (20, 20);
        let grid = det.angular_grid(shape);

        // Bin centred on pixel (7, 11) maps back to that pixel
        let (r, c) = (7usize, 11usize);
        let radial = array![grid.tth[[r, c]]];
        let azimuthal = array![grid.chi[[r, c]]];

        let dir = TempDir::new().unwrap();
        let resampler = GeometricResampler::new(CoordinateCache::new(dir.path()));
        let out = resampler
            .resample(&det, shape, RadialUnit::TwoThetaDeg, radial.view(), azimuthal.view())
            .unwrap();

        assert!(!out.wrapped);
        assert!(!out.cache_hit);
        let expected_x = (c as f64 * 1e-4 - 0.0010) * 1e3;
        let expected_y = (r as f64 * 1e-4 + 0.0005) * 1e3;
        assert_abs_diff_eq!(out.map.x[[0, 0]], expected_x, epsilon = 1e-6);
        assert_abs_diff_eq!(out.map.y[[0, 0]], expected_y, epsilon = 1e-6);
    }

    #[test]
    fn test_bins_off_the_detector_are_nan() {
        let det = detector(-0.0005, 0.0010);
        let dir = TempDir::new().unwrap();
        let resampler = GeometricResampler::new(CoordinateCache::new(dir.path()));
        let out = resampler
            .resample(
                &det,
                (20, 20),
                RadialUnit::TwoThetaDeg,
                array![45.0].view(),
                array![270.0].view(),
            )
            .unwrap();
        assert!(out.map.x[[0, 0]].is_nan());
        assert!(out.map.y[[0, 0]].is_nan());
    }
}
