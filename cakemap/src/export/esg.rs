//! MAUD `esg` block files.
//!
//! Spectrum blocks carry radial position, intensity and uncertainty. The
//! detector-map variant carries the resampled detector-plane position of each
//! bin instead of its radial position, behind one instrument block.

use ndarray::{ArrayView1, ArrayView2};
use std::io::Write;
use std::path::Path;
use tracing::debug;

use super::numfmt::{fixed6, sci18, short};
use super::{remove_existing, write_file, Columns};
use crate::error::{CakeError, Result};
use crate::mask::MaskedBins;

/// Write spectrum blocks `(block id, eta, columns)` to `path`.
///
/// Entries with non-finite intensity are dropped and blocks left empty are
/// not written. Returns the number of blocks written.
pub(crate) fn write_esg_blocks(path: &Path, blocks: &[(usize, f64, &Columns)]) -> Result<usize> {
    remove_existing(path)?;
    let mut written = 0;
    write_file(path, |w| {
        for &(id, eta, columns) in blocks {
            let finite: Vec<usize> = (0..columns.len())
                .filter(|&k| columns.intensity[k].is_finite())
                .collect();
            if finite.is_empty() {
                debug!("Skipping empty block #{} in {}", id, path.display());
                continue;
            }
            write!(
                w,
                "\n_pd_block_id noTitle|#{id}\n\
                 _pd_meas_angle_eta {}\n\
                 _pd_meas_angle_omega 0.0\n\n\
                 loop_\n\
                 _pd_meas_position_x _pd_meas_intensity_total _pd_proc_intensity_weight\n",
                short(eta)
            )?;
            for k in finite {
                writeln!(
                    w,
                    "{}\t{}\t{}",
                    sci18(columns.radial[k]),
                    sci18(columns.intensity[k]),
                    sci18(columns.sigma[k])
                )?;
            }
            written += 1;
        }
        Ok(())
    })?;
    Ok(written)
}

/// Every azimuth row of a 2D result as one block, block id = row index.
pub fn write_esg1(
    path: &Path,
    radial: ArrayView1<f64>,
    intensity: ArrayView2<f64>,
    azimuthal: ArrayView1<f64>,
    sigma: ArrayView2<f64>,
) -> Result<usize> {
    if intensity.dim() != sigma.dim() || intensity.nrows() != azimuthal.len() {
        return Err(CakeError::ShapeMismatch {
            expected: intensity.dim(),
            found: (azimuthal.len(), sigma.ncols()),
        });
    }

    let rows: Vec<Columns> = (0..intensity.nrows())
        .map(|i| Columns {
            radial: radial.to_vec(),
            intensity: intensity.row(i).to_vec(),
            sigma: sigma.row(i).to_vec(),
        })
        .collect();
    let blocks: Vec<(usize, f64, &Columns)> = rows
        .iter()
        .zip(azimuthal.iter())
        .enumerate()
        .map(|(i, (columns, &eta))| (i, eta, columns))
        .collect();
    write_esg_blocks(path, &blocks)
}

/// Write the inclined-detector map of one detector.
///
/// Blocks follow ascending `azimuthal` (branch-cut corrected, may be
/// negative); eta is written in [0, 360). Empty rows are skipped and block
/// ids count only written blocks. Data block ids run densely from `#0`, so
/// the first data block shares `#0` with the instrument block.
///
/// The first position column holds the detector's first (row) axis and the
/// second its column axis.
pub fn write_esg_detector(
    path: &Path,
    bins: &MaskedBins,
    azimuthal: ArrayView1<f64>,
    distance_mm: f64,
) -> Result<usize> {
    if bins.rows() != azimuthal.len() {
        return Err(CakeError::ShapeMismatch {
            expected: bins.mask.dim(),
            found: (azimuthal.len(), bins.mask.ncols()),
        });
    }

    let mut order: Vec<usize> = (0..azimuthal.len()).collect();
    order.sort_by(|&a, &b| azimuthal[a].total_cmp(&azimuthal[b]));

    remove_existing(path)?;
    let mut block_id = 0usize;
    write_file(path, |w| {
        write_instrument_block(w, distance_mm)?;
        for i in order {
            let row = bins.row(i);
            if row.is_empty() {
                debug!("Skipping empty azimuth row {} in {}", i, path.display());
                continue;
            }
            let eta = if azimuthal[i] < 0.0 {
                azimuthal[i] + 360.0
            } else {
                azimuthal[i]
            };
            writeln!(w, "_pd_block_id noTitle|#{block_id}")?;
            writeln!(w)?;
            writeln!(w, "_pd_meas_angle_eta {}", fixed6(eta))?;
            writeln!(w)?;
            writeln!(w, "loop_")?;
            writeln!(
                w,
                "_pd_meas_position_x _pd_meas_position_y _pd_meas_intensity_total _pd_meas_intensity_sigma"
            )?;
            for k in 0..row.len() {
                writeln!(
                    w,
                    "{} {} {} {}",
                    fixed6(row.y[k]),
                    fixed6(row.x[k]),
                    fixed6(row.intensity[k]),
                    fixed6(row.sigma[k])
                )?;
            }
            writeln!(w)?;
            block_id += 1;
        }
        Ok(())
    })?;
    Ok(block_id)
}

fn write_instrument_block<W: Write>(w: &mut W, distance_mm: f64) -> std::io::Result<()> {
    writeln!(w, "_pd_block_id noTitle|#0")?;
    writeln!(w)?;
    for line in [
        "_diffrn_detector 2D",
        "_diffrn_detector_type CCD like",
        "_pd_meas_step_count_time ?",
        "_diffrn_measurement_method diffraction_image",
        "_diffrn_measurement_distance_unit mm",
    ] {
        writeln!(w, "{line}")?;
    }
    writeln!(w, "_pd_instr_dist_spec/detc {}", fixed6(distance_mm))?;
    for line in [
        "_diffrn_radiation_wavelength ?",
        "_diffrn_source_target ?",
        "_diffrn_source_power ?",
        "_diffrn_source_current ?",
        "_pd_meas_angle_omega 0.0",
        "_pd_meas_angle_chi 0.0",
        "_pd_meas_angle_phi 0.0",
        "_pd_meas_orientation_2theta 0",
        "_riet_par_spec_displac_x 0",
        "_riet_par_spec_displac_y 0",
        "_riet_par_spec_displac_z 0",
        "_riet_meas_datafile_calibrated false",
    ] {
        writeln!(w, "{line}")?;
    }
    Ok(())
}
