//! Column text formats: `dat`, `xy`, `xy-noheader`, `xye`, `fxye`.

use std::io::Write;
use std::path::Path;

use super::numfmt::{sci18, short};
use super::{write_file, Columns, ExportOptions};
use crate::error::Result;

/// `/*`, `# <file>`, `*/` comment block used by the xy family.
fn comment_header(path: &Path) -> String {
    format!("/*\n# {}\n*/", path.display())
}

pub(super) fn write_xy(path: &Path, columns: &Columns, with_header: bool) -> Result<()> {
    write_file(path, |w| {
        if with_header {
            writeln!(w, "{}", comment_header(path))?;
        }
        for (&r, &i) in columns.radial.iter().zip(&columns.intensity) {
            writeln!(w, "{}\t{}", sci18(r), sci18(i))?;
        }
        Ok(())
    })
}

pub(super) fn write_xye(path: &Path, columns: &Columns) -> Result<()> {
    write_file(path, |w| {
        writeln!(w, "{}", comment_header(path))?;
        write_three_columns(w, columns, 1.0)
    })
}

/// GSAS FXYE with a constant-step bank line; positions in centidegrees.
pub(super) fn write_fxye(path: &Path, columns: &Columns) -> Result<()> {
    let n = columns.len();
    let start = columns.radial.first().copied().unwrap_or(0.0);
    let step = match columns.radial.get(1) {
        Some(&second) => second - start,
        None => 0.0,
    };
    write_file(path, |w| {
        writeln!(w, "{}", path.display())?;
        writeln!(
            w,
            "BANK 1 {n} {n} CONS {} {} 0 0 FXYE",
            short(start),
            short(step)
        )?;
        write_three_columns(w, columns, 100.0)
    })
}

/// Metadata header followed by radial, intensity and uncertainty columns.
pub(super) fn write_dat(path: &Path, columns: &Columns, options: &ExportOptions) -> Result<()> {
    let flag = |on: bool| if on { "True" } else { "False" };
    write_file(path, |w| {
        writeln!(w, "# == Integration calibration ==")?;
        for (i, detector) in options.detectors.iter().enumerate() {
            let g = &detector.geometry;
            writeln!(w, "# Detector {i}: {}", detector.poni_path.display())?;
            writeln!(w, "# Distance Sample to Detector: {} m", short(g.distance))?;
            writeln!(w, "# PONI: {}, {} m", short(g.poni1), short(g.poni2))?;
            writeln!(
                w,
                "# Rotations: {} {} {} rad",
                short(g.rot1),
                short(g.rot2),
                short(g.rot3)
            )?;
            writeln!(w, "# Pixel size: {}, {} m", short(g.pixel1), short(g.pixel2))?;
            match g.wavelength {
                Some(wavelength) => writeln!(w, "# Wavelength: {} m", short(wavelength))?,
                None => writeln!(w, "# Wavelength: unknown")?,
            }
        }
        writeln!(w, "# Mask applied: {}", flag(options.has_mask))?;
        writeln!(w, "# Dark current applied: {}", flag(options.has_dark))?;
        writeln!(w, "# Flat field applied: {}", flag(options.has_bright))?;
        match options.polarization_factor {
            Some(factor) => writeln!(w, "# Polarization factor: {}", short(factor))?,
            None => writeln!(w, "# Polarization factor: None")?,
        }
        writeln!(w, "# --> {}", path.display())?;
        writeln!(w, "#{:>21} {:>24} {:>24}", options.unit.name(), "I", "sigma")?;
        for ((&r, &i), &s) in columns
            .radial
            .iter()
            .zip(&columns.intensity)
            .zip(&columns.sigma)
        {
            writeln!(w, "{} {} {}", sci18(r), sci18(i), sci18(s))?;
        }
        Ok(())
    })
}

fn write_three_columns<W: Write>(w: &mut W, columns: &Columns, radial_scale: f64) -> std::io::Result<()> {
    for ((&r, &i), &s) in columns
        .radial
        .iter()
        .zip(&columns.intensity)
        .zip(&columns.sigma)
    {
        writeln!(w, "{}\t{}\t{}", sci18(radial_scale * r), sci18(i), sci18(s))?;
    }
    Ok(())
}
