//! Text serializers for integrated patterns and detector maps.
//!
//! Per-spectrum formats ([`SpectrumFormat::is_per_spectrum`]) write one file
//! per radial pattern via [`write_spectrum`]. The multi-block `esg1` file and
//! the `esg_detector` map take a whole 2D result and have their own writers
//! in [`esg`].

pub mod esg;
pub mod numfmt;
mod text;

use ndarray::ArrayView1;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::calibration::{Detector, PoniGeometry};
use crate::config::IntegrationConfig;
use crate::error::{CakeError, ConfigError, Result};
use crate::integrator::RadialUnit;

/// Output layouts selectable with `--format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpectrumFormat {
    /// Commented metadata header, three columns
    Dat,
    /// Commented header, radial and intensity
    Xy,
    /// Commented header, radial, intensity and uncertainty
    Xye,
    /// Radial and intensity only
    XyNoHeader,
    /// GSAS bank header, radial scaled by 100
    Fxye,
    /// MAUD block, one spectrum per file
    Esg,
    /// MAUD blocks, every azimuth of a 2D result in one file
    Esg1,
    /// MAUD blocks of detector-plane positions, one file per detector
    EsgDetector,
}

impl SpectrumFormat {
    pub const ALL: [SpectrumFormat; 8] = [
        SpectrumFormat::Dat,
        SpectrumFormat::Xy,
        SpectrumFormat::Xye,
        SpectrumFormat::XyNoHeader,
        SpectrumFormat::Fxye,
        SpectrumFormat::Esg,
        SpectrumFormat::Esg1,
        SpectrumFormat::EsgDetector,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SpectrumFormat::Dat => "dat",
            SpectrumFormat::Xy => "xy",
            SpectrumFormat::Xye => "xye",
            SpectrumFormat::XyNoHeader => "xy-noheader",
            SpectrumFormat::Fxye => "fxye",
            SpectrumFormat::Esg => "esg",
            SpectrumFormat::Esg1 => "esg1",
            SpectrumFormat::EsgDetector => "esg_detector",
        }
    }

    /// Written once per radial pattern through [`write_spectrum`].
    pub fn is_per_spectrum(self) -> bool {
        !matches!(self, SpectrumFormat::Esg1 | SpectrumFormat::EsgDetector)
    }

    /// Path written for a single spectrum with the given stem.
    pub fn spectrum_path(self, stem: &Path) -> PathBuf {
        let stem = stem.display();
        match self {
            SpectrumFormat::XyNoHeader => PathBuf::from(format!("{stem}noheader.xy")),
            other => PathBuf::from(format!("{stem}.{}", other.name())),
        }
    }

    /// Reject formats that cannot be produced with these settings.
    pub fn check(self, is_2d: bool, unit: RadialUnit) -> Result<(), ConfigError> {
        match self {
            SpectrumFormat::Esg1 | SpectrumFormat::EsgDetector if !is_2d => {
                Err(ConfigError::FormatNeeds2d(self.name()))
            }
            SpectrumFormat::Fxye if unit != RadialUnit::TwoThetaDeg => Err(ConfigError::FormatUnit {
                format: self.name(),
                unit: unit.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for SpectrumFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SpectrumFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.name() == s)
            .ok_or_else(|| ConfigError::UnsupportedFormat(s.to_string()))
    }
}

/// Calibration summary carried into `dat` headers.
#[derive(Debug, Clone)]
pub struct DetectorSummary {
    pub poni_path: PathBuf,
    pub geometry: PoniGeometry,
}

/// Run-wide settings for every writer.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Drop bins with non-finite intensity before writing
    pub remove_nan: bool,
    pub unit: RadialUnit,
    pub detectors: Vec<DetectorSummary>,
    pub has_mask: bool,
    pub has_dark: bool,
    pub has_bright: bool,
    pub polarization_factor: Option<f64>,
}

impl ExportOptions {
    pub fn new(config: &IntegrationConfig, detectors: &[Detector]) -> Self {
        Self {
            remove_nan: config.do_remove_nan,
            unit: config.unit,
            detectors: detectors
                .iter()
                .map(|d| DetectorSummary {
                    poni_path: d.poni_path.clone(),
                    geometry: d.geometry.clone(),
                })
                .collect(),
            has_mask: config.do_mask,
            has_dark: config.do_dark,
            has_bright: config.do_bright,
            polarization_factor: config.do_polarization.then_some(config.polarization_factor),
        }
    }
}

/// One radial pattern: matching radial, intensity and uncertainty values.
#[derive(Debug, Clone, Copy)]
pub struct Spectrum<'a> {
    pub radial: ArrayView1<'a, f64>,
    pub intensity: ArrayView1<'a, f64>,
    pub sigma: ArrayView1<'a, f64>,
}

/// Owned columns after NaN filtering.
#[derive(Debug, Clone, Default)]
pub(crate) struct Columns {
    pub radial: Vec<f64>,
    pub intensity: Vec<f64>,
    pub sigma: Vec<f64>,
}

impl Columns {
    /// Keep the entries selected by `keep(intensity)`.
    pub(crate) fn filtered(spectrum: &Spectrum<'_>, keep: impl Fn(f64) -> bool) -> Self {
        let mut columns = Columns::default();
        for ((&r, &i), &s) in spectrum
            .radial
            .iter()
            .zip(spectrum.intensity.iter())
            .zip(spectrum.sigma.iter())
        {
            if keep(i) {
                columns.radial.push(r);
                columns.intensity.push(i);
                columns.sigma.push(s);
            }
        }
        columns
    }

    pub(crate) fn len(&self) -> usize {
        self.radial.len()
    }
}

/// Delete `path` if it exists.
pub(crate) fn remove_existing(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CakeError::io(path, e)),
    }
}

/// Create `path` and hand a buffered writer to `body`.
pub(crate) fn write_file<F>(path: &Path, body: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let file = File::create(path).map_err(|e| CakeError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    body(&mut writer)
        .and_then(|_| writer.flush())
        .map_err(|e| CakeError::io(path, e))
}

/// Write one spectrum in a per-spectrum format.
///
/// Any previous file at the target is removed first. With NaN removal on,
/// entries with non-finite intensity are dropped and a spectrum left empty
/// writes nothing and returns `Ok(None)`.
pub fn write_spectrum(
    format: SpectrumFormat,
    spectrum: &Spectrum<'_>,
    stem: &Path,
    chi: f64,
    options: &ExportOptions,
) -> Result<Option<PathBuf>> {
    if !format.is_per_spectrum() {
        return Err(not_per_spectrum(format));
    }
    format.check(true, options.unit)?;

    let path = format.spectrum_path(stem);
    remove_existing(&path)?;

    let columns = if options.remove_nan {
        Columns::filtered(spectrum, f64::is_finite)
    } else {
        Columns::filtered(spectrum, |_| true)
    };
    if columns.len() == 0 {
        debug!("Nothing to write for {}: no finite intensities", path.display());
        return Ok(None);
    }

    match format {
        SpectrumFormat::Dat => text::write_dat(&path, &columns, options)?,
        SpectrumFormat::Xy => text::write_xy(&path, &columns, true)?,
        SpectrumFormat::XyNoHeader => text::write_xy(&path, &columns, false)?,
        SpectrumFormat::Xye => text::write_xye(&path, &columns)?,
        SpectrumFormat::Fxye => text::write_fxye(&path, &columns)?,
        SpectrumFormat::Esg => {
            esg::write_esg_blocks(&path, &[(0, chi, &columns)])?;
        }
        SpectrumFormat::Esg1 | SpectrumFormat::EsgDetector => return Err(not_per_spectrum(format)),
    }
    Ok(Some(path))
}

fn not_per_spectrum(format: SpectrumFormat) -> CakeError {
    ConfigError::UnsupportedFormat(format!("{format} cannot be written per spectrum")).into()
}
