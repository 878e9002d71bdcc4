//! Processing of a single image set: load, correct, mask, integrate and
//! export.

use ndarray::{Array2, ArrayView1};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::discovery::ImageSet;
use crate::calibration::Detector;
use crate::config::IntegrationConfig;
use crate::error::{CakeError, Result};
use crate::export::numfmt::short;
use crate::export::{esg, write_spectrum, ExportOptions, Spectrum, SpectrumFormat};
use crate::integrator::{Histogram, IntegrationParams, Integrator};
use crate::mask::MaskComposer;
use crate::resample::GeometricResampler;

/// Immutable per-run state shared by every job.
pub struct Pipeline {
    detectors: Vec<Detector>,
    integrator: Box<dyn Integrator>,
    resampler: GeometricResampler,
    params: IntegrationParams,
    export: ExportOptions,
    formats: Vec<SpectrumFormat>,
}

impl Pipeline {
    /// Validate `formats` against `config` and assemble the pipeline.
    pub fn new(
        config: &IntegrationConfig,
        detectors: Vec<Detector>,
        integrator: Box<dyn Integrator>,
        resampler: GeometricResampler,
        formats: Vec<SpectrumFormat>,
    ) -> Result<Self> {
        config.validate()?;
        for format in &formats {
            format.check(config.is_2d(), config.unit)?;
        }
        let export = ExportOptions::new(config, &detectors);
        Ok(Self {
            detectors,
            integrator,
            resampler,
            params: config.integration_params(),
            export,
            formats,
        })
    }

    pub fn detectors(&self) -> &[Detector] {
        &self.detectors
    }

    pub fn formats(&self) -> &[SpectrumFormat] {
        &self.formats
    }

    fn has_format(&self, format: SpectrumFormat) -> bool {
        self.formats.contains(&format)
    }

    /// Run one image set and write every requested format under `stem`.
    ///
    /// Returns the files written.
    pub fn process(&self, set: &ImageSet, stem: &Path) -> Result<Vec<PathBuf>> {
        if set.frames.len() != self.detectors.len() {
            return Err(CakeError::Integration(format!(
                "image set has {} frames for {} detectors",
                set.frames.len(),
                self.detectors.len()
            )));
        }

        let frames = self
            .detectors
            .iter()
            .zip(&set.frames)
            .map(|(detector, path)| detector.load_image(path))
            .collect::<Result<Vec<_>>>()?;
        let masks = self
            .detectors
            .iter()
            .zip(&frames)
            .map(|(detector, frame)| detector.frame_mask(frame))
            .collect::<Result<Vec<_>>>()?;

        let histogram = self
            .integrator
            .integrate(&self.detectors, &frames, &masks, &self.params)?
            .into_histogram();

        match histogram.azimuthal.clone() {
            None => self.export_1d(&histogram, stem),
            Some(azimuthal) => self.export_2d(&histogram, azimuthal.view(), &frames, stem),
        }
    }

    fn export_1d(&self, histogram: &Histogram, stem: &Path) -> Result<Vec<PathBuf>> {
        let (intensity, sigma) = histogram.row(0);
        let spectrum = Spectrum {
            radial: histogram.radial.view(),
            intensity,
            sigma,
        };

        let mut written = Vec::new();
        for &format in &self.formats {
            written.extend(write_spectrum(format, &spectrum, stem, 0.0, &self.export)?);
        }
        Ok(written)
    }

    fn export_2d(
        &self,
        histogram: &Histogram,
        azimuthal: ArrayView1<f64>,
        frames: &[Array2<f64>],
        stem: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        let mut export_azimuthal = azimuthal.to_owned();

        if self.has_format(SpectrumFormat::EsgDetector) {
            for (detector, frame) in self.detectors.iter().zip(frames) {
                let resampled = self.resampler.resample(
                    detector,
                    frame.dim(),
                    histogram.unit,
                    histogram.radial.view(),
                    azimuthal,
                )?;
                let bins = MaskComposer::compose(
                    histogram.intensity.view(),
                    resampled.map.x.view(),
                    resampled.map.y.view(),
                    histogram.sigma.view(),
                )?;

                let path = PathBuf::from(format!(
                    "{}_det{}_2d.esg",
                    stem.display(),
                    detector.index
                ));
                let blocks = esg::write_esg_detector(
                    &path,
                    &bins,
                    resampled.azimuthal.view(),
                    detector.distance_mm(),
                )?;
                debug!(
                    "{}: {} blocks, {} valid bins, cache hit: {}",
                    path.display(),
                    blocks,
                    bins.valid_count(),
                    resampled.cache_hit
                );
                if resampled.wrapped {
                    export_azimuthal = resampled.azimuthal;
                }
                written.push(path);
            }
        }

        if self.has_format(SpectrumFormat::Esg1) {
            let path = PathBuf::from(format!("{}_2d.esg", stem.display()));
            esg::write_esg1(
                &path,
                histogram.radial.view(),
                histogram.intensity.view(),
                export_azimuthal.view(),
                histogram.sigma.view(),
            )?;
            written.push(path);
        }

        let per_spectrum: Vec<SpectrumFormat> = self
            .formats
            .iter()
            .copied()
            .filter(|f| f.is_per_spectrum())
            .collect();
        if per_spectrum.is_empty() {
            return Ok(written);
        }

        for (i, &azimuth) in export_azimuthal.iter().enumerate() {
            let chi = (azimuth * 10.0).round() / 10.0;
            let azim_stem = PathBuf::from(format!("{}_azim_{}", stem.display(), short(chi)));
            let (intensity, sigma) = histogram.row(i);
            let spectrum = Spectrum {
                radial: histogram.radial.view(),
                intensity,
                sigma,
            };
            for &format in &per_spectrum {
                written.extend(write_spectrum(format, &spectrum, &azim_stem, chi, &self.export)?);
            }
        }
        Ok(written)
    }
}
