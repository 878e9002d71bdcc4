//! Caked diffraction integration with detector-space export.
//!
//! Frames from one or more calibrated detectors are integrated into polar
//! (azimuth × radial) histograms, optionally remapped onto detector-plane
//! coordinates, and written in the text formats read by Rietveld tools.

pub mod batch;
pub mod calibration;
pub mod config;
pub mod error;
pub mod export;
pub mod image_proc;
pub mod integrator;
pub mod mask;
pub mod resample;

pub use batch::{BatchOptions, BatchOrchestrator, BatchSummary, ImageSet, JobOutcome, Pipeline};
pub use calibration::{Detector, PoniGeometry};
pub use config::IntegrationConfig;
pub use error::{CakeError, ConfigError, Result};
pub use export::SpectrumFormat;
pub use integrator::{HistogramIntegrator, Integrator};
pub use mask::MaskComposer;
pub use resample::{CoordinateCache, CoordinateMap, GeometricResampler};
