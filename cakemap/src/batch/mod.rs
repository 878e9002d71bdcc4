//! Batch execution over every discovered image set.
//!
//! Sets whose outputs already exist are skipped unless overwriting. The rest
//! run on a rayon pool (or serially for a pool of one). A failing set is
//! recorded and the batch carries on; configuration errors stop it.

mod discovery;
mod pipeline;

pub use discovery::{discover_image_sets, expand_pattern, ImageSet};
pub use pipeline::Pipeline;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::error::{CakeError, ConfigError, Result};
use crate::export::SpectrumFormat;

/// How one image set ended.
#[derive(Debug)]
pub enum JobOutcome {
    /// Output already present and overwriting is off
    Skipped { stem: PathBuf },
    Written { stem: PathBuf, files: Vec<PathBuf> },
    Failed { stem: PathBuf, error: CakeError },
}

impl JobOutcome {
    pub fn stem(&self) -> &Path {
        match self {
            JobOutcome::Skipped { stem }
            | JobOutcome::Written { stem, .. }
            | JobOutcome::Failed { stem, .. } => stem,
        }
    }
}

/// Outcomes of a batch, in image-set order.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub outcomes: Vec<JobOutcome>,
}

impl BatchSummary {
    pub fn written(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Written { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, JobOutcome::Skipped { .. }))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Path, &CakeError)> {
        self.outcomes.iter().filter_map(|o| match o {
            JobOutcome::Failed { stem, error } => Some((stem.as_path(), error)),
            _ => None,
        })
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// Batch-level switches from the command line.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Output directory; defaults to the parent of the first pattern
    pub output_dir: Option<PathBuf>,
    pub overwrite: bool,
    /// Worker count; `None` uses rayon's default, `Some(1)` runs serially
    pub pool_size: Option<usize>,
    /// Hide the progress bar
    pub quiet: bool,
}

/// Canonical paths of every discovered input frame.
pub fn input_paths(sets: &[ImageSet]) -> HashSet<PathBuf> {
    sets.iter()
        .flat_map(|set| &set.frames)
        .map(|path| path.canonicalize().unwrap_or_else(|_| path.clone()))
        .collect()
}

/// True when `name` is `prefix` followed by an extension, an `_` suffix or
/// the `noheader` marker.
fn names_output_of(name: &str, prefix: &str) -> bool {
    match name.strip_prefix(prefix) {
        Some(rest) => {
            rest.starts_with('.') || rest.starts_with('_') || rest.starts_with("noheader")
        }
        None => false,
    }
}

/// True when some file in the stem's directory is an output of that stem.
///
/// Input frames (`inputs`, canonical paths) never count, so outputs may share
/// a directory with the frames they came from.
pub fn output_exists(stem: &Path, inputs: &HashSet<PathBuf>) -> bool {
    let (Some(dir), Some(prefix)) = (stem.parent(), stem.file_name()) else {
        return false;
    };
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    let prefix = prefix.to_string_lossy();
    let is_input = |path: PathBuf| {
        let path = path.canonicalize().unwrap_or(path);
        inputs.contains(&path)
    };

    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| names_output_of(&e.file_name().to_string_lossy(), &prefix))
            .any(|e| !is_input(e.path())),
        Err(_) => false,
    }
}

/// Directory holding the first pattern's matches.
pub fn default_output_dir(pattern: &str) -> PathBuf {
    match Path::new(pattern).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Discovers image sets and drives the [`Pipeline`] over them.
pub struct BatchOrchestrator {
    pipeline: Pipeline,
    options: BatchOptions,
}

impl BatchOrchestrator {
    pub fn new(pipeline: Pipeline, options: BatchOptions) -> Self {
        Self { pipeline, options }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run every image set matched by `patterns` (one pattern per detector).
    pub fn run<S: AsRef<str>>(&self, patterns: &[S]) -> Result<BatchSummary> {
        let detectors = self.pipeline.detectors().len();
        if patterns.len() != detectors {
            return Err(ConfigError::PatternCount {
                patterns: patterns.len(),
                detectors,
            }
            .into());
        }

        let sets = discover_image_sets(patterns)?;
        let output_dir = match &self.options.output_dir {
            Some(dir) => dir.clone(),
            None => patterns
                .first()
                .map(|p| default_output_dir(p.as_ref()))
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        std::fs::create_dir_all(&output_dir).map_err(|e| CakeError::io(&output_dir, e))?;

        info!("Found {} image sets", sets.len());
        for pattern in patterns {
            info!("File inputs are {}", pattern.as_ref());
        }
        info!("Output directory is {}", output_dir.display());
        for format in self.pipeline.formats() {
            info!("Exporting file format {}", format);
        }

        let inputs = input_paths(&sets);
        let progress = self.progress_bar(sets.len());
        let mut outcomes = Vec::with_capacity(sets.len());
        let mut queued: &[ImageSet] = &sets;

        // Build or validate the coordinate cache once before workers share it
        if self.pipeline.formats().contains(&SpectrumFormat::EsgDetector) {
            if let Some((first, rest)) = sets.split_first() {
                info!("Ensuring binned detector coordinates are current; a rebuild can take minutes per detector");
                outcomes.push(self.run_job(first, &output_dir, &inputs)?);
                progress.inc(1);
                queued = rest;
            }
        }

        let run = |set: &ImageSet| {
            let outcome = self.run_job(set, &output_dir, &inputs);
            progress.inc(1);
            outcome
        };
        let rest: Vec<JobOutcome> = match self.options.pool_size {
            Some(1) => queued.iter().map(run).collect::<Result<_, _>>()?,
            pool_size => {
                let mut builder = rayon::ThreadPoolBuilder::new();
                if let Some(n) = pool_size {
                    builder = builder.num_threads(n);
                }
                let pool = builder
                    .build()
                    .map_err(|e| ConfigError::Invalid(format!("cannot start worker pool: {e}")))?;
                info!(
                    "Using {} of {} cpus",
                    pool.current_num_threads(),
                    std::thread::available_parallelism().map_or(1, |n| n.get())
                );
                pool.install(|| queued.par_iter().map(run).collect::<Result<_, _>>())?
            }
        };
        outcomes.extend(rest);
        progress.finish_and_clear();

        let summary = BatchSummary { outcomes };
        info!(
            "Batch complete: {} written, {} skipped, {} failed",
            summary.written(),
            summary.skipped(),
            summary.failures().count()
        );
        for (stem, error) in summary.failures() {
            error!("{} failed: {}", stem.display(), error);
        }
        Ok(summary)
    }

    /// Run one set. Configuration errors abort the batch; anything else is
    /// recorded as a failed outcome.
    fn run_job(
        &self,
        set: &ImageSet,
        output_dir: &Path,
        inputs: &HashSet<PathBuf>,
    ) -> Result<JobOutcome, ConfigError> {
        let stem = set.stem(output_dir);
        if !self.options.overwrite && output_exists(&stem, inputs) {
            debug!("Skipping {}: output exists", stem.display());
            return Ok(JobOutcome::Skipped { stem });
        }

        match self.pipeline.process(set, &stem) {
            Ok(files) => {
                debug!("{}: wrote {} files", stem.display(), files.len());
                Ok(JobOutcome::Written { stem, files })
            }
            Err(CakeError::Config(e)) => Err(e),
            Err(error) => Ok(JobOutcome::Failed { stem, error }),
        }
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if self.options.quiet {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
        }
        pb.set_message("Integrating");
        pb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_output_exists_matches_stem_outputs() {
        let dir = TempDir::new().unwrap();
        let stem = dir.path().join("scan_001");
        let input = dir.path().join("scan_001.tif");
        std::fs::write(&input, "").unwrap();
        let sets = vec![ImageSet {
            index: 0,
            frames: vec![input],
        }];
        let inputs = input_paths(&sets);
        assert!(!output_exists(&stem, &inputs));
        assert!(output_exists(&stem, &HashSet::new()));

        std::fs::write(dir.path().join("scan_001_azim_2.5.xy"), "").unwrap();
        assert!(output_exists(&stem, &inputs));
    }

    #[test]
    fn test_longer_sibling_stem_is_not_output() {
        let dir = TempDir::new().unwrap();
        let sets: Vec<ImageSet> = ["scan_1.tif", "scan_10.tif"]
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let path = dir.path().join(name);
                std::fs::write(&path, "").unwrap();
                ImageSet {
                    index,
                    frames: vec![path],
                }
            })
            .collect();
        let inputs = input_paths(&sets);
        let stem = dir.path().join("scan_1");

        // A sibling's output is not this stem's output either
        std::fs::write(dir.path().join("scan_10.xy"), "").unwrap();
        assert!(!output_exists(&stem, &inputs));

        std::fs::write(dir.path().join("scan_1noheader.xy"), "").unwrap();
        assert!(output_exists(&stem, &inputs));
    }

    #[test]
    fn test_output_name_boundary() {
        assert!(names_output_of("scan_1.xy", "scan_1"));
        assert!(names_output_of("scan_1_2d.esg", "scan_1"));
        assert!(names_output_of("scan_1noheader.xy", "scan_1"));
        assert!(!names_output_of("scan_10.xy", "scan_1"));
        assert!(!names_output_of("scan_1", "scan_1"));
    }

    #[test]
    fn test_default_output_dir() {
        assert_eq!(default_output_dir("data/run/*.tif"), PathBuf::from("data/run"));
        assert_eq!(default_output_dir("*.tif"), PathBuf::from("."));
    }

    #[test]
    fn test_summary_counts() {
        let summary = BatchSummary {
            outcomes: vec![
                JobOutcome::Skipped { stem: "a".into() },
                JobOutcome::Written {
                    stem: "b".into(),
                    files: vec![],
                },
                JobOutcome::Failed {
                    stem: "c".into(),
                    error: CakeError::Integration("boom".into()),
                },
            ],
        };
        assert_eq!(summary.written(), 1);
        assert_eq!(summary.skipped(), 1);
        let failures: Vec<_> = summary.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, Path::new("c"));
        assert!(summary.has_failures());
    }
}
