//! Whole-batch runs over synthetic detectors written to a temp directory.

use approx::assert_abs_diff_eq;
use ndarray::Array2;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cakemap::integrator::{BinnedResult, IntegrationParams};
use cakemap::{
    BatchOptions, BatchOrchestrator, CakeError, ConfigError, CoordinateCache, Detector,
    GeometricResampler, HistogramIntegrator, IntegrationConfig, Integrator, JobOutcome, Pipeline,
    SpectrumFormat,
};
use test_helpers::{numeric_rows, DetectorSpec, Fixture};

fn pipeline(config: &Path, cache_dir: &Path, formats: Vec<SpectrumFormat>) -> cakemap::Result<Pipeline> {
    pipeline_with(config, cache_dir, formats, Box::new(HistogramIntegrator))
}

fn pipeline_with(
    config: &Path,
    cache_dir: &Path,
    formats: Vec<SpectrumFormat>,
    integrator: Box<dyn Integrator>,
) -> cakemap::Result<Pipeline> {
    let config = IntegrationConfig::load(config)?;
    let detectors = Detector::from_config_all(&config)?;
    Pipeline::new(
        &config,
        detectors,
        integrator,
        GeometricResampler::new(CoordinateCache::new(cache_dir)),
        formats,
    )
}

/// Histogram integrator that logs the first pixel of every set it is given,
/// in call order.
struct RecordingIntegrator {
    seen: Arc<Mutex<Vec<f64>>>,
}

impl Integrator for RecordingIntegrator {
    fn integrate(
        &self,
        detectors: &[Detector],
        frames: &[Array2<f64>],
        masks: &[Array2<bool>],
        params: &IntegrationParams,
    ) -> cakemap::Result<BinnedResult> {
        self.seen.lock().unwrap().push(frames[0][[0, 0]]);
        HistogramIntegrator.integrate(detectors, frames, masks, params)
    }
}

/// Frames `scan_001.tif ..` where set `i` reads `101 + i` everywhere.
fn numbered_frames(fixture: &Fixture, spec: &DetectorSpec, count: usize) -> String {
    let frames = fixture.subdir("frames").unwrap();
    for i in 0..count {
        fixture
            .write_uniform_frame(&frames, &format!("scan_{:03}.tif", i + 1), spec, 101 + i as u16)
            .unwrap();
    }
    Fixture::pattern(&frames, "scan_")
}

fn recording_run(
    fixture: &Fixture,
    config: &Path,
    pattern: String,
    formats: Vec<SpectrumFormat>,
    pool_size: Option<usize>,
) -> Vec<f64> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let integrator = RecordingIntegrator { seen: seen.clone() };
    let cache_dir = fixture.subdir("cache").unwrap();
    let out = fixture.subdir("out").unwrap();
    let pipeline = pipeline_with(config, &cache_dir, formats, Box::new(integrator)).unwrap();
    let options = BatchOptions {
        pool_size,
        ..quiet(Some(out))
    };
    let summary = BatchOrchestrator::new(pipeline, options).run(&[pattern]).unwrap();
    assert!(!summary.has_failures());
    let seen = seen.lock().unwrap().clone();
    seen
}

fn orchestrator(
    fixture: &Fixture,
    config: &Path,
    formats: Vec<SpectrumFormat>,
    options: BatchOptions,
) -> BatchOrchestrator {
    let cache_dir = fixture.subdir("cache").unwrap();
    BatchOrchestrator::new(pipeline(config, &cache_dir, formats).unwrap(), options)
}

fn quiet(output_dir: Option<PathBuf>) -> BatchOptions {
    BatchOptions {
        output_dir,
        quiet: true,
        ..Default::default()
    }
}

/// One 10x10 centred detector with `count` uniform frames of 100 counts.
fn single_detector(fixture: &Fixture, count: usize, overrides: Value) -> (PathBuf, String) {
    let spec = DetectorSpec::centred(10);
    let poni = fixture.write_poni("det0", &spec).unwrap();
    let frames = fixture.subdir("frames").unwrap();
    for i in 1..=count {
        fixture
            .write_uniform_frame(&frames, &format!("scan_{i:03}.tif"), &spec, 100)
            .unwrap();
    }
    let config = fixture.write_config("run.json", &[poni], overrides).unwrap();
    (config, Fixture::pattern(&frames, "scan_"))
}

#[test]
fn test_uniform_frame_gives_flat_spectrum() {
    let fixture = Fixture::new().unwrap();
    let (config, pattern) = single_detector(&fixture, 1, json!({}));

    // Outputs land beside the frames when no output directory is given
    let batch = orchestrator(&fixture, &config, vec![SpectrumFormat::Xy], quiet(None));
    let summary = batch.run(&[pattern]).unwrap();
    assert_eq!(summary.written(), 1);
    assert!(!summary.has_failures());

    let path = fixture.path().join("frames").join("scan_001.xy");
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("/*\n# "));

    let rows = numeric_rows(&path).unwrap();
    assert_eq!(rows.len(), 5);
    for pair in rows.windows(2) {
        assert!(pair[1][0] > pair[0][0]);
    }
    for row in &rows {
        assert_eq!(row.len(), 2);
        assert_abs_diff_eq!(row[1], 100.0, epsilon = 1e-9);
    }
}

#[test]
fn test_every_1d_format_is_written() {
    let fixture = Fixture::new().unwrap();
    let (config, pattern) = single_detector(&fixture, 1, json!({}));
    let out = fixture.subdir("out").unwrap();

    let formats = vec![
        SpectrumFormat::Dat,
        SpectrumFormat::Xy,
        SpectrumFormat::Xye,
        SpectrumFormat::XyNoHeader,
        SpectrumFormat::Fxye,
        SpectrumFormat::Esg,
    ];
    let batch = orchestrator(&fixture, &config, formats, quiet(Some(out.clone())));
    let summary = batch.run(&[pattern]).unwrap();

    let files = match &summary.outcomes[0] {
        JobOutcome::Written { files, .. } => files.clone(),
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(files.len(), 6);
    for name in [
        "scan_001.dat",
        "scan_001.xy",
        "scan_001.xye",
        "scan_001noheader.xy",
        "scan_001.fxye",
        "scan_001.esg",
    ] {
        assert!(out.join(name).exists(), "missing {name}");
    }

    let xye = numeric_rows(out.join("scan_001.xye")).unwrap();
    assert!(xye.iter().all(|row| row.len() == 3 && row[2] > 0.0));
    let noheader = std::fs::read_to_string(out.join("scan_001noheader.xy")).unwrap();
    assert_eq!(noheader.lines().count(), 5);
}

#[test]
fn test_existing_output_is_skipped_unless_overwriting() {
    let fixture = Fixture::new().unwrap();
    let (config, pattern) = single_detector(&fixture, 2, json!({}));
    let out = fixture.subdir("out").unwrap();
    let sentinel = out.join("scan_001.xy");
    std::fs::write(&sentinel, "sentinel").unwrap();

    let batch = orchestrator(&fixture, &config, vec![SpectrumFormat::Xy], quiet(Some(out.clone())));
    let summary = batch.run(&[pattern.clone()]).unwrap();
    assert_eq!(summary.skipped(), 1);
    assert_eq!(summary.written(), 1);
    assert!(matches!(summary.outcomes[0], JobOutcome::Skipped { .. }));
    assert_eq!(std::fs::read_to_string(&sentinel).unwrap(), "sentinel");

    let options = BatchOptions {
        overwrite: true,
        ..quiet(Some(out.clone()))
    };
    let batch = orchestrator(&fixture, &config, vec![SpectrumFormat::Xy], options);
    let summary = batch.run(&[pattern]).unwrap();
    assert_eq!(summary.written(), 2);
    assert_eq!(numeric_rows(&sentinel).unwrap().len(), 5);
}

#[test]
fn test_unreadable_frame_fails_alone() {
    let fixture = Fixture::new().unwrap();
    let (config, pattern) = single_detector(&fixture, 3, json!({}));
    std::fs::write(fixture.path().join("frames").join("scan_002.tif"), b"garbage").unwrap();
    let out = fixture.subdir("out").unwrap();

    let options = BatchOptions {
        pool_size: Some(2),
        ..quiet(Some(out.clone()))
    };
    let batch = orchestrator(&fixture, &config, vec![SpectrumFormat::Xy], options);
    let summary = batch.run(&[pattern]).unwrap();

    assert_eq!(summary.written(), 2);
    assert!(summary.has_failures());
    assert!(matches!(summary.outcomes[1], JobOutcome::Failed { .. }));
    assert!(summary.outcomes[1].stem().ends_with("scan_002"));
    assert!(out.join("scan_001.xy").exists());
    assert!(out.join("scan_003.xy").exists());
    assert!(!out.join("scan_002.xy").exists());
}

#[test]
fn test_serial_and_parallel_runs_agree() {
    let fixture = Fixture::new().unwrap();
    let (config, pattern) = single_detector(&fixture, 4, json!({}));
    let serial_dir = fixture.subdir("serial").unwrap();
    let parallel_dir = fixture.subdir("parallel").unwrap();

    for (dir, pool_size) in [(&serial_dir, Some(1)), (&parallel_dir, Some(3))] {
        let options = BatchOptions {
            pool_size,
            ..quiet(Some(dir.clone()))
        };
        let batch = orchestrator(&fixture, &config, vec![SpectrumFormat::Xy], options);
        let summary = batch.run(&[pattern.clone()]).unwrap();
        let stems: Vec<_> = summary
            .outcomes
            .iter()
            .map(|o| o.stem().file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(stems, vec!["scan_001", "scan_002", "scan_003", "scan_004"]);
    }

    for i in 1..=4 {
        let name = format!("scan_{i:03}.xy");
        assert_eq!(
            numeric_rows(serial_dir.join(&name)).unwrap(),
            numeric_rows(parallel_dir.join(&name)).unwrap()
        );
    }
}

#[test]
fn test_pattern_per_detector_required() {
    let fixture = Fixture::new().unwrap();
    let (config, pattern) = single_detector(&fixture, 1, json!({}));
    let batch = orchestrator(&fixture, &config, vec![SpectrumFormat::Xy], quiet(None));

    let err = batch.run(&[pattern.clone(), pattern]).unwrap_err();
    assert!(matches!(
        err,
        CakeError::Config(ConfigError::PatternCount {
            patterns: 2,
            detectors: 1
        })
    ));
}

#[test]
fn test_unequal_image_counts_abort() {
    let fixture = Fixture::new().unwrap();
    let spec = DetectorSpec::centred(10);
    let ponis = vec![
        fixture.write_poni("det0", &spec).unwrap(),
        fixture.write_poni("det1", &spec).unwrap(),
    ];
    let frames = fixture.subdir("frames").unwrap();
    for name in ["a_001.tif", "a_002.tif", "b_001.tif"] {
        fixture.write_uniform_frame(&frames, name, &spec, 100).unwrap();
    }
    let config = fixture.write_config("run.json", &ponis, json!({})).unwrap();
    let batch = orchestrator(&fixture, &config, vec![SpectrumFormat::Xy], quiet(None));

    let err = batch
        .run(&[Fixture::pattern(&frames, "a_"), Fixture::pattern(&frames, "b_")])
        .unwrap_err();
    assert!(matches!(
        err,
        CakeError::Config(ConfigError::ImageCountMismatch { .. })
    ));
}

#[test]
fn test_two_detectors_integrate_together() {
    let fixture = Fixture::new().unwrap();
    let spec = DetectorSpec::centred(10);
    let ponis = vec![
        fixture.write_poni("det0", &spec).unwrap(),
        fixture.write_poni("det1", &spec).unwrap(),
    ];
    let frames = fixture.subdir("frames").unwrap();
    fixture.write_uniform_frame(&frames, "a_001.tif", &spec, 100).unwrap();
    fixture.write_uniform_frame(&frames, "b_001.tif", &spec, 300).unwrap();
    let config = fixture.write_config("run.json", &ponis, json!({})).unwrap();
    let out = fixture.subdir("out").unwrap();

    let batch = orchestrator(&fixture, &config, vec![SpectrumFormat::Xy], quiet(Some(out.clone())));
    let summary = batch
        .run(&[Fixture::pattern(&frames, "a_"), Fixture::pattern(&frames, "b_")])
        .unwrap();
    assert_eq!(summary.written(), 1);

    // Identical geometry, so every bin averages the two frames equally
    let rows = numeric_rows(out.join("a_001.xy")).unwrap();
    assert_eq!(rows.len(), 5);
    for row in &rows {
        assert_abs_diff_eq!(row[1], 200.0, epsilon = 1e-9);
    }
}

#[test]
fn test_dark_and_mask_are_applied() {
    let fixture = Fixture::new().unwrap();
    let spec = DetectorSpec::centred(10);
    let poni = fixture.write_poni("det0", &spec).unwrap();
    let calib = fixture.subdir("calib").unwrap();
    let frames = fixture.subdir("frames").unwrap();

    let mut mask = Array2::<u16>::zeros(spec.shape());
    mask[[0, 0]] = 1;
    let mask_path = fixture.write_frame(&calib, "mask.tif", &mask).unwrap();
    let dark_path = fixture
        .write_uniform_frame(&calib, "dark.tif", &spec, 50)
        .unwrap();

    let mut frame = Array2::<u16>::from_elem(spec.shape(), 150);
    frame[[0, 0]] = 60000;
    fixture.write_frame(&frames, "scan_001.tif", &frame).unwrap();

    let config = fixture
        .write_config(
            "run.json",
            &[poni],
            json!({
                "do_mask": true,
                "mask_file": [mask_path],
                "do_dark": true,
                "dark_file": [dark_path],
                "dark_norm": 1.0
            }),
        )
        .unwrap();
    let out = fixture.subdir("out").unwrap();
    let batch = orchestrator(&fixture, &config, vec![SpectrumFormat::Xy], quiet(Some(out.clone())));
    batch.run(&[Fixture::pattern(&frames, "scan_")]).unwrap();

    let rows = numeric_rows(out.join("scan_001.xy")).unwrap();
    assert!(!rows.is_empty());
    for row in &rows {
        assert_abs_diff_eq!(row[1], 100.0, epsilon = 1e-9);
    }
}

#[test]
fn test_detector_map_needs_2d() {
    let fixture = Fixture::new().unwrap();
    let (config, _) = single_detector(&fixture, 1, json!({}));
    let cache_dir = fixture.subdir("cache").unwrap();

    let err = pipeline(&config, &cache_dir, vec![SpectrumFormat::EsgDetector])
        .err()
        .unwrap();
    assert!(matches!(
        err,
        CakeError::Config(ConfigError::FormatNeeds2d("esg_detector"))
    ));
}

/// Beam just left of a 10x60 frame, level with its middle row, so χ spans
/// the 0°/360° cut.
fn side_beam_spec() -> DetectorSpec {
    DetectorSpec {
        rows: 10,
        cols: 60,
        pixel: 1e-4,
        distance: 0.1,
        poni1: 0.0005,
        poni2: -0.0005,
        wavelength: 1e-10,
    }
}

fn esg_blocks(path: &Path) -> (Vec<usize>, Vec<f64>) {
    let text = std::fs::read_to_string(path).unwrap();
    let ids = text
        .lines()
        .filter_map(|l| l.strip_prefix("_pd_block_id noTitle|#"))
        .map(|id| id.parse().unwrap())
        .collect();
    let etas = text
        .lines()
        .filter_map(|l| l.strip_prefix("_pd_meas_angle_eta "))
        .map(|eta| eta.parse().unwrap())
        .collect();
    (ids, etas)
}

#[test]
fn test_detector_map_export_across_branch_cut() {
    let fixture = Fixture::new().unwrap();
    let spec = side_beam_spec();
    let poni = fixture.write_poni("det0", &spec).unwrap();
    let frames = fixture.subdir("frames").unwrap();
    for name in ["scan_001.tif", "scan_002.tif"] {
        fixture.write_uniform_frame(&frames, name, &spec, 100).unwrap();
    }
    let config = fixture
        .write_config(
            "run.json",
            &[poni],
            json!({"do_2D": true, "npt_azimuth": 72, "npt_radial": 20}),
        )
        .unwrap();
    let out = fixture.subdir("out").unwrap();

    let formats = vec![
        SpectrumFormat::EsgDetector,
        SpectrumFormat::Esg1,
        SpectrumFormat::Xy,
    ];
    let batch = orchestrator(&fixture, &config, formats, quiet(Some(out.clone())));
    let summary = batch.run(&[Fixture::pattern(&frames, "scan_")]).unwrap();
    assert_eq!(summary.written(), 2);
    assert!(fixture.path().join("cache").join("binned_detector_coord0.bin").exists());

    let detector_map = out.join("scan_001_det0_2d.esg");
    let text = std::fs::read_to_string(&detector_map).unwrap();
    assert!(text.contains("_pd_instr_dist_spec/detc 100.000000"));

    // Instrument block, then data blocks numbered densely in azimuth order
    let (ids, etas) = esg_blocks(&detector_map);
    assert_eq!(ids[0], 0);
    assert_eq!(ids[1..].to_vec(), (0..ids.len() - 1).collect::<Vec<_>>());
    assert_eq!(etas.len(), ids.len() - 1);
    assert!(etas.iter().all(|&eta| (0.0..360.0).contains(&eta)));
    let corrected: Vec<f64> = etas
        .iter()
        .map(|&eta| if eta >= 180.0 { eta - 360.0 } else { eta })
        .collect();
    for pair in corrected.windows(2) {
        assert!(pair[1] > pair[0]);
    }
    assert!(corrected.contains(&-2.5) && corrected.contains(&2.5));

    assert!(out.join("scan_001_2d.esg").exists());
    assert!(out.join("scan_002_det0_2d.esg").exists());

    // Per-azimuth spectra are named by the shifted azimuth; empty ones are dropped
    assert!(out.join("scan_001_azim_-2.5.xy").exists());
    assert!(out.join("scan_001_azim_2.5.xy").exists());
    assert!(!out.join("scan_001_azim_357.5.xy").exists());
    assert!(!out.join("scan_001_azim_177.5.xy").exists());
}

#[test]
fn test_single_worker_runs_in_input_order() {
    let fixture = Fixture::new().unwrap();
    let spec = DetectorSpec::centred(10);
    let poni = fixture.write_poni("det0", &spec).unwrap();
    let pattern = numbered_frames(&fixture, &spec, 5);
    let config = fixture.write_config("run.json", &[poni], json!({})).unwrap();

    let seen = recording_run(&fixture, &config, pattern, vec![SpectrumFormat::Xy], Some(1));
    assert_eq!(seen, vec![101.0, 102.0, 103.0, 104.0, 105.0]);
}

#[test]
fn test_detector_map_runs_first_set_before_pool() {
    let fixture = Fixture::new().unwrap();
    let spec = side_beam_spec();
    let poni = fixture.write_poni("det0", &spec).unwrap();
    let pattern = numbered_frames(&fixture, &spec, 6);
    let config = fixture
        .write_config(
            "run.json",
            &[poni],
            json!({"do_2D": true, "npt_azimuth": 72, "npt_radial": 20}),
        )
        .unwrap();

    for _ in 0..3 {
        let seen = recording_run(
            &fixture,
            &config,
            pattern.clone(),
            vec![SpectrumFormat::EsgDetector],
            Some(4),
        );
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], 101.0);
        let mut sorted = seen.clone();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(sorted, vec![101.0, 102.0, 103.0, 104.0, 105.0, 106.0]);

        // Every pass rewrites its outputs
        let out = fixture.path().join("out");
        for entry in std::fs::read_dir(&out).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }
    }
}

#[test]
fn test_sibling_with_longer_stem_does_not_skip() {
    let fixture = Fixture::new().unwrap();
    let spec = DetectorSpec::centred(10);
    let poni = fixture.write_poni("det0", &spec).unwrap();
    let frames = fixture.subdir("frames").unwrap();
    for name in ["scan_1.tif", "scan_10.tif"] {
        fixture.write_uniform_frame(&frames, name, &spec, 100).unwrap();
    }
    let config = fixture.write_config("run.json", &[poni], json!({})).unwrap();

    // Outputs go beside the frames
    let options = BatchOptions {
        pool_size: Some(1),
        ..quiet(None)
    };
    let batch = orchestrator(&fixture, &config, vec![SpectrumFormat::Xy], options);
    let summary = batch.run(&[Fixture::pattern(&frames, "scan_")]).unwrap();

    assert_eq!(summary.written(), 2);
    assert_eq!(summary.skipped(), 0);
    assert!(frames.join("scan_1.xy").exists());
    assert!(frames.join("scan_10.xy").exists());
}
