mod common;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use common::synthetic::{write_plane, FovScene, ThresholdModel, BACKGROUND};
use ndarray::Array2;
use tiff::decoder::{Decoder, DecodingResult};

use trap_compiler::config::{CompileConfig, DetectionStrategy, OutputFormat};
use trap_compiler::pipeline::CompilePipeline;

fn base_config(root: &Path, strategy: DetectionStrategy) -> CompileConfig {
    let mut config = CompileConfig {
        experiment_name: "exp".to_string(),
        image_dir: root.join("TIFF"),
        analysis_dir: root.join("analysis"),
        channel_dir: root.join("analysis/channels"),
        container_dir: root.join("analysis/containers"),
        num_workers: 2,
        phase_plane_index: 0,
        output: OutputFormat::StackFiles,
        ..CompileConfig::default()
    };
    config.compile.strategy = strategy;
    config
}

fn read_stack_pages(path: &Path) -> Vec<Vec<u16>> {
    let file = File::open(path).unwrap();
    let mut decoder = Decoder::new(BufReader::new(file)).unwrap();
    let mut pages = Vec::new();
    loop {
        match decoder.read_image().unwrap() {
            DecodingResult::U16(data) => pages.push(data),
            _ => panic!("expected 16-bit pages"),
        }
        if !decoder.more_images() {
            break;
        }
        decoder.next_image().unwrap();
    }
    pages
}

#[test]
fn segmentation_run_with_zero_drift_yields_one_identical_stack() {
    let root = tempfile::tempdir().unwrap();
    let image_dir = root.path().join("TIFF");
    std::fs::create_dir_all(&image_dir).unwrap();

    let scene = FovScene {
        rows: 64,
        cols: 64,
        trough_rows: (26, 36),
        traps: vec![(14, 30)],
        trap_height: 12,
        trap_width: 4,
    };
    for t in 0..5 {
        scene.write_frame(&image_dir, 1, t, 0, 0);
    }

    let mut config = base_config(root.path(), DetectionStrategy::Segmentation);
    config.compile.trap_crop_height = 12;
    config.compile.trap_crop_width = 4;
    config.compile.trap_area_threshold = 20;
    config.compile.shape_tolerance_px = 2;
    config.compile.segmentation.shift_distance = 16;
    config.compile.segmentation.fuse_half_width = 20;
    config.compile.segmentation.batch_size = 3;

    let pipeline = CompilePipeline::new(config);
    let summary = pipeline.run(Some(&ThresholdModel)).unwrap();

    assert_eq!(summary.frames_total, 5);
    assert_eq!(summary.extraction_failures, 0);
    assert_eq!(summary.channels_written, 1);
    assert_eq!(summary.frames_rejected, 0);
    assert_eq!(summary.channels_dropped, 0);

    // one stack of length 5 with an identical crop region in every frame
    let stack_path = root.path().join("analysis/channels/exp_xy001_p0001.tif");
    let pages = read_stack_pages(&stack_path);
    assert_eq!(pages.len(), 5);
    assert_eq!(pages[0].len(), 12 * 4);
    for page in &pages[1..] {
        assert_eq!(page, &pages[0]);
    }

    // persisted products for downstream stages
    for product in ["frame_metadata.json", "frame_metadata.txt", "time_table.json", "channel_table.json"] {
        assert!(
            root.path().join("analysis").join(product).exists(),
            "{product} missing"
        );
    }
}

#[test]
fn peak_run_slices_the_consensus_window() {
    let root = tempfile::tempdir().unwrap();
    let image_dir = root.path().join("TIFF");
    std::fs::create_dir_all(&image_dir).unwrap();

    let mut plane = Array2::<u16>::from_elem((48, 64), BACKGROUND);
    for r in 0..48 {
        plane[[r, 20]] = 4000;
    }
    for t in 0..5 {
        write_plane(&image_dir, &format!("exp_t{t:03}xy03.tif"), &plane);
    }

    let mut config = base_config(root.path(), DetectionStrategy::Peaks);
    config.compile.trap_crop_height = 20;
    config.compile.trap_crop_width = 6;
    config.compile.peaks.padding_px = 2;

    let pipeline = CompilePipeline::new(config);
    let summary = pipeline.run(None).unwrap();

    assert_eq!(summary.frames_total, 5);
    assert_eq!(summary.channels_written, 1);

    let stack_path = root.path().join("analysis/channels/exp_xy003_p0020.tif");
    let pages = read_stack_pages(&stack_path);
    assert_eq!(pages.len(), 5);
    // consensus box: peak column 20 +- 3, padded by 2 -> 10 columns wide
    assert_eq!(pages[0].len(), 20 * 10);
}

#[test]
fn grouped_container_output_writes_one_store_per_fov() {
    let root = tempfile::tempdir().unwrap();
    let image_dir = root.path().join("TIFF");
    std::fs::create_dir_all(&image_dir).unwrap();

    let mut plane = Array2::<u16>::from_elem((48, 64), BACKGROUND);
    for r in 0..48 {
        plane[[r, 30]] = 4000;
    }
    for t in 0..3 {
        write_plane(&image_dir, &format!("exp_t{t:03}xy02.tif"), &plane);
    }

    let mut config = base_config(root.path(), DetectionStrategy::Peaks);
    config.output = OutputFormat::GroupedContainer;
    config.compile.trap_crop_height = 20;
    config.compile.trap_crop_width = 6;

    let summary = CompilePipeline::new(config).run(None).unwrap();
    assert_eq!(summary.channels_written, 1);

    let container = root.path().join("analysis/containers/xy002.zarr");
    assert!(container.is_dir(), "container store missing");
}
