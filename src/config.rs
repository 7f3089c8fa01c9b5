//! Run configuration for the compile pipeline.
//!
//! One YAML paramfile describes the whole run; the CLI may override the
//! worker count, the fov set and the model path after loading. The config
//! value is passed explicitly into every component — there is no ambient
//! global state.
//!
//! Defaults follow common 100x mother-machine acquisitions; for tuning,
//! start with the trap dimensions and the area threshold.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};
use crate::types::FovId;

/// How channel stacks are persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// One multi-page TIFF per (fov, channel).
    StackFiles,
    /// One zarr container per fov with a named array per channel.
    GroupedContainer,
}

/// Which detection strategy locates the traps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionStrategy {
    /// Stateless per-frame peak finding plus cross-frame consensus.
    Peaks,
    /// First-frame segmentation plus centroid-tracking registration.
    Segmentation,
}

/// Closed-end orientation handling for the peak strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrientationMode {
    /// Compare mean intensity of the top and bottom margin rows.
    Auto,
    Up,
    Down,
}

/// Top-level run configuration, loaded from the paramfile.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Experiment name, used as the stack file prefix.
    pub experiment_name: String,
    /// Directory holding the raw frame TIFFs.
    pub image_dir: PathBuf,
    /// Directory receiving metadata tables and reports.
    pub analysis_dir: PathBuf,
    /// Directory receiving per-(fov, channel) stack files.
    pub channel_dir: PathBuf,
    /// Directory receiving per-fov grouped containers.
    pub container_dir: PathBuf,
    /// Worker pool size for metadata extraction; 0 = one per logical core.
    pub num_workers: usize,
    /// Index of the phase-contrast plane within each frame.
    pub phase_plane_index: usize,
    pub output: OutputFormat,
    pub compile: CompileParams,
    /// Restrict the run to these fovs; empty = all.
    #[serde(skip)]
    pub fov_filter: Vec<FovId>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            experiment_name: "experiment".to_string(),
            image_dir: PathBuf::from("TIFF"),
            analysis_dir: PathBuf::from("analysis"),
            channel_dir: PathBuf::from("analysis/channels"),
            container_dir: PathBuf::from("analysis/containers"),
            num_workers: 0,
            phase_plane_index: 0,
            output: OutputFormat::StackFiles,
            compile: CompileParams::default(),
            fov_filter: Vec::new(),
        }
    }
}

/// Parameters of the compile stage proper.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileParams {
    /// Re-run metadata extraction (false reloads the persisted table).
    pub do_metadata: bool,
    /// Re-build the channel geometry table.
    pub do_channel_table: bool,
    /// Write the acquisition time table.
    pub do_time_table: bool,
    /// Slice and write channel stacks.
    pub do_slicing: bool,
    /// Ignore frames with a later timepoint.
    pub t_end: Option<u32>,
    pub strategy: DetectionStrategy,
    /// Height of the sliced channel crop, pixels.
    pub trap_crop_height: usize,
    /// Width of the sliced channel crop, pixels.
    pub trap_crop_width: usize,
    /// Minimum pixel area for an accepted trap component.
    pub trap_area_threshold: usize,
    /// Allowed deviation of a component's bbox from the trap dimensions.
    pub shape_tolerance_px: usize,
    pub peaks: PeakParams,
    pub segmentation: SegmentationParams,
}

impl Default for CompileParams {
    fn default() -> Self {
        Self {
            do_metadata: true,
            do_channel_table: true,
            do_time_table: true,
            do_slicing: true,
            t_end: None,
            strategy: DetectionStrategy::Peaks,
            trap_crop_height: 256,
            trap_crop_width: 30,
            trap_area_threshold: 1000,
            shape_tolerance_px: 12,
            peaks: PeakParams::default(),
            segmentation: SegmentationParams::default(),
        }
    }
}

/// Knobs of the per-frame peak detector and its consensus step.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakParams {
    /// Minimum column separation between two channels, pixels.
    pub channel_spacing_px: usize,
    /// Peak height above the profile baseline, as a fraction of the
    /// baseline-to-maximum range.
    pub rel_threshold: f64,
    /// First row of the channel crop window.
    pub crop_row_start: usize,
    pub orientation: OrientationMode,
    /// Rows sampled at each frame edge when resolving `auto` orientation.
    pub orientation_margin_rows: usize,
    /// Fraction of frames a peak cluster must appear in to survive
    /// consensus.
    pub consensus_min_fraction: f64,
    /// Extra columns added on both sides of the consensus box.
    pub padding_px: usize,
}

impl Default for PeakParams {
    fn default() -> Self {
        Self {
            channel_spacing_px: 45,
            rel_threshold: 0.25,
            crop_row_start: 0,
            orientation: OrientationMode::Auto,
            orientation_margin_rows: 12,
            consensus_min_fraction: 0.5,
            padding_px: 2,
        }
    }
}

/// Knobs of the segmentation detector and the drift estimator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationParams {
    /// Path to the trained trap segmentation model.
    pub model_file: PathBuf,
    /// Frames per inference batch; throughput/memory tunable only.
    pub batch_size: usize,
    /// Tile stride and half-side of the alignment crop; tiles are
    /// `2 * shift_distance` square.
    pub shift_distance: usize,
    /// Half-width of the flat structuring element fusing trap blobs across
    /// the trough, pixels.
    pub fuse_half_width: usize,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            model_file: PathBuf::from("models/traps.onnx"),
            batch_size: 15,
            shift_distance: 256,
            fuse_half_width: 150,
        }
    }
}

/// Load a [`CompileConfig`] from a YAML paramfile.
pub fn load_config(path: &Path) -> Result<CompileConfig> {
    let contents = fs::read_to_string(path).map_err(|e| CompileError::io(path, e))?;
    let config: CompileConfig =
        serde_yaml::from_str(&contents).map_err(|e| CompileError::Config {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_paramfile_fills_defaults() {
        let yaml = r#"
experiment_name: "SJ110"
image_dir: "/data/SJ110/TIFF"
compile:
  strategy: segmentation
  t_end: 100
"#;
        let config: CompileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.experiment_name, "SJ110");
        assert_eq!(config.compile.strategy, DetectionStrategy::Segmentation);
        assert_eq!(config.compile.t_end, Some(100));
        // untouched knobs keep their defaults
        assert_eq!(config.compile.trap_crop_height, 256);
        assert_eq!(config.compile.segmentation.batch_size, 15);
        assert_eq!(config.output, OutputFormat::StackFiles);
    }

    #[test]
    fn output_format_uses_kebab_case_tags() {
        let config: CompileConfig =
            serde_yaml::from_str("output: grouped-container").unwrap();
        assert_eq!(config.output, OutputFormat::GroupedContainer);
    }
}
