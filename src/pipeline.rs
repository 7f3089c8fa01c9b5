//! End-to-end compile pipeline.
//!
//! Orchestrates the stages in order — discovery, parallel metadata
//! extraction, channel detection, drift registration, slicing — and persists
//! the products downstream stages consume: the frame metadata table (JSON
//! plus a human-readable dump), the acquisition time table and the channel
//! geometry table.
//!
//! Each stage can be toggled off to reload its persisted product instead,
//! so a run can resume after the expensive parts have already happened.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{CompileConfig, DetectionStrategy, OutputFormat};
use crate::detect::{
    ChannelDetector, ChannelLayout, DetectContext, FovLayout, PeakChannelDetector,
    UnetChannelDetector,
};
use crate::error::{CompileError, Result};
use crate::metadata;
use crate::model::SegmentationModel;
use crate::slicer::{self, tiff_sink::TiffStackSink, zarr_sink::ZarrContainerSink, StackSink};
use crate::types::{FovId, FrameTable, Timepoint};

/// Aggregate counts reported at the end of a run.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct RunSummary {
    pub frames_total: usize,
    pub extraction_failures: usize,
    pub fovs: usize,
    pub channels_written: usize,
    pub pages_written: usize,
    pub frames_rejected: usize,
    pub channels_dropped: usize,
}

/// The compile stage, configured once and run to completion.
pub struct CompilePipeline {
    config: CompileConfig,
}

impl CompilePipeline {
    pub fn new(config: CompileConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    /// Run the pipeline. `model` is required only for the segmentation
    /// strategy.
    pub fn run(&self, model: Option<&dyn SegmentationModel>) -> Result<RunSummary> {
        let config = &self.config;
        let compile = &config.compile;
        fs::create_dir_all(&config.analysis_dir)
            .map_err(|e| CompileError::io(&config.analysis_dir, e))?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers)
            .build()
            .map_err(|e| CompileError::Pool {
                message: e.to_string(),
            })?;

        let mut summary = RunSummary::default();

        // --- metadata -----------------------------------------------------
        let mut table: FrameTable = if compile.do_metadata {
            info!("finding image parameters");
            let files = metadata::discover_frames(
                &config.image_dir,
                compile.t_end,
                &config.fov_filter,
            )?;
            let outcome = metadata::extract_metadata(&files, &pool);
            summary.extraction_failures = outcome.failures;
            outcome.table
        } else {
            info!("loading image parameters from a previous run");
            read_json(&config.analysis_dir.join("frame_metadata.json"))?
        };
        if !config.fov_filter.is_empty() {
            table.entries.retain(|_, entry| {
                entry
                    .record()
                    .map_or(true, |r| config.fov_filter.contains(&r.fov))
            });
        }
        summary.frames_total = table.sorted_records().len();
        summary.fovs = table.fovs().len();

        if compile.do_time_table {
            let time_table = build_time_table(&table);
            write_json(&config.analysis_dir.join("time_table.json"), &time_table)?;
        }

        // --- channel geometry --------------------------------------------
        let layout: ChannelLayout = if compile.do_channel_table {
            let layout = self.detect_channels(&table, &pool, model)?;
            attach_channels(&mut table, &layout);
            write_json(&config.analysis_dir.join("channel_table.json"), &layout)?;
            layout
        } else if compile.do_slicing {
            info!("loading channel table from a previous run");
            read_json(&config.analysis_dir.join("channel_table.json"))?
        } else {
            ChannelLayout::new()
        };

        for fov_layout in layout.values() {
            if let FovLayout::Tracked {
                rejected, dropped, ..
            } = fov_layout
            {
                summary.frames_rejected += rejected.len();
                summary.channels_dropped += dropped.len();
            }
        }

        // persisted after detection so channel geometry is included
        write_json(&config.analysis_dir.join("frame_metadata.json"), &table)?;
        write_text_dump(&config.analysis_dir.join("frame_metadata.txt"), &table)?;

        // --- slicing ------------------------------------------------------
        if compile.do_slicing {
            info!("saving channel slices");
            let mut sink: Box<dyn StackSink> = match config.output {
                OutputFormat::StackFiles => Box::new(TiffStackSink::new(
                    &config.channel_dir,
                    &config.experiment_name,
                )?),
                OutputFormat::GroupedContainer => {
                    Box::new(ZarrContainerSink::new(&config.container_dir)?)
                }
            };
            // one fov at a time bounds the raw series held in memory
            for (fov, fov_layout) in &layout {
                let records = table.fov_records(*fov);
                let fov_summary = slicer::slice_fov(
                    *fov,
                    &records,
                    fov_layout,
                    &config.image_dir,
                    sink.as_mut(),
                )?;
                summary.channels_written += fov_summary.channels_written;
                summary.pages_written += fov_summary.pages_written;
            }
        }

        info!(
            "compile finished: {} frames ({} extraction failures), {} fovs, \
             {} stacks written",
            summary.frames_total, summary.extraction_failures, summary.fovs,
            summary.channels_written
        );
        Ok(summary)
    }

    fn detect_channels(
        &self,
        table: &FrameTable,
        pool: &rayon::ThreadPool,
        model: Option<&dyn SegmentationModel>,
    ) -> Result<ChannelLayout> {
        let config = &self.config;
        let ctx = DetectContext {
            image_dir: &config.image_dir,
            params: &config.compile,
            phase_plane_index: config.phase_plane_index,
            pool,
        };
        match config.compile.strategy {
            DetectionStrategy::Peaks => {
                info!("detecting channels per frame (peak strategy)");
                PeakChannelDetector.detect(table, &ctx)
            }
            DetectionStrategy::Segmentation => {
                info!("detecting channels with the segmentation model");
                let model = model.ok_or(CompileError::ModelRequired)?;
                UnetChannelDetector { model }.detect(table, &ctx)
            }
        }
    }
}

/// (fov, timepoint) -> acquisition timestamp, for downstream stages.
fn build_time_table(table: &FrameTable) -> BTreeMap<FovId, BTreeMap<Timepoint, f64>> {
    let mut time_table: BTreeMap<FovId, BTreeMap<Timepoint, f64>> = BTreeMap::new();
    for record in table.sorted_records() {
        time_table
            .entry(record.fov)
            .or_default()
            .insert(record.t, record.timestamp_s);
    }
    time_table
}

/// Copy the detected geometry into each frame record, exactly once.
fn attach_channels(table: &mut FrameTable, layout: &ChannelLayout) {
    for entry in table.entries.values_mut() {
        let Some(record) = entry.record_mut() else {
            continue;
        };
        let Some(fov_layout) = layout.get(&record.fov) else {
            continue;
        };
        record.channels = fov_layout.boxes_for(record.t).cloned();
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| CompileError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    fs::write(path, json).map_err(|e| CompileError::io(path, e))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|e| CompileError::io(path, e))?;
    serde_json::from_str(&contents).map_err(|e| CompileError::Json {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Human-readable sibling of the JSON table.
fn write_text_dump<T: std::fmt::Debug>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, format!("{value:#?}\n")).map_err(|e| CompileError::io(path, e))
}
