//! Channel detection strategies.
//!
//! Overview
//! - [`peaks`] — stateless per-frame peak finding over a column intensity
//!   profile, merged into one consensus geometry per fov.
//! - [`unet`] — single first-frame segmentation (tiled inference + weighted
//!   mosaic reconstruction) whose reference layout is registered to later
//!   frames by the drift estimator.
//! - [`regions`] — connected-component primitives shared by both the
//!   detection and alignment passes.
//! - [`mosaic`] — overlapping tiling and seam-free recombination.
//!
//! Both strategies answer the same question — where are the traps in every
//! frame of a fov — and sit behind [`ChannelDetector`], selected by
//! configuration. The answer is a [`ChannelLayout`]: static boxes for the
//! peak strategy, per-frame tracked boxes for the segmentation strategy.

pub mod mosaic;
pub mod peaks;
pub mod regions;
pub mod unet;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::boxes::{shift_boxes, DroppedChannel, TrapBox};
use crate::config::CompileParams;
use crate::drift::{self, RejectedFrame};
use crate::error::Result;
use crate::frame;
use crate::model::SegmentationModel;
use crate::types::{ChannelId, ClosedEnd, FovId, FrameRecord, FrameTable, Timepoint};

/// Everything a detector needs besides the frame table.
pub struct DetectContext<'a> {
    pub image_dir: &'a Path,
    pub params: &'a CompileParams,
    pub phase_plane_index: usize,
    pub pool: &'a rayon::ThreadPool,
}

/// Trap geometry of one fov.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FovLayout {
    /// One geometry for every timepoint (peak strategy).
    Static {
        channels: BTreeMap<ChannelId, TrapBox>,
        closed_end: ClosedEnd,
    },
    /// Reference geometry plus per-frame shifted boxes (segmentation
    /// strategy).
    Tracked {
        reference: BTreeMap<ChannelId, TrapBox>,
        orientations: BTreeMap<ChannelId, ClosedEnd>,
        frames: BTreeMap<Timepoint, BTreeMap<ChannelId, TrapBox>>,
        rejected: Vec<RejectedFrame>,
        dropped: Vec<DroppedChannel>,
    },
}

impl FovLayout {
    /// Channel boxes applicable to timepoint `t`, if the frame survived
    /// alignment.
    pub fn boxes_for(&self, t: Timepoint) -> Option<&BTreeMap<ChannelId, TrapBox>> {
        match self {
            FovLayout::Static { channels, .. } => Some(channels),
            FovLayout::Tracked { frames, .. } => frames.get(&t),
        }
    }

    /// Closed-end orientation of one channel.
    pub fn orientation_of(&self, channel: ChannelId) -> ClosedEnd {
        match self {
            FovLayout::Static { closed_end, .. } => *closed_end,
            FovLayout::Tracked { orientations, .. } => {
                orientations.get(&channel).copied().unwrap_or_default()
            }
        }
    }

    /// Channel ids surviving for this fov, ascending.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        match self {
            FovLayout::Static { channels, .. } => channels.keys().copied().collect(),
            FovLayout::Tracked { frames, .. } => frames
                .values()
                .next()
                .map(|boxes| boxes.keys().copied().collect())
                .unwrap_or_default(),
        }
    }
}

/// Channel geometry table for the whole run.
pub type ChannelLayout = BTreeMap<FovId, FovLayout>;

/// One contract, two strategies: turn the frame table into trap geometry.
pub trait ChannelDetector {
    fn detect(&self, table: &FrameTable, ctx: &DetectContext<'_>) -> Result<ChannelLayout>;
}

/// Stateless per-frame peak detection plus consensus (strategy `peaks`).
pub struct PeakChannelDetector;

impl ChannelDetector for PeakChannelDetector {
    fn detect(&self, table: &FrameTable, ctx: &DetectContext<'_>) -> Result<ChannelLayout> {
        let mut layout = ChannelLayout::new();
        for fov in table.fovs() {
            let records = table.fov_records(fov);
            // per-frame detection runs on the same pool as extraction
            let detections: Vec<Option<(usize, usize, peaks::FrameChannels)>> =
                ctx.pool.install(|| {
                    records
                        .par_iter()
                        .map(|record| {
                            let plane = match load_phase_plane(ctx, record) {
                                Ok(plane) => plane,
                                Err(err) => {
                                    warn!(
                                        "skipping {} during detection: {err}",
                                        record.filename
                                    );
                                    return None;
                                }
                            };
                            let channels = peaks::detect_frame(&plane, ctx.params);
                            Some((plane.nrows(), plane.ncols(), channels))
                        })
                        .collect()
                });

            let mut per_frame = Vec::new();
            let mut frame_dims = (0usize, 0usize);
            for detection in detections.into_iter().flatten() {
                frame_dims = (detection.0, detection.1);
                per_frame.push(detection.2);
            }
            if per_frame.is_empty() {
                warn!("fov {fov}: no frame could be analyzed; skipping fov");
                continue;
            }

            let (channels, closed_end) =
                peaks::consensus_channels(&per_frame, ctx.params, frame_dims.0, frame_dims.1);
            info!(
                "fov {fov}: {} consensus channels from {} frames",
                channels.len(),
                per_frame.len()
            );
            layout.insert(
                fov,
                FovLayout::Static {
                    channels,
                    closed_end,
                },
            );
        }
        Ok(layout)
    }
}

/// First-frame segmentation plus drift registration (strategy
/// `segmentation`).
pub struct UnetChannelDetector<'m> {
    pub model: &'m dyn SegmentationModel,
}

impl ChannelDetector for UnetChannelDetector<'_> {
    fn detect(&self, table: &FrameTable, ctx: &DetectContext<'_>) -> Result<ChannelLayout> {
        let mut layout = ChannelLayout::new();
        for fov in table.fovs() {
            let records = table.fov_records(fov);
            let Some(first) = records.first() else {
                continue;
            };

            // reference layout from the first frame at full resolution
            let first_plane = load_phase_plane(ctx, first)?;
            let frame_dims = first_plane.dim();
            let detection =
                unet::detect_reference_traps(fov, &first_plane, self.model, ctx.params)?;
            drop(first_plane);

            // anchor-window crops from every frame, loaded on the pool
            let shift = ctx.params.segmentation.shift_distance;
            let anchor = detection.anchor;
            let crops: Vec<std::result::Result<(Timepoint, Array2<u16>), RejectedFrame>> =
                ctx.pool.install(|| {
                    records
                        .par_iter()
                        .map(|record| match load_phase_plane(ctx, record) {
                            Ok(plane) => {
                                Ok((record.t, unet::crop_window(&plane, anchor, shift)))
                            }
                            Err(err) => Err(RejectedFrame {
                                t: record.t,
                                reason: format!("failed to load frame: {err}"),
                            }),
                        })
                        .collect()
                });

            let mut stack: Vec<(Timepoint, Array2<u16>)> = Vec::new();
            let mut rejected: Vec<RejectedFrame> = Vec::new();
            for crop in crops {
                match crop {
                    Ok(entry) => stack.push(entry),
                    Err(failure) => {
                        warn!("fov {fov} t={}: {}", failure.t, failure.reason);
                        rejected.push(failure);
                    }
                }
            }
            stack.sort_by_key(|(t, _)| *t);

            let mut estimate = drift::estimate_shifts(fov, &stack, self.model, ctx.params)?;
            rejected.append(&mut estimate.rejected);

            let (frames, dropped) = shift_boxes(
                &detection.reference,
                &estimate.shifts,
                frame_dims.0,
                frame_dims.1,
            );

            layout.insert(
                fov,
                FovLayout::Tracked {
                    reference: detection.reference,
                    orientations: detection.orientations,
                    frames,
                    rejected,
                    dropped,
                },
            );
        }
        Ok(layout)
    }
}

fn load_phase_plane(ctx: &DetectContext<'_>, record: &FrameRecord) -> Result<Array2<u16>> {
    let path: PathBuf = ctx.image_dir.join(&record.filename);
    let frame = frame::load_frame(&path)?;
    Ok(frame.plane(ctx.phase_plane_index)?.clone())
}
