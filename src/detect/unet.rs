//! First-frame trap detection with the segmentation model.
//!
//! Runs once per fov on the first frame at full resolution:
//!
//! 1. tiled inference with weighted mosaic reconstruction ([`mosaic`]),
//! 2. per-pixel argmax over the three class maps,
//! 3. area/shape filtering of trap components ([`regions::TrapFilter`]),
//! 4. column-axis dilation fusing trap blobs across the trough,
//! 5. selection of the alignment anchor: the first fused region whose
//!    centroid admits an in-bounds square crop.
//!
//! Later frames never see full-frame inference — the anchor window is all
//! the drift estimator looks at.

use std::collections::BTreeMap;

use log::{debug, info};
use ndarray::{s, Array2, ArrayView3};

use crate::boxes::TrapBox;
use crate::config::CompileParams;
use crate::detect::mosaic::TileGrid;
use crate::detect::regions::{self, Region, TrapFilter};
use crate::error::{CompileError, Result};
use crate::model::{predict_chunked, SegmentationModel};
use crate::types::{ChannelId, ClosedEnd, FovId};

/// Class indices in the model output.
pub const CLASS_TRAP: usize = 0;
pub const CLASS_TROUGH: usize = 1;

/// Reference trap layout of one fov, in frame-0 coordinates.
#[derive(Clone, Debug)]
pub struct UnetDetection {
    /// Accepted trap boxes keyed by region label.
    pub reference: BTreeMap<ChannelId, TrapBox>,
    /// Closed-end orientation per trap, derived from the trough class map.
    pub orientations: BTreeMap<ChannelId, ClosedEnd>,
    /// Centroid of the anchor region, (row, col).
    pub anchor: (i64, i64),
    pub diagnostics: UnetDiagnostics,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UnetDiagnostics {
    pub tiles: usize,
    pub components_total: usize,
    pub traps_accepted: usize,
    pub fused_regions: usize,
    pub anchor_label: u32,
}

/// Detect the reference trap layout on one fov's first frame.
pub fn detect_reference_traps(
    fov: FovId,
    plane: &Array2<u16>,
    model: &dyn SegmentationModel,
    params: &CompileParams,
) -> Result<UnetDetection> {
    let (rows, cols) = plane.dim();
    let seg = &params.segmentation;
    let tile = 2 * seg.shift_distance;

    let grid = TileGrid::new(rows, cols, tile, seg.shift_distance)?;
    let scaled = plane.mapv(|v| f32::from(v) / f32::from(u16::MAX));
    let batch = grid.extract_batch(&scaled);
    debug!(
        "fov {fov}: running first-frame inference over {} tiles",
        grid.tile_count()
    );
    let tile_maps = predict_chunked(model, batch.view(), seg.batch_size)?;
    let class_maps = grid.reconstruct(tile_maps.view())?;

    let trap_mask = class_mask(class_maps.view(), CLASS_TRAP);
    let trough_mask = class_mask(class_maps.view(), CLASS_TROUGH);

    let filter = TrapFilter {
        area_threshold: params.trap_area_threshold,
        width: params.trap_crop_width,
        height: params.trap_crop_height,
        tolerance: params.shape_tolerance_px,
    };
    let accepted = filter.accept(&trap_mask);
    if accepted.regions.is_empty() {
        return Err(CompileError::NoAcceptedTraps {
            fov,
            area_threshold: params.trap_area_threshold,
            width: params.trap_crop_width,
            height: params.trap_crop_height,
            tolerance: params.shape_tolerance_px,
        });
    }

    let mut reference = BTreeMap::new();
    let mut orientations = BTreeMap::new();
    for region in &accepted.regions {
        reference.insert(region.label as ChannelId, region.bbox);
        orientations.insert(
            region.label as ChannelId,
            trap_orientation(&trough_mask, &region.bbox),
        );
    }

    let fused = regions::dilate_columns(&accepted.mask, seg.fuse_half_width);
    let (fused_labels, fused_count) = regions::label_mask(&fused);
    let fused_regions = regions::region_props(&fused_labels, fused_count);

    let anchor_region = select_anchor(&fused_regions, rows, cols, seg.shift_distance)
        .ok_or(CompileError::NoAnchorRegion { fov, side: tile })?;
    let anchor = (
        anchor_region.centroid.x.round() as i64,
        anchor_region.centroid.y.round() as i64,
    );

    info!(
        "fov {fov}: {} traps accepted ({} raw components), {} fused regions, anchor at ({}, {})",
        accepted.regions.len(),
        accepted.total_components,
        fused_regions.len(),
        anchor.0,
        anchor.1
    );

    Ok(UnetDetection {
        diagnostics: UnetDiagnostics {
            tiles: grid.tile_count(),
            components_total: accepted.total_components,
            traps_accepted: accepted.regions.len(),
            fused_regions: fused_regions.len(),
            anchor_label: anchor_region.label,
        },
        reference,
        orientations,
        anchor,
    })
}

/// Pixels whose argmax over the class axis equals `class` (ties go to the
/// lower index, matching a plain argmax).
pub fn class_mask(class_maps: ArrayView3<f32>, class: usize) -> Array2<bool> {
    let (rows, cols, classes) = class_maps.dim();
    let mut mask = Array2::from_elem((rows, cols), false);
    for r in 0..rows {
        for c in 0..cols {
            let mut best = 0usize;
            for k in 1..classes {
                if class_maps[[r, c, k]] > class_maps[[r, c, best]] {
                    best = k;
                }
            }
            mask[[r, c]] = best == class;
        }
    }
    mask
}

/// First fused region (label order) whose centroid allows a square crop of
/// half-side `shift` without leaving the frame.
fn select_anchor(
    fused: &[Region],
    rows: usize,
    cols: usize,
    shift: usize,
) -> Option<&Region> {
    let half = shift as i64;
    fused.iter().find(|region| {
        let r = region.centroid.x.round() as i64;
        let c = region.centroid.y.round() as i64;
        r - half >= 0 && r + half <= rows as i64 && c - half >= 0 && c + half <= cols as i64
    })
}

/// Closed-end orientation of one trap from the trough class map.
///
/// The trough is the trap's open end: whichever side of the box shows more
/// trough pixels within half a trap height is open, and the sealed end is
/// the opposite side. Ties resolve to `Up`.
fn trap_orientation(trough_mask: &Array2<bool>, boxx: &TrapBox) -> ClosedEnd {
    let (rows, cols) = trough_mask.dim();
    let margin = (boxx.height() / 2).max(1);
    let col_range = boxx.min_col.max(0) as usize..(boxx.max_col.min(cols as i64)) as usize;

    let count_band = |r0: i64, r1: i64| -> usize {
        let r0 = r0.clamp(0, rows as i64) as usize;
        let r1 = r1.clamp(0, rows as i64) as usize;
        let mut count = 0usize;
        for r in r0..r1 {
            for c in col_range.clone() {
                if trough_mask[[r, c]] {
                    count += 1;
                }
            }
        }
        count
    };

    let above = count_band(boxx.min_row - margin, boxx.min_row);
    let below = count_band(boxx.max_row, boxx.max_row + margin);
    if above > below {
        // open end above -> sealed end at the bottom
        ClosedEnd::Down
    } else {
        ClosedEnd::Up
    }
}

/// Square crop of half-side `half` around `centre`; the caller guarantees
/// bounds (anchor selection already did).
pub fn crop_window(plane: &Array2<u16>, centre: (i64, i64), half: usize) -> Array2<u16> {
    let r0 = (centre.0 - half as i64).max(0) as usize;
    let c0 = (centre.1 - half as i64).max(0) as usize;
    let side = 2 * half;
    plane.slice(s![r0..r0 + side, c0..c0 + side]).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CLASSES;
    use ndarray::{Array4, ArrayView4};

    /// Stub model: bright pixels are traps, mid-gray pixels are trough.
    struct BandModel;

    impl SegmentationModel for BandModel {
        fn predict(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>> {
            let (n, rows, cols, _) = batch.dim();
            let mut out = Array4::<f32>::zeros((n, rows, cols, CLASSES));
            for i in 0..n {
                for r in 0..rows {
                    for c in 0..cols {
                        let v = batch[[i, r, c, 0]];
                        let class = if v > 0.5 {
                            CLASS_TRAP
                        } else if v > 0.2 {
                            CLASS_TROUGH
                        } else {
                            2
                        };
                        out[[i, r, c, class]] = 1.0;
                    }
                }
            }
            Ok(out)
        }
    }

    fn test_params() -> CompileParams {
        let mut params = CompileParams {
            trap_crop_height: 12,
            trap_crop_width: 4,
            trap_area_threshold: 20,
            shape_tolerance_px: 2,
            ..CompileParams::default()
        };
        params.segmentation.shift_distance = 16;
        params.segmentation.fuse_half_width = 20;
        params.segmentation.batch_size = 4;
        params
    }

    /// 64x64 frame: two trap columns above and below a horizontal trough.
    fn trough_plane() -> Array2<u16> {
        let mut plane = Array2::<u16>::from_elem((64, 64), 100);
        for c in 0..64 {
            for r in 26..36 {
                plane[[r, c]] = 25_000; // trough band
            }
        }
        for &c0 in &[10usize, 40] {
            for r in 14..26 {
                for c in c0..c0 + 4 {
                    plane[[r, c]] = 60_000; // above-trough traps
                }
            }
            for r in 36..48 {
                for c in c0..c0 + 4 {
                    plane[[r, c]] = 60_000; // below-trough traps
                }
            }
        }
        plane
    }

    #[test]
    fn detects_traps_anchor_and_orientations() {
        let plane = trough_plane();
        let detection =
            detect_reference_traps(1, &plane, &BandModel, &test_params()).unwrap();

        assert_eq!(detection.reference.len(), 4);
        for boxx in detection.reference.values() {
            assert_eq!(boxx.height(), 12);
            assert_eq!(boxx.width(), 4);
        }
        // above-trough traps seal upward, below-trough traps seal downward
        let mut ups = 0;
        let mut downs = 0;
        for (id, boxx) in &detection.reference {
            match detection.orientations[id] {
                ClosedEnd::Up => {
                    ups += 1;
                    assert!(boxx.min_row < 30);
                }
                ClosedEnd::Down => {
                    downs += 1;
                    assert!(boxx.min_row > 30);
                }
            }
        }
        assert_eq!((ups, downs), (2, 2));

        // anchor crop stays inside the frame
        let (r, c) = detection.anchor;
        assert!(r - 16 >= 0 && r + 16 <= 64);
        assert!(c - 16 >= 0 && c + 16 <= 64);
        assert_eq!(detection.diagnostics.traps_accepted, 4);
        assert!(detection.diagnostics.fused_regions >= 1);
    }

    #[test]
    fn empty_frame_is_a_named_fatal_error() {
        let plane = Array2::<u16>::from_elem((64, 64), 100);
        let err =
            detect_reference_traps(7, &plane, &BandModel, &test_params()).unwrap_err();
        assert!(matches!(err, CompileError::NoAcceptedTraps { fov: 7, .. }));
    }

    #[test]
    fn crop_window_is_centred_and_square() {
        let mut plane = Array2::<u16>::zeros((64, 64));
        plane[[30, 30]] = 9;
        let crop = crop_window(&plane, (30, 30), 8);
        assert_eq!(crop.dim(), (16, 16));
        assert_eq!(crop[[8, 8]], 9);
    }
}
