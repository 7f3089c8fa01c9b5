//! Drift estimation by centroid tracking against frame 0.
//!
//! The stage drifts slowly, so instead of re-running full-frame inference on
//! every frame, a fixed window around the anchor centroid is cropped from
//! each frame and the whole stack goes through the model in one batched
//! pass. Candidate trap regions are then labeled and filtered per frame
//! exactly like the first-frame detection, and only regions whose pixel
//! area equals the batch-wide modal area are trusted — segmentation noise
//! rarely reproduces the mode.
//!
//! Correspondence between a frame's regions and frame 0's is positional
//! (label order after filtering). When the accepted counts differ the
//! correspondence is invalid, so the frame is rejected rather than silently
//! averaged; rejected frames are excluded from slicing.

use std::collections::BTreeMap;

use log::{info, warn};
use nalgebra::Vector2;
use ndarray::{s, Array2, Array4};
use serde::{Deserialize, Serialize};

use crate::boxes::ShiftVector;
use crate::config::CompileParams;
use crate::detect::regions::{modal_area, Region, TrapFilter};
use crate::detect::unet::{class_mask, CLASS_TRAP};
use crate::error::{CompileError, Result};
use crate::model::{predict_chunked, SegmentationModel};
use crate::types::{FovId, Timepoint};

/// A frame excluded from alignment, with the reason.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RejectedFrame {
    pub t: Timepoint,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct DriftDiagnostics {
    pub frames: usize,
    pub aligned: usize,
    pub rejected: usize,
    pub modal_area: usize,
    pub reference_regions: usize,
}

/// Per-frame rigid shifts of one fov relative to its first frame.
#[derive(Clone, Debug)]
pub struct DriftEstimate {
    pub shifts: BTreeMap<Timepoint, ShiftVector>,
    pub rejected: Vec<RejectedFrame>,
    pub diagnostics: DriftDiagnostics,
}

/// Estimate per-frame shifts from anchor-window crops, one per timepoint in
/// ascending order. `crops[0]` is the reference frame.
pub fn estimate_shifts(
    fov: FovId,
    crops: &[(Timepoint, Array2<u16>)],
    model: &dyn SegmentationModel,
    params: &CompileParams,
) -> Result<DriftEstimate> {
    let side = 2 * params.segmentation.shift_distance;
    let n = crops.len();
    if n == 0 {
        return Err(CompileError::InvalidGeometry {
            message: format!("fov {fov}: no crops to align"),
        });
    }

    // one batched pass over the whole stack
    let mut batch = Array4::<f32>::zeros((n, side, side, 1));
    for (i, (_, crop)) in crops.iter().enumerate() {
        let scaled = crop.mapv(|v| f32::from(v) / f32::from(u16::MAX));
        batch.slice_mut(s![i, .., .., 0]).assign(&scaled);
    }
    let probs = predict_chunked(model, batch.view(), params.segmentation.batch_size)?;

    let filter = TrapFilter {
        area_threshold: params.trap_area_threshold,
        width: params.trap_crop_width,
        height: params.trap_crop_height,
        tolerance: params.shape_tolerance_px,
    };
    let per_frame: Vec<Vec<Region>> = (0..n)
        .map(|i| {
            let mask = class_mask(probs.slice(s![i, .., .., ..]), CLASS_TRAP);
            filter.accept(&mask).regions
        })
        .collect();

    // modal area across the whole batch rejects merged or clipped regions
    let areas: Vec<usize> = per_frame
        .iter()
        .flat_map(|regions| regions.iter().map(|r| r.area))
        .collect();
    let mode = modal_area(&areas).unwrap_or(0);

    let accepted: Vec<Vec<Vector2<f64>>> = per_frame
        .iter()
        .map(|regions| {
            regions
                .iter()
                .filter(|r| r.area == mode)
                .map(|r| r.centroid)
                .collect()
        })
        .collect();

    let reference = &accepted[0];
    if reference.is_empty() {
        return Err(CompileError::NoAcceptedTraps {
            fov,
            area_threshold: params.trap_area_threshold,
            width: params.trap_crop_width,
            height: params.trap_crop_height,
            tolerance: params.shape_tolerance_px,
        });
    }

    let mut shifts = BTreeMap::new();
    let mut rejected = Vec::new();
    for (i, (t, _)) in crops.iter().enumerate() {
        let centroids = &accepted[i];
        if centroids.len() != reference.len() {
            let reason = format!(
                "accepted {} mode-area regions, reference frame has {}; \
                 positional centroid matching is invalid",
                centroids.len(),
                reference.len()
            );
            warn!("fov {fov} t={t}: {reason}");
            rejected.push(RejectedFrame { t: *t, reason });
            continue;
        }
        let mut mean = Vector2::new(0f64, 0f64);
        for (current, anchor) in centroids.iter().zip(reference.iter()) {
            mean += current - anchor;
        }
        mean /= centroids.len() as f64;
        shifts.insert(
            *t,
            ShiftVector::new(mean.x.round() as i64, mean.y.round() as i64),
        );
    }

    let diagnostics = DriftDiagnostics {
        frames: n,
        aligned: shifts.len(),
        rejected: rejected.len(),
        modal_area: mode,
        reference_regions: reference.len(),
    };
    info!(
        "fov {fov}: aligned {}/{} frames (modal area {}, {} reference regions, {} rejected)",
        diagnostics.aligned, n, mode, diagnostics.reference_regions, diagnostics.rejected
    );

    Ok(DriftEstimate {
        shifts,
        rejected,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CLASSES;
    use ndarray::ArrayView4;

    struct ThresholdModel;

    impl SegmentationModel for ThresholdModel {
        fn predict(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>> {
            let (n, rows, cols, _) = batch.dim();
            let mut out = Array4::<f32>::zeros((n, rows, cols, CLASSES));
            for i in 0..n {
                for r in 0..rows {
                    for c in 0..cols {
                        let class = if batch[[i, r, c, 0]] > 0.5 { CLASS_TRAP } else { 2 };
                        out[[i, r, c, class]] = 1.0;
                    }
                }
            }
            Ok(out)
        }
    }

    fn params() -> CompileParams {
        let mut params = CompileParams {
            trap_crop_height: 6,
            trap_crop_width: 3,
            trap_area_threshold: 10,
            shape_tolerance_px: 1,
            ..CompileParams::default()
        };
        params.segmentation.shift_distance = 16;
        params.segmentation.batch_size = 3;
        params
    }

    /// 32x32 crop with 6x3 traps at the given top-left corners.
    fn crop_with_traps(corners: &[(usize, usize)]) -> Array2<u16> {
        let mut crop = Array2::<u16>::from_elem((32, 32), 100);
        for &(r0, c0) in corners {
            for r in r0..r0 + 6 {
                for c in c0..c0 + 3 {
                    crop[[r, c]] = 60_000;
                }
            }
        }
        crop
    }

    #[test]
    fn recovers_an_injected_rigid_translation() {
        let reference = [(8usize, 6usize), (8, 20)];
        let shifted: Vec<(usize, usize)> =
            reference.iter().map(|&(r, c)| (r + 2, c + 3)).collect();
        let crops = vec![
            (0u32, crop_with_traps(&reference)),
            (1u32, crop_with_traps(&shifted)),
        ];

        let estimate = estimate_shifts(1, &crops, &ThresholdModel, &params()).unwrap();
        assert!(estimate.rejected.is_empty());
        assert_eq!(estimate.shifts[&0], ShiftVector::ZERO);
        let recovered = estimate.shifts[&1];
        assert!((recovered.drow - 2).abs() <= 1, "drow={}", recovered.drow);
        assert!((recovered.dcol - 3).abs() <= 1, "dcol={}", recovered.dcol);
    }

    #[test]
    fn region_count_mismatch_rejects_the_frame_not_the_run() {
        let crops = vec![
            (0u32, crop_with_traps(&[(8, 6), (8, 20)])),
            (1u32, crop_with_traps(&[(9, 6)])),
            (2u32, crop_with_traps(&[(9, 7), (9, 21)])),
        ];

        let estimate = estimate_shifts(1, &crops, &ThresholdModel, &params()).unwrap();
        assert_eq!(estimate.rejected.len(), 1);
        assert_eq!(estimate.rejected[0].t, 1);
        assert!(estimate.rejected[0].reason.contains("1 mode-area regions"));
        assert_eq!(estimate.shifts.len(), 2);
        assert_eq!(estimate.shifts[&2], ShiftVector::new(1, 1));
    }

    #[test]
    fn empty_reference_frame_is_fatal() {
        let crops = vec![(0u32, crop_with_traps(&[]))];
        let err = estimate_shifts(3, &crops, &ThresholdModel, &params()).unwrap_err();
        assert!(matches!(err, CompileError::NoAcceptedTraps { fov: 3, .. }));
    }
}
