//! Stateless per-frame peak detection and cross-frame consensus.
//!
//! Each frame is analyzed independently: the phase plane collapses to a
//! column intensity profile, profile peaks above a relative threshold become
//! channel boxes, and the closed-end orientation is resolved per frame. No
//! cross-frame alignment happens here — the strategy assumes stage drift is
//! small against the channel spacing, which is why detection simply reruns
//! on every frame.
//!
//! The consensus step then merges the per-frame detections of one fov into a
//! single geometry per channel: peak columns are clustered within the
//! configured spacing, clusters seen in too few frames are dropped, and the
//! surviving clusters take their median box, padded and clamped.

use std::collections::BTreeMap;

use log::debug;
use ndarray::Array2;

use crate::boxes::TrapBox;
use crate::config::{CompileParams, OrientationMode, PeakParams};
use crate::types::{ChannelId, ClosedEnd};

/// Channel boxes found in a single frame, keyed by peak column.
#[derive(Clone, Debug, Default)]
pub struct FrameChannels {
    pub boxes: BTreeMap<ChannelId, TrapBox>,
    pub closed_end: ClosedEnd,
}

/// Detect channels in one frame's phase plane.
pub fn detect_frame(plane: &Array2<u16>, params: &CompileParams) -> FrameChannels {
    let profile = column_profile(plane);
    let peaks = find_peaks(
        &profile,
        params.peaks.channel_spacing_px,
        params.peaks.rel_threshold,
    );
    debug!("peak detector found {} channel candidates", peaks.len());

    let rows = plane.nrows();
    let row_start = params.peaks.crop_row_start.min(rows) as i64;
    let row_end = (params.peaks.crop_row_start + params.trap_crop_height).min(rows) as i64;
    let half_width = (params.trap_crop_width / 2) as i64;

    let mut boxes = BTreeMap::new();
    for peak in peaks {
        let min_col = peak as i64 - half_width;
        let boxx = TrapBox::new(
            row_start,
            min_col,
            row_end,
            min_col + params.trap_crop_width as i64,
        );
        if boxx.in_bounds(rows, plane.ncols()) {
            boxes.insert(peak as ChannelId, boxx);
        }
    }

    FrameChannels {
        boxes,
        closed_end: resolve_orientation(plane, &params.peaks),
    }
}

/// Mean intensity per column.
fn column_profile(plane: &Array2<u16>) -> Vec<f64> {
    let rows = plane.nrows().max(1) as f64;
    (0..plane.ncols())
        .map(|c| plane.column(c).iter().map(|&v| v as f64).sum::<f64>() / rows)
        .collect()
}

/// Local maxima above `baseline + rel_threshold * (max - baseline)`, at
/// least `min_separation` columns apart. Stronger peaks win ties.
fn find_peaks(profile: &[f64], min_separation: usize, rel_threshold: f64) -> Vec<usize> {
    if profile.len() < 3 {
        return Vec::new();
    }
    let baseline = profile.iter().copied().fold(f64::INFINITY, f64::min);
    let maximum = profile.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if maximum <= baseline {
        return Vec::new();
    }
    let floor = baseline + rel_threshold * (maximum - baseline);

    let mut candidates: Vec<usize> = (1..profile.len() - 1)
        .filter(|&c| {
            profile[c] >= floor && profile[c] >= profile[c - 1] && profile[c] > profile[c + 1]
        })
        .collect();
    candidates.sort_by(|&a, &b| {
        profile[b]
            .partial_cmp(&profile[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut peaks: Vec<usize> = Vec::new();
    for c in candidates {
        if peaks
            .iter()
            .all(|&p| p.abs_diff(c) >= min_separation.max(1))
        {
            peaks.push(c);
        }
    }
    peaks.sort_unstable();
    peaks
}

/// Resolve the closed-end orientation for one frame.
///
/// `auto` compares the mean intensity of the top and bottom margin rows; the
/// darker margin is the sealed side.
fn resolve_orientation(plane: &Array2<u16>, params: &PeakParams) -> ClosedEnd {
    match params.orientation {
        OrientationMode::Up => ClosedEnd::Up,
        OrientationMode::Down => ClosedEnd::Down,
        OrientationMode::Auto => {
            let rows = plane.nrows();
            let margin = params.orientation_margin_rows.clamp(1, rows / 2);
            let mean = |range: std::ops::Range<usize>| -> f64 {
                let mut sum = 0f64;
                let mut count = 0usize;
                for r in range {
                    for v in plane.row(r) {
                        sum += *v as f64;
                        count += 1;
                    }
                }
                sum / count.max(1) as f64
            };
            let top = mean(0..margin);
            let bottom = mean(rows - margin..rows);
            if bottom < top {
                ClosedEnd::Down
            } else {
                ClosedEnd::Up
            }
        }
    }
}

/// Merge per-frame detections of one fov into the channel geometry table.
///
/// `per_frame` holds the detection of each analyzed frame. Peak columns are
/// clustered within the channel spacing; a cluster surviving the
/// `consensus_min_fraction` gate contributes the median of its boxes, padded
/// by `padding_px` on the column axis and clamped to frame bounds. The
/// fov-wide orientation is the majority vote across frames.
pub fn consensus_channels(
    per_frame: &[FrameChannels],
    params: &CompileParams,
    frame_rows: usize,
    frame_cols: usize,
) -> (BTreeMap<ChannelId, TrapBox>, ClosedEnd) {
    let spacing = params.peaks.channel_spacing_px.max(1) as i64;

    // cluster peak columns across frames
    let mut clusters: Vec<(i64, Vec<TrapBox>)> = Vec::new();
    for frame in per_frame {
        for (&peak, boxx) in &frame.boxes {
            let peak = peak as i64;
            match clusters
                .iter_mut()
                .find(|(center, _)| (*center - peak).abs() < spacing)
            {
                Some((_, members)) => members.push(*boxx),
                None => clusters.push((peak, vec![*boxx])),
            }
        }
    }

    let min_members =
        ((per_frame.len() as f64) * params.peaks.consensus_min_fraction).ceil() as usize;
    let pad = params.peaks.padding_px as i64;

    let mut channels = BTreeMap::new();
    for (_, members) in clusters
        .into_iter()
        .filter(|(_, members)| members.len() >= min_members.max(1))
    {
        let min_col = median(members.iter().map(|b| b.min_col)) - pad;
        let max_col = median(members.iter().map(|b| b.max_col)) + pad;
        let min_row = median(members.iter().map(|b| b.min_row));
        let max_row = median(members.iter().map(|b| b.max_row));
        let boxx = TrapBox::new(
            min_row.max(0),
            min_col.max(0),
            max_row.min(frame_rows as i64),
            max_col.min(frame_cols as i64),
        );
        let id = ((boxx.min_col + boxx.max_col) / 2) as ChannelId;
        channels.insert(id, boxx);
    }

    let down_votes = per_frame
        .iter()
        .filter(|f| f.closed_end == ClosedEnd::Down)
        .count();
    let closed_end = if down_votes * 2 > per_frame.len() {
        ClosedEnd::Down
    } else {
        ClosedEnd::Up
    };

    (channels, closed_end)
}

fn median(values: impl Iterator<Item = i64>) -> i64 {
    let mut values: Vec<i64> = values.collect();
    values.sort_unstable();
    values[values.len() / 2]
}
