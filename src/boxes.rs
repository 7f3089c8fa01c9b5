//! Trap bounding boxes and per-frame rigid shifting.
//!
//! Boxes are half-open pixel ranges `[min_row, max_row) x [min_col, max_col)`
//! in frame coordinates, stored as `i64` so a shifted box can leave the frame
//! and be detected doing so. A box that leaves `[0, frame_dim)` after
//! shifting is an explicit, observable condition — never wrapped, never
//! silently clipped. The policy applied by [`shift_boxes`] drops the channel
//! for the whole run so every surviving stack keeps one crop per timepoint.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, Timepoint};

/// Axis-aligned trap bounding box, half-open on both axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapBox {
    pub min_row: i64,
    pub min_col: i64,
    pub max_row: i64,
    pub max_col: i64,
}

impl TrapBox {
    pub fn new(min_row: i64, min_col: i64, max_row: i64, max_col: i64) -> Self {
        Self {
            min_row,
            min_col,
            max_row,
            max_col,
        }
    }

    /// Box of exactly `height x width` centred on `(row, col)`.
    pub fn centred(row: i64, col: i64, height: i64, width: i64) -> Self {
        let min_row = row - height / 2;
        let min_col = col - width / 2;
        Self {
            min_row,
            min_col,
            max_row: min_row + height,
            max_col: min_col + width,
        }
    }

    pub fn height(&self) -> i64 {
        self.max_row - self.min_row
    }

    pub fn width(&self) -> i64 {
        self.max_col - self.min_col
    }

    pub fn area(&self) -> i64 {
        self.height() * self.width()
    }

    /// Box translated by `shift`; may leave the frame.
    pub fn shifted(&self, shift: ShiftVector) -> Self {
        Self {
            min_row: self.min_row + shift.drow,
            min_col: self.min_col + shift.dcol,
            max_row: self.max_row + shift.drow,
            max_col: self.max_col + shift.dcol,
        }
    }

    /// True when the box lies fully inside a `frame_rows x frame_cols` frame.
    pub fn in_bounds(&self, frame_rows: usize, frame_cols: usize) -> bool {
        self.min_row >= 0
            && self.min_col >= 0
            && self.max_row <= frame_rows as i64
            && self.max_col <= frame_cols as i64
    }
}

/// Estimated rigid translation of one frame relative to frame 0.
///
/// Exactly one vector per frame; the same vector applies to every trap of
/// that frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftVector {
    pub drow: i64,
    pub dcol: i64,
}

impl ShiftVector {
    pub const ZERO: ShiftVector = ShiftVector { drow: 0, dcol: 0 };

    pub fn new(drow: i64, dcol: i64) -> Self {
        Self { drow, dcol }
    }
}

/// A channel removed from the run because its shifted box left the frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DroppedChannel {
    pub channel: ChannelId,
    /// First timepoint at which the box left the frame.
    pub t: Timepoint,
    pub shifted: TrapBox,
}

/// Applies each frame's shift to the reference boxes.
///
/// Returns the per-frame box table for channels that stay in bounds at every
/// timepoint, plus the list of dropped channels. Dropping is run-wide: a
/// channel that leaves the frame in any single timepoint is removed from all
/// of them, so stacks never go ragged.
pub fn shift_boxes(
    reference: &BTreeMap<ChannelId, TrapBox>,
    shifts: &BTreeMap<Timepoint, ShiftVector>,
    frame_rows: usize,
    frame_cols: usize,
) -> (
    BTreeMap<Timepoint, BTreeMap<ChannelId, TrapBox>>,
    Vec<DroppedChannel>,
) {
    let mut dropped: Vec<DroppedChannel> = Vec::new();

    for (&channel, boxx) in reference {
        for (&t, &shift) in shifts {
            let shifted = boxx.shifted(shift);
            if !shifted.in_bounds(frame_rows, frame_cols) {
                warn!(
                    "channel {channel} leaves the frame at t={t} \
                     (rows {}..{}, cols {}..{}); dropping channel",
                    shifted.min_row, shifted.max_row, shifted.min_col, shifted.max_col
                );
                dropped.push(DroppedChannel {
                    channel,
                    t,
                    shifted,
                });
                break;
            }
        }
    }

    let mut per_frame = BTreeMap::new();
    for (&t, &shift) in shifts {
        let boxes: BTreeMap<ChannelId, TrapBox> = reference
            .iter()
            .filter(|(channel, _)| !dropped.iter().any(|d| d.channel == **channel))
            .map(|(&channel, boxx)| (channel, boxx.shifted(shift)))
            .collect();
        per_frame.insert(t, boxes);
    }

    (per_frame, dropped)
}
