//! Core records shared between pipeline stages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::boxes::TrapBox;

/// One fixed microscope stage position imaged repeatedly over time.
pub type FovId = u32;
/// Index of a frame within the time series of one fov.
pub type Timepoint = u32;
/// Channel identity within a fov (consensus column for the peak strategy,
/// trap label for the segmentation strategy).
pub type ChannelId = u32;

/// Orientation of a trap's sealed end within the frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedEnd {
    #[default]
    Up,
    Down,
}

impl ClosedEnd {
    pub fn flipped(self) -> Self {
        match self {
            ClosedEnd::Up => ClosedEnd::Down,
            ClosedEnd::Down => ClosedEnd::Up,
        }
    }
}

/// Acquisition metadata for one raw frame file.
///
/// Created by the metadata extractor; `channels` is populated exactly once
/// by the detection stage and never mutated afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Frame file name, relative to the image directory.
    pub filename: String,
    pub fov: FovId,
    pub t: Timepoint,
    /// Acquisition timestamp, seconds since the Unix epoch.
    pub timestamp_s: f64,
    /// Ordered imaging plane names (`c1`, `c2`, ...).
    pub planes: Vec<String>,
    /// Channel geometry for this frame, keyed by channel id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<BTreeMap<ChannelId, TrapBox>>,
}

/// Table entry for one discovered frame file.
///
/// A file whose extraction failed keeps an explicit sentinel entry so the
/// failure stays visible downstream instead of the file silently vanishing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameEntry {
    Valid { record: FrameRecord },
    Failed { reason: String },
}

impl FrameEntry {
    pub fn record(&self) -> Option<&FrameRecord> {
        match self {
            FrameEntry::Valid { record } => Some(record),
            FrameEntry::Failed { .. } => None,
        }
    }

    pub fn record_mut(&mut self) -> Option<&mut FrameRecord> {
        match self {
            FrameEntry::Valid { record } => Some(record),
            FrameEntry::Failed { .. } => None,
        }
    }
}

/// Frame metadata table for the whole run, keyed by filename.
///
/// Consumers must never depend on map iteration order for time ordering;
/// use [`FrameTable::sorted_records`] or [`FrameTable::fov_records`], which
/// sort by timepoint explicitly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FrameTable {
    pub entries: BTreeMap<String, FrameEntry>,
}

impl FrameTable {
    /// Valid records sorted by (fov, timepoint).
    pub fn sorted_records(&self) -> Vec<&FrameRecord> {
        let mut records: Vec<&FrameRecord> =
            self.entries.values().filter_map(FrameEntry::record).collect();
        records.sort_by_key(|r| (r.fov, r.t));
        records
    }

    /// Valid records of one fov sorted by timepoint.
    pub fn fov_records(&self, fov: FovId) -> Vec<&FrameRecord> {
        let mut records: Vec<&FrameRecord> = self
            .entries
            .values()
            .filter_map(FrameEntry::record)
            .filter(|r| r.fov == fov)
            .collect();
        records.sort_by_key(|r| r.t);
        records
    }

    /// Distinct fov ids present in the table, ascending.
    pub fn fovs(&self) -> Vec<FovId> {
        let mut fovs: Vec<FovId> = self
            .entries
            .values()
            .filter_map(FrameEntry::record)
            .map(|r| r.fov)
            .collect();
        fovs.sort_unstable();
        fovs.dedup();
        fovs
    }

    pub fn failure_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, FrameEntry::Failed { .. }))
            .count()
    }
}
