//! Channel slicing and stack assembly.
//!
//! Slicing runs one fov at a time: the fov's full raw time series is held in
//! memory once, every surviving channel is cropped from each frame in
//! timepoint order, and the finished stack goes to the configured sink. No
//! two writers ever target the same stack.
//!
//! Crops keep every imaging plane of the frame (plane-minor page order) and
//! are flipped vertically when the channel's closed end points down, so
//! persisted stacks are uniformly closed-end-up; the as-imaged orientation
//! stays on the stack tag and in the metadata table.

pub mod tiff_sink;
pub mod zarr_sink;

use std::path::Path;

use log::{info, warn};
use ndarray::{s, Array2};

use crate::boxes::TrapBox;
use crate::detect::FovLayout;
use crate::error::{CompileError, Result};
use crate::frame::{self, Frame};
use crate::types::{ChannelId, ClosedEnd, FovId, FrameRecord, Timepoint};

/// Final artifact: the ordered crops of one (fov, channel) pair.
///
/// Write-once; never mutated after the sink persists it.
#[derive(Clone, Debug)]
pub struct ChannelStack {
    pub fov: FovId,
    pub channel: ChannelId,
    /// As-imaged orientation; pages are already flipped to closed-end-up.
    pub closed_end: ClosedEnd,
    /// Timepoints contributing pages, ascending.
    pub timepoints: Vec<Timepoint>,
    /// Imaging planes per timepoint.
    pub planes_per_frame: usize,
    /// Cropped pages, timepoint-major, plane-minor.
    pub pages: Vec<Array2<u16>>,
}

/// Output sink for finished channel stacks.
pub trait StackSink {
    fn write_stack(&mut self, stack: &ChannelStack) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SliceSummary {
    pub channels_written: usize,
    pub pages_written: usize,
    pub frames_skipped: usize,
}

/// Slice every surviving channel of one fov into the sink.
///
/// `records` must be the fov's valid frame records sorted by timepoint.
pub fn slice_fov(
    fov: FovId,
    records: &[&FrameRecord],
    layout: &FovLayout,
    image_dir: &Path,
    sink: &mut dyn StackSink,
) -> Result<SliceSummary> {
    let mut summary = SliceSummary::default();

    // the fov's raw series is loaded once and shared by all channels
    let mut series: Vec<(Timepoint, Frame)> = Vec::with_capacity(records.len());
    for record in records {
        match frame::load_frame(&image_dir.join(&record.filename)) {
            Ok(frame) => series.push((record.t, frame)),
            Err(err) => {
                warn!("skipping {} during slicing: {err}", record.filename);
                summary.frames_skipped += 1;
            }
        }
    }

    for channel in layout.channel_ids() {
        let closed_end = layout.orientation_of(channel);
        let mut timepoints = Vec::new();
        let mut pages = Vec::new();
        let mut planes_per_frame = 0usize;

        for (t, frame) in &series {
            let Some(boxes) = layout.boxes_for(*t) else {
                continue; // timepoint rejected by alignment
            };
            let Some(boxx) = boxes.get(&channel) else {
                continue; // channel dropped at the frame edge
            };
            planes_per_frame = frame.planes.len();
            for plane in &frame.planes {
                let mut crop = crop_plane(plane, boxx)?;
                if closed_end == ClosedEnd::Down {
                    crop = crop.slice(s![..;-1, ..]).to_owned();
                }
                pages.push(crop);
            }
            timepoints.push(*t);
        }

        if pages.is_empty() {
            continue;
        }
        summary.channels_written += 1;
        summary.pages_written += pages.len();
        sink.write_stack(&ChannelStack {
            fov,
            channel,
            closed_end,
            timepoints,
            planes_per_frame,
            pages,
        })?;
    }

    info!(
        "fov {fov}: wrote {} channel stacks ({} pages, {} frames skipped)",
        summary.channels_written, summary.pages_written, summary.frames_skipped
    );
    Ok(summary)
}

fn crop_plane(plane: &Array2<u16>, boxx: &TrapBox) -> Result<Array2<u16>> {
    let (rows, cols) = plane.dim();
    if !boxx.in_bounds(rows, cols) {
        // boxes are validated upstream; reaching this is a logic error
        return Err(CompileError::InvalidGeometry {
            message: format!(
                "crop rows {}..{} cols {}..{} exceeds frame {rows}x{cols}",
                boxx.min_row, boxx.max_row, boxx.min_col, boxx.max_col
            ),
        });
    }
    Ok(plane
        .slice(s![
            boxx.min_row as usize..boxx.max_row as usize,
            boxx.min_col as usize..boxx.max_col as usize
        ])
        .to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct CollectingSink {
        stacks: Vec<ChannelStack>,
    }

    impl StackSink for CollectingSink {
        fn write_stack(&mut self, stack: &ChannelStack) -> Result<()> {
            self.stacks.push(stack.clone());
            Ok(())
        }
    }

    fn record(fov: FovId, t: Timepoint, name: &str) -> FrameRecord {
        FrameRecord {
            filename: name.to_string(),
            fov,
            t,
            timestamp_s: 0.0,
            planes: vec!["c1".into()],
            channels: None,
        }
    }

    fn write_gradient_frame(dir: &Path, name: &str, offset: u16) {
        let file = std::fs::File::create(dir.join(name)).unwrap();
        let mut encoder = tiff::encoder::TiffEncoder::new(file).unwrap();
        let page: Vec<u16> = (0..24u16 * 24).map(|i| i + offset).collect();
        encoder
            .write_image::<tiff::encoder::colortype::Gray16>(24, 24, &page)
            .unwrap();
    }

    #[test]
    fn slices_in_timepoint_order_and_skips_rejected_frames() {
        let dir = tempfile::tempdir().unwrap();
        for t in 0..3 {
            write_gradient_frame(dir.path(), &format!("exp_t{t:03}xy01.tif"), t as u16);
        }
        let records_owned: Vec<FrameRecord> = (0..3)
            .map(|t| record(1, t, &format!("exp_t{t:03}xy01.tif")))
            .collect();
        let records: Vec<&FrameRecord> = records_owned.iter().collect();

        let mut frames = BTreeMap::new();
        let boxx = TrapBox::new(2, 3, 10, 7);
        for t in [0u32, 2] {
            // t=1 rejected by alignment
            let mut boxes = BTreeMap::new();
            boxes.insert(5 as ChannelId, boxx);
            frames.insert(t, boxes);
        }
        let layout = FovLayout::Tracked {
            reference: BTreeMap::from([(5, boxx)]),
            orientations: BTreeMap::from([(5, ClosedEnd::Up)]),
            frames,
            rejected: vec![],
            dropped: vec![],
        };

        let mut sink = CollectingSink::default();
        let summary = slice_fov(1, &records, &layout, dir.path(), &mut sink).unwrap();

        assert_eq!(summary.channels_written, 1);
        assert_eq!(sink.stacks.len(), 1);
        let stack = &sink.stacks[0];
        assert_eq!(stack.timepoints, vec![0, 2]);
        assert_eq!(stack.pages.len(), 2);
        assert_eq!(stack.pages[0].dim(), (8, 4));
        // same crop window, shifted intensity per frame
        assert_eq!(stack.pages[1][[0, 0]], stack.pages[0][[0, 0]] + 2);
    }

    #[test]
    fn closed_end_down_stacks_are_flipped_upright() {
        let dir = tempfile::tempdir().unwrap();
        write_gradient_frame(dir.path(), "exp_t000xy01.tif", 0);
        let records_owned = vec![record(1, 0, "exp_t000xy01.tif")];
        let records: Vec<&FrameRecord> = records_owned.iter().collect();

        let boxx = TrapBox::new(0, 0, 4, 4);
        let layout = FovLayout::Static {
            channels: BTreeMap::from([(2 as ChannelId, boxx)]),
            closed_end: ClosedEnd::Down,
        };

        let mut sink = CollectingSink::default();
        slice_fov(1, &records, &layout, dir.path(), &mut sink).unwrap();
        let page = &sink.stacks[0].pages[0];
        // row 0 of the flipped crop is the bottom row of the window
        assert_eq!(page[[0, 0]], 3 * 24);
        assert_eq!(page[[3, 0]], 0);
    }
}
