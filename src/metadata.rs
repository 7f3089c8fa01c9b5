//! Parallel per-frame metadata extraction.
//!
//! Every discovered frame file is probed independently on a bounded rayon
//! pool: fov id and timepoint come from the `tNNN(N)xyMM` filename
//! convention, the plane list from the TIFF page count, the acquisition
//! timestamp from the file's modification time. The pool is joined before
//! anything downstream runs; there is no streaming consumption of partial
//! results.
//!
//! One corrupt or misnamed file must not abort the batch: its table entry
//! becomes an explicit [`FrameEntry::Failed`] sentinel and the aggregate
//! failure count is logged.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;

use glob::glob;
use log::{info, warn};
use rayon::prelude::*;
use regex::Regex;

use crate::error::{CompileError, Result};
use crate::frame;
use crate::types::{FovId, FrameEntry, FrameRecord, FrameTable, Timepoint};

/// Result of one extraction batch.
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub table: FrameTable,
    pub failures: usize,
}

fn frame_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // 3- and 4-digit timepoints are both in the wild.
    PATTERN.get_or_init(|| Regex::new(r"t(\d{3,4})xy(\d+)").expect("static pattern"))
}

/// Parse `(fov, timepoint)` from a frame filename.
pub fn parse_frame_name(name: &str) -> Option<(FovId, Timepoint)> {
    let caps = frame_name_pattern().captures(name)?;
    let t: Timepoint = caps.get(1)?.as_str().parse().ok()?;
    let fov: FovId = caps.get(2)?.as_str().parse().ok()?;
    Some((fov, t))
}

/// Discover frame files under `image_dir`, sorted by filename.
///
/// Applies the optional timepoint cutoff and fov filter to files whose names
/// parse; unparsable names are kept so extraction can record the failure.
/// Finding nothing is fatal.
pub fn discover_frames(
    image_dir: &Path,
    t_end: Option<Timepoint>,
    fov_filter: &[FovId],
) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = Vec::new();
    for extension in ["tif", "tiff"] {
        let pattern = image_dir.join(format!("*.{extension}"));
        let matches = glob(&pattern.to_string_lossy()).map_err(|e| CompileError::InvalidGeometry {
            message: format!("bad glob pattern {}: {e}", pattern.display()),
        })?;
        for entry in matches.flatten() {
            files.push(entry);
        }
    }
    files.sort();

    files.retain(|path| {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string());
        match name.as_deref().and_then(parse_frame_name) {
            Some((fov, t)) => {
                t_end.map_or(true, |cutoff| t <= cutoff)
                    && (fov_filter.is_empty() || fov_filter.contains(&fov))
            }
            // keep: extraction will tag the record as failed
            None => true,
        }
    });

    if files.is_empty() {
        return Err(CompileError::NoInputFrames {
            dir: image_dir.to_path_buf(),
        });
    }
    info!("found {} frame files under {}", files.len(), image_dir.display());
    Ok(files)
}

/// Extract metadata for every file on the supplied pool, fork-join.
pub fn extract_metadata(files: &[PathBuf], pool: &rayon::ThreadPool) -> ExtractionOutcome {
    let results: Vec<(String, std::result::Result<FrameRecord, String>)> = pool.install(|| {
        files
            .par_iter()
            .map(|path| {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.to_string_lossy().to_string());
                let outcome = extract_one(path, &name);
                (name, outcome)
            })
            .collect()
    });

    let mut table = FrameTable::default();
    let mut failures = 0usize;
    for (name, outcome) in results {
        let entry = match outcome {
            Ok(record) => FrameEntry::Valid { record },
            Err(reason) => {
                warn!("metadata extraction failed for {name}: {reason}");
                failures += 1;
                FrameEntry::Failed { reason }
            }
        };
        table.entries.insert(name, entry);
    }

    info!(
        "extracted metadata for {} frames ({} failed)",
        table.entries.len() - failures,
        failures
    );
    ExtractionOutcome { table, failures }
}

fn extract_one(path: &Path, name: &str) -> std::result::Result<FrameRecord, String> {
    let (fov, t) = parse_frame_name(name)
        .ok_or_else(|| "filename does not match the tNNNxyMM convention".to_string())?;
    let pages = frame::count_pages(path).map_err(|e| e.to_string())?;
    let timestamp_s = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map_or(0.0, |d| d.as_secs_f64());
    Ok(FrameRecord {
        filename: name.to_string(),
        fov,
        t,
        timestamp_s,
        planes: (1..=pages).map(|i| format!("c{i}")).collect(),
        channels: None,
    })
}
