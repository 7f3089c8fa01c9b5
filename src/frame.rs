//! Owned multi-plane frames and TIFF I/O.
//!
//! A raw frame is one stage position at one timepoint, stored as a
//! multi-page grayscale TIFF with one page per imaging plane. Pixels are
//! widened to `u16` on load; planes are row-major `ndarray` matrices.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ndarray::Array2;
use tiff::decoder::{Decoder, DecodingResult, Limits};

use crate::error::{CompileError, Result};

/// One raw frame: all imaging planes of one (fov, timepoint).
#[derive(Clone, Debug)]
pub struct Frame {
    /// Imaging planes in page order, each `(rows, cols)`.
    pub planes: Vec<Array2<u16>>,
}

impl Frame {
    pub fn rows(&self) -> usize {
        self.planes.first().map_or(0, |p| p.nrows())
    }

    pub fn cols(&self) -> usize {
        self.planes.first().map_or(0, |p| p.ncols())
    }

    /// Borrow one plane, bounds-checked.
    pub fn plane(&self, index: usize) -> Result<&Array2<u16>> {
        self.planes.get(index).ok_or(CompileError::PlaneIndex {
            index,
            available: self.planes.len(),
        })
    }
}

/// Load every page of a grayscale TIFF as one frame.
pub fn load_frame(path: &Path) -> Result<Frame> {
    let file = File::open(path).map_err(|e| CompileError::io(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| tiff_err(path, e))?
        .with_limits(Limits::unlimited());

    let mut planes = Vec::new();
    loop {
        let (cols, rows) = decoder.dimensions().map_err(|e| tiff_err(path, e))?;
        let plane = decode_page(path, &mut decoder, rows as usize, cols as usize)?;
        planes.push(plane);
        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(|e| tiff_err(path, e))?;
    }

    Ok(Frame { planes })
}

/// Page count of a TIFF without decoding pixel data for every page.
pub fn count_pages(path: &Path) -> Result<usize> {
    let file = File::open(path).map_err(|e| CompileError::io(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| tiff_err(path, e))?
        .with_limits(Limits::unlimited());
    let mut pages = 1usize;
    while decoder.more_images() {
        decoder.next_image().map_err(|e| tiff_err(path, e))?;
        pages += 1;
    }
    Ok(pages)
}

fn decode_page<R: std::io::Read + std::io::Seek>(
    path: &Path,
    decoder: &mut Decoder<R>,
    rows: usize,
    cols: usize,
) -> Result<Array2<u16>> {
    let data = match decoder.read_image().map_err(|e| tiff_err(path, e))? {
        DecodingResult::U16(data) => data,
        DecodingResult::U8(data) => data.into_iter().map(u16::from).collect(),
        other => {
            return Err(CompileError::InvalidGeometry {
                message: format!(
                    "{}: unsupported TIFF sample format {:?}",
                    path.display(),
                    std::mem::discriminant(&other)
                ),
            })
        }
    };
    Array2::from_shape_vec((rows, cols), data).map_err(|_| CompileError::InvalidGeometry {
        message: format!("{}: page size does not match its dimensions", path.display()),
    })
}

fn tiff_err(path: &Path, source: tiff::TiffError) -> CompileError {
    CompileError::Tiff {
        path: path.to_path_buf(),
        source,
    }
}
