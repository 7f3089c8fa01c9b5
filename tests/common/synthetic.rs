//! Synthetic mother-machine frames for integration tests.

use std::fs::File;
use std::path::Path;

use ndarray::{Array2, Array4, ArrayView4};
use tiff::encoder::{colortype, TiffEncoder};

use trap_compiler::detect::unet::{CLASS_TRAP, CLASS_TROUGH};
use trap_compiler::model::{SegmentationModel, CLASSES};
use trap_compiler::Result;

pub const BACKGROUND: u16 = 100;
pub const TROUGH: u16 = 25_000;
pub const TRAP: u16 = 60_000;

/// A synthetic fov frame: a horizontal trough band with trap rectangles
/// above and below it, everything drawn at known pixel positions.
pub struct FovScene {
    pub rows: usize,
    pub cols: usize,
    /// Trough band rows, half-open.
    pub trough_rows: (usize, usize),
    /// Trap top-left corners.
    pub traps: Vec<(usize, usize)>,
    pub trap_height: usize,
    pub trap_width: usize,
}

impl FovScene {
    /// Render the frame, rigidly translated by `(drow, dcol)`.
    pub fn render(&self, drow: i64, dcol: i64) -> Array2<u16> {
        let mut plane = Array2::<u16>::from_elem((self.rows, self.cols), BACKGROUND);
        let (t0, t1) = self.trough_rows;
        for r in t0..t1 {
            let r = r as i64 + drow;
            if r < 0 || r >= self.rows as i64 {
                continue;
            }
            for c in 0..self.cols {
                plane[[r as usize, c]] = TROUGH;
            }
        }
        for &(r0, c0) in &self.traps {
            for dr in 0..self.trap_height {
                for dc in 0..self.trap_width {
                    let r = (r0 + dr) as i64 + drow;
                    let c = (c0 + dc) as i64 + dcol;
                    if r >= 0 && c >= 0 && r < self.rows as i64 && c < self.cols as i64 {
                        plane[[r as usize, c as usize]] = TRAP;
                    }
                }
            }
        }
        plane
    }

    /// Render and write a single-plane frame TIFF named by the mother
    /// machine convention.
    pub fn write_frame(
        &self,
        dir: &Path,
        fov: u32,
        t: u32,
        drow: i64,
        dcol: i64,
    ) -> std::path::PathBuf {
        let plane = self.render(drow, dcol);
        let path = dir.join(format!("exp_t{t:03}xy{fov:02}.tif"));
        let file = File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(file).unwrap();
        let (rows, cols) = plane.dim();
        encoder
            .write_image::<colortype::Gray16>(
                cols as u32,
                rows as u32,
                plane.as_slice().unwrap(),
            )
            .unwrap();
        path
    }
}

/// Write an arbitrary single-plane frame TIFF.
pub fn write_plane(dir: &Path, name: &str, plane: &Array2<u16>) -> std::path::PathBuf {
    let path = dir.join(name);
    let file = File::create(&path).unwrap();
    let mut encoder = TiffEncoder::new(file).unwrap();
    let (rows, cols) = plane.dim();
    encoder
        .write_image::<colortype::Gray16>(cols as u32, rows as u32, plane.as_slice().unwrap())
        .unwrap();
    path
}

/// Intensity-threshold stand-in for the trained model: bright pixels are
/// traps, mid-gray pixels are trough, the rest background.
pub struct ThresholdModel;

impl SegmentationModel for ThresholdModel {
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
