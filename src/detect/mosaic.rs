//! Overlapping tiling and weighted mosaic reconstruction.
//!
//! The segmentation model sees fixed-size square tiles, so a full frame is
//! covered by an overlapping grid (stride = shift distance, side =
//! `2 * stride`). Naive averaging of the per-tile class maps leaves seam
//! artifacts at tile borders where the network is least reliable; instead
//! each tile carries a separable taper weight that falls off linearly over
//! the overlap margin, and the recombined map is normalized by the
//! accumulated weight. After normalization the effective weights across the
//! tiles covering any pixel sum to exactly 1, so a uniform probability field
//! reconstructs uniformly.

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView4};

use crate::error::{CompileError, Result};

/// Overlapping square tiling of one frame.
#[derive(Clone, Debug)]
pub struct TileGrid {
    rows: usize,
    cols: usize,
    tile: usize,
    /// Top-left corners of the tiles, row-major over the grid.
    origins: Vec<(usize, usize)>,
    /// Separable taper, one factor per in-tile offset.
    taper: Array1<f32>,
}

impl TileGrid {
    /// Build the grid covering a `rows x cols` frame with `tile`-sided tiles
    /// at `stride` spacing. The final tile of each axis is pinned to the
    /// frame edge so coverage is complete.
    pub fn new(rows: usize, cols: usize, tile: usize, stride: usize) -> Result<Self> {
        if tile == 0 || stride == 0 || stride > tile {
            return Err(CompileError::InvalidGeometry {
                message: format!("invalid tiling: tile={tile}, stride={stride}"),
            });
        }
        if tile > rows || tile > cols {
            return Err(CompileError::InvalidGeometry {
                message: format!("frame {rows}x{cols} is smaller than one {tile}px tile"),
            });
        }
        let row_starts = axis_positions(rows, tile, stride);
        let col_starts = axis_positions(cols, tile, stride);
        let mut origins = Vec::with_capacity(row_starts.len() * col_starts.len());
        for &r in &row_starts {
            for &c in &col_starts {
                origins.push((r, c));
            }
        }
        let overlap = tile - stride;
        Ok(Self {
            rows,
            cols,
            tile,
            origins,
            taper: taper_profile(tile, overlap),
        })
    }

    pub fn tile_count(&self) -> usize {
        self.origins.len()
    }

    pub fn tile_side(&self) -> usize {
        self.tile
    }

    /// Cut every tile out of `plane` as a `(tiles, tile, tile, 1)` batch in
    /// grid order.
    pub fn extract_batch(&self, plane: &Array2<f32>) -> Array4<f32> {
        let n = self.origins.len();
        let mut batch = Array4::<f32>::zeros((n, self.tile, self.tile, 1));
        for (i, &(r0, c0)) in self.origins.iter().enumerate() {
            let window = plane.slice(s![r0..r0 + self.tile, c0..c0 + self.tile]);
            batch
                .slice_mut(s![i, .., .., 0])
                .assign(&window);
        }
        batch
    }

    /// Recombine per-tile class maps `(tiles, tile, tile, classes)` into a
    /// full-frame `(rows, cols, classes)` map using the taper weights.
    pub fn reconstruct(&self, tile_maps: ArrayView4<f32>) -> Result<Array3<f32>> {
        let (n, th, tw, classes) = tile_maps.dim();
        if n != self.origins.len() || th != self.tile || tw != self.tile {
            return Err(CompileError::InvalidGeometry {
                message: format!(
                    "tile map batch {n}x{th}x{tw} does not match grid {}x{}",
                    self.origins.len(),
                    self.tile
                ),
            });
        }

        let mut accum = Array3::<f32>::zeros((self.rows, self.cols, classes));
        let mut weight_sum = Array2::<f32>::zeros((self.rows, self.cols));

        for (i, &(r0, c0)) in self.origins.iter().enumerate() {
            for dr in 0..self.tile {
                for dc in 0..self.tile {
                    let w = self.taper[dr] * self.taper[dc];
                    weight_sum[[r0 + dr, c0 + dc]] += w;
                    for class in 0..classes {
                        accum[[r0 + dr, c0 + dc, class]] += w * tile_maps[[i, dr, dc, class]];
                    }
                }
            }
        }

        // Every pixel is covered by at least one tile and the taper never
        // reaches zero, so the normalization is total.
        for r in 0..self.rows {
            for c in 0..self.cols {
                let w = weight_sum[[r, c]];
                for class in 0..classes {
                    accum[[r, c, class]] /= w;
                }
            }
        }
        Ok(accum)
    }
}

/// Tile start offsets along one axis; the last tile is pinned to the edge.
fn axis_positions(extent: usize, tile: usize, stride: usize) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut p = 0usize;
    loop {
        if p + tile >= extent {
            positions.push(extent - tile);
            break;
        }
        positions.push(p);
        p += stride;
    }
    positions
}

/// Symmetric per-offset taper: linear ramp over the overlap margin, flat 1.0
/// in the core, strictly positive everywhere.
fn taper_profile(tile: usize, overlap: usize) -> Array1<f32> {
    let ramp = (overlap + 1) as f32;
    Array1::from_iter((0..tile).map(|i| {
        let from_start = (i + 1) as f32 / ramp;
        let from_end = (tile - i) as f32 / ramp;
        from_start.min(from_end).min(1.0)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn axis_positions_cover_the_axis_and_pin_the_edge() {
        assert_eq!(axis_positions(2048, 512, 256), vec![0, 256, 512, 768, 1024, 1280, 1536]);
        assert_eq!(axis_positions(512, 512, 256), vec![0]);
        assert_eq!(axis_positions(600, 512, 256), vec![0, 88]);
    }

    #[test]
    fn uniform_probabilities_reconstruct_without_seam_bias() {
        let grid = TileGrid::new(96, 96, 32, 16).unwrap();
        let n = grid.tile_count();
        let mut maps = Array4::<f32>::zeros((n, 32, 32, 3));
        maps.slice_mut(s![.., .., .., 0]).fill(0.7);
        maps.slice_mut(s![.., .., .., 1]).fill(0.2);
        maps.slice_mut(s![.., .., .., 2]).fill(0.1);

        let mosaic = grid.reconstruct(maps.view()).unwrap();
        for r in 0..96 {
            for c in 0..96 {
                assert!((mosaic[[r, c, 0]] - 0.7).abs() < 1e-5, "seam at ({r},{c})");
                assert!((mosaic[[r, c, 1]] - 0.2).abs() < 1e-5);
                assert!((mosaic[[r, c, 2]] - 0.1).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn extract_batch_cuts_tiles_in_grid_order() {
        let mut plane = Array2::<f32>::zeros((64, 64));
        plane[[0, 0]] = 1.0;
        plane[[32, 32]] = 2.0;
        let grid = TileGrid::new(64, 64, 32, 32).unwrap();
        let batch = grid.extract_batch(&plane);
        assert_eq!(batch.dim(), (4, 32, 32, 1));
        assert_eq!(batch[[0, 0, 0, 0]], 1.0);
        assert_eq!(batch[[3, 0, 0, 0]], 2.0);
    }

    #[test]
    fn degenerate_tilings_are_rejected() {
        assert!(TileGrid::new(100, 100, 0, 0).is_err());
        assert!(TileGrid::new(100, 100, 128, 64).is_err());
        assert!(TileGrid::new(100, 100, 64, 128).is_err());
    }
}
