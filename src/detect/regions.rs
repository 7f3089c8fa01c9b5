//! Connected-component primitives over boolean masks.
//!
//! Covers everything the detection and alignment stages need from a
//! segmentation mask: union-find labeling (4-connectivity), per-region
//! properties (bbox, area, centroid), single-axis dilation for fusing trap
//! blobs across the trough, and modal-area outlier rejection.
//!
//! Regions are transient: they live for one detection or alignment pass and
//! are discarded once consumed.

use nalgebra::Vector2;
use ndarray::Array2;

use crate::boxes::TrapBox;

/// A connected region of foreground pixels.
#[derive(Clone, Debug)]
pub struct Region {
    /// Compact label, 1-based, in scan order.
    pub label: u32,
    pub bbox: TrapBox,
    /// Number of pixels in the region.
    pub area: usize,
    /// Centroid as (row, col).
    pub centroid: Vector2<f64>,
}

/// Label 4-connected components of `mask`.
///
/// Returns the label image (0 = background, labels compact in scan order)
/// and the number of labels.
pub fn label_mask(mask: &Array2<bool>) -> (Array2<u32>, u32) {
    let (rows, cols) = mask.dim();
    let mut labels = Array2::<u32>::zeros((rows, cols));
    let mut uf = UnionFind::new();

    for r in 0..rows {
        for c in 0..cols {
            if !mask[[r, c]] {
                continue;
            }
            let left = if c > 0 { labels[[r, c - 1]] } else { 0 };
            let up = if r > 0 { labels[[r - 1, c]] } else { 0 };
            let label = match (left, up) {
                (0, 0) => uf.make_set(),
                (l, 0) => l,
                (0, u) => u,
                (l, u) => {
                    if l != u {
                        uf.union(l, u);
                    }
                    l
                }
            };
            labels[[r, c]] = label;
        }
    }

    let count = uf.flatten(labels.as_slice_mut().unwrap_or(&mut []));
    (labels, count)
}

/// Per-region properties of a label image, sorted by label.
pub fn region_props(labels: &Array2<u32>, num_labels: u32) -> Vec<Region> {
    let n = num_labels as usize;
    if n == 0 {
        return Vec::new();
    }
    let (rows, cols) = labels.dim();
    let mut min_row = vec![i64::MAX; n];
    let mut min_col = vec![i64::MAX; n];
    let mut max_row = vec![i64::MIN; n];
    let mut max_col = vec![i64::MIN; n];
    let mut area = vec![0usize; n];
    let mut sum_row = vec![0f64; n];
    let mut sum_col = vec![0f64; n];

    for r in 0..rows {
        for c in 0..cols {
            let label = labels[[r, c]];
            if label == 0 {
                continue;
            }
            let i = (label - 1) as usize;
            min_row[i] = min_row[i].min(r as i64);
            min_col[i] = min_col[i].min(c as i64);
            max_row[i] = max_row[i].max(r as i64);
            max_col[i] = max_col[i].max(c as i64);
            area[i] += 1;
            sum_row[i] += r as f64;
            sum_col[i] += c as f64;
        }
    }

    (0..n)
        .filter(|&i| area[i] > 0)
        .map(|i| Region {
            label: (i + 1) as u32,
            bbox: TrapBox::new(min_row[i], min_col[i], max_row[i] + 1, max_col[i] + 1),
            area: area[i],
            centroid: Vector2::new(sum_row[i] / area[i] as f64, sum_col[i] / area[i] as f64),
        })
        .collect()
}

/// Dilate along the column axis only, with a flat `1 x (2*half_width + 1)`
/// structuring element.
///
/// Used to merge the above-trough and below-trough trap blobs of one trough
/// into a single region; the row axis is left untouched.
pub fn dilate_columns(mask: &Array2<bool>, half_width: usize) -> Array2<bool> {
    let (rows, cols) = mask.dim();
    let mut out = Array2::from_elem((rows, cols), false);
    for r in 0..rows {
        // running count of set pixels inside the sliding window
        let mut in_window = 0usize;
        for c in 0..cols.min(half_width + 1) {
            if mask[[r, c]] {
                in_window += 1;
            }
        }
        for c in 0..cols {
            out[[r, c]] = in_window > 0;
            let leaving = c as i64 - half_width as i64;
            if leaving >= 0 && mask[[r, leaving as usize]] {
                in_window -= 1;
            }
            let entering = c + half_width + 1;
            if entering < cols && mask[[r, entering]] {
                in_window += 1;
            }
        }
    }
    out
}

/// Most frequent area in `areas`; ties resolve to the smallest area.
pub fn modal_area(areas: &[usize]) -> Option<usize> {
    let mut counts = std::collections::BTreeMap::<usize, usize>::new();
    for &a in areas {
        *counts.entry(a).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|(area_a, count_a), (area_b, count_b)| {
            count_a.cmp(count_b).then(area_b.cmp(area_a))
        })
        .map(|(area, _)| area)
}

/// Area and shape gate applied to trap components; both the first-frame
/// detection and the drift alignment run it.
#[derive(Clone, Copy, Debug)]
pub struct TrapFilter {
    /// Minimum pixel area of an accepted component.
    pub area_threshold: usize,
    /// Configured trap width, pixels.
    pub width: usize,
    /// Configured trap height, pixels.
    pub height: usize,
    /// Allowed bbox deviation from the configured dimensions.
    pub tolerance: usize,
}

/// Result of [`TrapFilter::accept`].
#[derive(Debug)]
pub struct AcceptedTraps {
    /// Mask holding the painted, exact-dimension boxes of accepted traps.
    pub mask: Array2<bool>,
    /// Regions of the painted mask, relabeled compactly.
    pub regions: Vec<Region>,
    /// Component count before filtering.
    pub total_components: usize,
}

impl TrapFilter {
    /// Filter the components of `mask` and paint each accepted one as an
    /// exact `height x width` box centred on its centroid.
    ///
    /// A component is accepted when its area exceeds the threshold, its
    /// bbox matches the configured trap dimensions within the tolerance,
    /// and the exact box fits inside the frame. The painted mask is then
    /// relabeled so overlapping boxes merge — downstream modal-area
    /// filtering relies on those merges showing up as off-mode areas.
    pub fn accept(&self, mask: &Array2<bool>) -> AcceptedTraps {
        let (rows, cols) = mask.dim();
        let (labels, count) = label_mask(mask);
        let props = region_props(&labels, count);
        let total_components = props.len();

        let mut painted = Array2::from_elem((rows, cols), false);
        for region in &props {
            if !self.matches(region) {
                continue;
            }
            let boxx = TrapBox::centred(
                region.centroid.x.round() as i64,
                region.centroid.y.round() as i64,
                self.height as i64,
                self.width as i64,
            );
            if !boxx.in_bounds(rows, cols) {
                continue;
            }
            for r in boxx.min_row..boxx.max_row {
                for c in boxx.min_col..boxx.max_col {
                    painted[[r as usize, c as usize]] = true;
                }
            }
        }

        let (relabeled, relabel_count) = label_mask(&painted);
        let regions = region_props(&relabeled, relabel_count);
        AcceptedTraps {
            mask: painted,
            regions,
            total_components,
        }
    }

    fn matches(&self, region: &Region) -> bool {
        let tol = self.tolerance as i64;
        region.area > self.area_threshold
            && (region.bbox.height() - self.height as i64).abs() <= tol
            && (region.bbox.width() - self.width as i64).abs() <= tol
    }
}

struct UnionFind {
    parent: Vec<u32>,
    next: u32,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: Vec::new(),
            next: 1,
        }
    }

    fn make_set(&mut self) -> u32 {
        let label = self.next;
        self.parent.push(label);
        self.next += 1;
        label
    }

    fn find(&mut self, label: u32) -> u32 {
        let mut root = label;
        while self.parent[(root - 1) as usize] != root {
            root = self.parent[(root - 1) as usize];
        }
        // path compression
        let mut current = label;
        while current != root {
            let next = self.parent[(current - 1) as usize];
            self.parent[(current - 1) as usize] = root;
            current = next;
        }
        root
    }

    fn union(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[(hi - 1) as usize] = lo;
        }
    }

    /// Remap provisional labels to compact 1..=n; returns n.
    fn flatten(&mut self, labels: &mut [u32]) -> u32 {
        if self.parent.is_empty() {
            return 0;
        }
        let len = self.parent.len();
        let mut remap = vec![0u32; len + 1];
        let mut count = 0u32;
        for provisional in 1..=len as u32 {
            let root = self.find(provisional);
            if remap[root as usize] == 0 {
                count += 1;
                remap[root as usize] = count;
            }
            remap[provisional as usize] = remap[root as usize];
        }
        for label in labels.iter_mut() {
            if *label != 0 {
                *label = remap[*label as usize];
            }
        }
        count
    }
}
