//! Hyperslab selection for partial dataset reads.
//!
//! A [`Hyperslab`] selects, per dimension, the indices
//! `start, start + step, ...` strictly below `end`. The selected elements
//! form a dense output array in row-major order.
//!
//! # Example
//!
//! ```
//! use hdfkit_format::selection::Hyperslab;
//!
//! // rows 20..30, every other column in 40..60 of a 100x100 dataset
//! let sel = Hyperslab::new(&[100, 100], &[20, 40], &[30, 60], Some(&[1, 2])).unwrap();
//! assert_eq!(sel.output_shape(), vec![10, 10]);
//! assert_eq!(sel.num_elements(), 100);
//! ```

use crate::error::FormatError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hyperslab {
    pub start: Vec<u64>,
    /// Exclusive upper bound per dimension.
    pub end: Vec<u64>,
    pub step: Vec<u64>,
}

impl Hyperslab {
    /// Select every element of a dataset with shape `dims`.
    pub fn all(dims: &[u64]) -> Self {
        Hyperslab {
            start: vec![0; dims.len()],
            end: dims.to_vec(),
            step: vec![1; dims.len()],
        }
    }

    /// Validate a selection against a dataset shape. `step` defaults to 1.
    pub fn new(dims: &[u64], start: &[u64], end: &[u64], step: Option<&[u64]>) -> Result<Self, FormatError> {
        let rank = dims.len();
        let step = step.map_or_else(|| vec![1; rank], <[u64]>::to_vec);
        if start.len() != rank || end.len() != rank || step.len() != rank {
            return Err(FormatError::InvalidSelection(format!(
                "dataset has rank {rank}, got start {start:?} end {end:?} step {step:?}"
            )));
        }
        for d in 0..rank {
            if step[d] == 0 {
                return Err(FormatError::InvalidSelection(format!("step is zero in dimension {d}")));
            }
            if start[d] > end[d] || end[d] > dims[d] {
                return Err(FormatError::InvalidSelection(format!(
                    "range {}..{} out of bounds for dimension {d} of size {}",
                    start[d], end[d], dims[d]
                )));
            }
        }
        Ok(Hyperslab {
            start: start.to_vec(),
            end: end.to_vec(),
            step,
        })
    }

    pub fn rank(&self) -> usize {
        self.start.len()
    }

    fn count(&self, d: usize) -> u64 {
        let span = self.end[d] - self.start[d];
        span.div_ceil(self.step[d])
    }

    /// Shape of the dense output array.
    pub fn output_shape(&self) -> Vec<u64> {
        (0..self.rank()).map(|d| self.count(d)).collect()
    }

    pub fn num_elements(&self) -> u64 {
        (0..self.rank()).map(|d| self.count(d)).product()
    }

    /// Bounding box `[lo, hi)` of the selected elements.
    pub fn bounds(&self) -> (Vec<u64>, Vec<u64>) {
        let hi = (0..self.rank())
            .map(|d| match self.count(d) {
                0 => self.start[d],
                n => self.start[d] + (n - 1) * self.step[d] + 1,
            })
            .collect();
        (self.start.clone(), hi)
    }

    /// Selected positions inside a block starting at `offset` with extent
    /// `extent`: per dimension, `(local index, output index)` pairs.
    ///
    /// Returns `None` when the block holds no selected element.
    pub fn block_positions(&self, offset: &[u64], extent: &[u64]) -> Option<Vec<Vec<(u64, u64)>>> {
        let mut out = Vec::with_capacity(self.rank());
        for d in 0..self.rank() {
            let (start, step) = (self.start[d], self.step[d]);
            let block_end = (offset[d] + extent[d]).min(self.end[d]);
            let first = offset[d].max(start);
            // first selected index at or after `first`
            let mut k = (first - start).div_ceil(step);
            let mut pairs = Vec::new();
            loop {
                let idx = start + k * step;
                if idx >= block_end {
                    break;
                }
                pairs.push((idx - offset[d], k));
                k += 1;
            }
            if pairs.is_empty() {
                return None;
            }
            out.push(pairs);
        }
        Some(out)
    }
}

/// Row-major strides, in elements, of an array with shape `dims`.
pub fn strides(dims: &[u64]) -> Vec<u64> {
    let mut s = vec![1u64; dims.len()];
    for d in (0..dims.len().saturating_sub(1)).rev() {
        s[d] = s[d + 1] * dims[d + 1];
    }
    s
}

/// Copy the selected elements of one block into the output buffer.
///
/// `block` holds the block's elements in row-major order over `extent`;
/// `out` is the dense selection result with shape `out_shape`.
pub fn scatter(
    positions: &[Vec<(u64, u64)>],
    block: &[u8],
    extent: &[u64],
    out: &mut [u8],
    out_shape: &[u64],
    element_size: usize,
) {
    let src_strides = strides(extent);
    let dst_strides = strides(out_shape);
    let rank = positions.len();
    if rank == 0 {
        out[..element_size].copy_from_slice(&block[..element_size]);
        return;
    }

    let mut cursor = vec![0usize; rank];
    loop {
        let mut src = 0u64;
        let mut dst = 0u64;
        for d in 0..rank {
            let (local, o) = positions[d][cursor[d]];
            src += local * src_strides[d];
            dst += o * dst_strides[d];
        }
        let (src, dst) = (src as usize * element_size, dst as usize * element_size);
        out[dst..dst + element_size].copy_from_slice(&block[src..src + element_size]);

        // odometer increment, last dimension fastest
        let mut d = rank;
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            cursor[d] += 1;
            if cursor[d] < positions[d].len() {
                break;
            }
            cursor[d] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_and_bounds() {
        let s = Hyperslab::new(&[10, 7], &[1, 0], &[10, 7], Some(&[3, 2])).unwrap();
        assert_eq!(s.output_shape(), vec![3, 4]);
        assert_eq!(s.num_elements(), 12);
        assert_eq!(s.bounds(), (vec![1, 0], vec![8, 7]));

        let empty = Hyperslab::new(&[5], &[2], &[2], None).unwrap();
        assert_eq!(empty.num_elements(), 0);

        assert_eq!(Hyperslab::all(&[]).num_elements(), 1);
    }

    #[test]
    fn rejects_bad_selections() {
        assert!(Hyperslab::new(&[5], &[0], &[6], None).is_err());
        assert!(Hyperslab::new(&[5], &[3], &[2], None).is_err());
        assert!(Hyperslab::new(&[5], &[0], &[5], Some(&[0])).is_err());
        assert!(Hyperslab::new(&[5, 5], &[0], &[5], None).is_err());
    }

    #[test]
    fn block_positions_respect_step() {
        let s = Hyperslab::new(&[20], &[1], &[20], Some(&[4])).unwrap();
        // selected: 1 5 9 13 17
        assert_eq!(s.block_positions(&[4], &[8]), Some(vec![vec![(1, 1), (5, 2)]]));
        assert_eq!(s.block_positions(&[18], &[2]), None);
    }

    #[test]
    fn scatter_two_blocks() {
        // 4x4 dataset split into two 2x4 row blocks, select column 1..3 of all rows
        let data: Vec<u8> = (0..16).collect();
        let sel = Hyperslab::new(&[4, 4], &[0, 1], &[4, 3], None).unwrap();
        let shape = sel.output_shape();
        let mut out = vec![0u8; 8];
        for row in [0u64, 2] {
            let block = &data[(row * 4) as usize..(row * 4 + 8) as usize];
            let pos = sel.block_positions(&[row, 0], &[2, 4]).unwrap();
            scatter(&pos, block, &[2, 4], &mut out, &shape, 1);
        }
        assert_eq!(out, vec![1, 2, 5, 6, 9, 10, 13, 14]);
    }
}
