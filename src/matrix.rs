use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Dense row-major matrix of f64.
///
/// Piano-rolls, minibatches and per-time-step biases are all stored as one row per time step.
/// Bias vectors are stored as matrices with a single row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Matrix {
    nrows: usize,
    ncols: usize,
    items: Vec<f64>,
}

impl Matrix {
    pub fn replicate(item: f64, rows: usize, cols: usize) -> Self {
        Self {
            nrows: rows,
            ncols: cols,
            items: vec![item; rows * cols],
        }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::replicate(0.0, rows, cols)
    }

    pub fn from_vec(rows: usize, cols: usize, items: Vec<f64>) -> Self {
        assert_eq!(items.len(), rows * cols);
        Self {
            nrows: rows,
            ncols: cols,
            items,
        }
    }

    /// Builds a matrix out of equally long rows. An empty list gives a 0x`cols` matrix.
    pub fn from_rows(rows: &[Vec<f64>], cols: usize) -> Self {
        let mut items = Vec::with_capacity(rows.len() * cols);
        for row in rows.iter() {
            assert_eq!(row.len(), cols);
            items.extend_from_slice(row);
        }
        Self {
            nrows: rows.len(),
            ncols: cols,
            items,
        }
    }

    pub fn zero_like(&self) -> Self {
        Self::zeros(self.nrows, self.ncols)
    }

    pub fn rows(&self) -> usize {
        self.nrows
    }

    pub fn cols(&self) -> usize {
        self.ncols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    /// False if the item count does not match the shape. Only possible for deserialized data.
    pub fn is_consistent(&self) -> bool {
        self.nrows.checked_mul(self.ncols) == Some(self.items.len())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.items
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.items
    }

    #[inline]
    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.items[row * self.ncols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.items[row * self.ncols + col] = value;
    }

    #[inline]
    pub fn row(&self, row: usize) -> &[f64] {
        &self.items[row * self.ncols..(row + 1) * self.ncols]
    }

    #[inline]
    pub fn row_mut(&mut self, row: usize) -> &mut [f64] {
        &mut self.items[row * self.ncols..(row + 1) * self.ncols]
    }

    /// Copies rows `start..end` (end is clamped to the number of rows).
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.nrows);
        assert!(start <= end);
        Self {
            nrows: end - start,
            ncols: self.ncols,
            items: self.items[start * self.ncols..end * self.ncols].to_vec(),
        }
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        (0..self.nrows).map(|r| self.row(r).to_vec()).collect()
    }

    /// out = x·M (x has `rows` entries, out has `cols` entries).
    pub fn left_multiply(&self, x: &[f64], out: &mut [f64]) {
        assert_eq!(x.len(), self.nrows);
        assert_eq!(out.len(), self.ncols);
        for o in out.iter_mut() {
            *o = 0.0;
        }
        for (row_idx, xv) in x.iter().enumerate() {
            let xv = *xv;
            if xv == 0.0 {
                continue;
            }
            let row = self.row(row_idx);
            for col_idx in 0..self.ncols {
                out[col_idx] += xv * row[col_idx];
            }
        }
    }

    /// out = y·Mᵀ (y has `cols` entries, out has `rows` entries).
    pub fn left_multiply_transposed(&self, y: &[f64], out: &mut [f64]) {
        assert_eq!(y.len(), self.ncols);
        assert_eq!(out.len(), self.nrows);
        for row_idx in 0..self.nrows {
            let row = self.row(row_idx);
            let mut accum: f64 = 0.0;
            for col_idx in 0..self.ncols {
                accum += row[col_idx] * y[col_idx];
            }
            out[row_idx] = accum;
        }
    }

    /// M += scale * (a ⊗ b), a has `rows` entries and b has `cols` entries.
    pub fn add_outer(&mut self, a: &[f64], b: &[f64], scale: f64) {
        assert_eq!(a.len(), self.nrows);
        assert_eq!(b.len(), self.ncols);
        self.items
            .par_chunks_mut(self.ncols.max(1))
            .zip(a.par_iter())
            .for_each(|(row, av)| {
                let s = av * scale;
                if s == 0.0 {
                    return;
                }
                for (r, bv) in row.iter_mut().zip(b.iter()) {
                    *r += s * bv;
                }
            });
    }

    /// self += scale * other
    pub fn add_scaled(&mut self, other: &Matrix, scale: f64) {
        assert_eq!(self.shape(), other.shape());
        for (s, o) in self.items.iter_mut().zip(other.items.iter()) {
            *s += scale * o;
        }
    }

    /// Adds `scale * values` to one row.
    pub fn add_to_row(&mut self, row: usize, values: &[f64], scale: f64) {
        let r = self.row_mut(row);
        assert_eq!(r.len(), values.len());
        for (rv, v) in r.iter_mut().zip(values.iter()) {
            *rv += scale * v;
        }
    }

    pub fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(f64) -> f64,
    {
        for v in self.items.iter_mut() {
            *v = f(*v);
        }
    }
}

#[cfg(test)]
use quickcheck::{Arbitrary, Gen};

#[cfg(test)]
impl Arbitrary for Matrix {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        let rows = std::cmp::max(1, usize::arbitrary(g) % 8);
        let cols = std::cmp::max(1, usize::arbitrary(g) % 8);
        let mut m = Matrix::zeros(rows, cols);
        for v in m.items.iter_mut() {
            *v = (i16::arbitrary(g) as f64) / 1000.0;
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> Matrix {
        // 2x3
        Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
    }

    #[test]
    fn left_multiply_works() {
        let m = small();
        let mut out = vec![0.0; 3];
        m.left_multiply(&[1.0, -1.0], &mut out);
        assert_eq!(out, vec![-3.0, -3.0, -3.0]);
    }

    #[test]
    fn left_multiply_transposed_works() {
        let m = small();
        let mut out = vec![0.0; 2];
        m.left_multiply_transposed(&[1.0, 0.0, 2.0], &mut out);
        assert_eq!(out, vec![7.0, 16.0]);
    }

    #[test]
    fn add_outer_works() {
        let mut m = Matrix::zeros(2, 2);
        m.add_outer(&[1.0, 2.0], &[3.0, 4.0], 0.5);
        assert_eq!(m.as_slice(), &[1.5, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn slice_rows_clamps_end() {
        let m = small();
        let s = m.slice_rows(1, 100);
        assert_eq!(s.shape(), (1, 3));
        assert_eq!(s.row(0), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn truncated_items_are_inconsistent() {
        assert!(small().is_consistent());
        let m: Matrix =
            serde_json::from_str(r#"{"nrows":2,"ncols":3,"items":[1.0,2.0,3.0,4.0,5.0]}"#).unwrap();
        assert!(!m.is_consistent());
    }

    quickcheck! {
        fn transposed_product_is_consistent(m: Matrix) -> bool {
            // (x·M)·y == x·(y·Mᵀ) for x = ones, y = ones
            let x = vec![1.0; m.rows()];
            let y = vec![1.0; m.cols()];
            let mut xm = vec![0.0; m.cols()];
            let mut ym = vec![0.0; m.rows()];
            m.left_multiply(&x, &mut xm);
            m.left_multiply_transposed(&y, &mut ym);
            let a: f64 = xm.iter().sum();
            let b: f64 = ym.iter().sum();
            (a - b).abs() < 1e-9
        }
    }
}
