//! Dense row-major matrices for the multiply kernel.

use crate::error::{FlotillaError, Result};
use crate::protocol::{NumericArray, Payload};

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(FlotillaError::InvalidShape(format!(
                "{} values cannot fill a {rows}x{cols} matrix",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let nrows = rows.len();
        let ncols = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != ncols) {
            return Err(FlotillaError::InvalidShape("ragged rows".into()));
        }
        Ok(Self {
            rows: nrows,
            cols: ncols,
            data: rows.into_iter().flatten().collect(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    pub fn set(&mut self, r: usize, c: usize, value: f64) {
        self.data[r * self.cols + c] = value;
    }

    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Copy out the half-open row range `[r0, r1)` as a strip.
    pub fn row_strip(&self, r0: usize, r1: usize) -> Matrix {
        Matrix {
            rows: r1 - r0,
            cols: self.cols,
            data: self.data[r0 * self.cols..r1 * self.cols].to_vec(),
        }
    }

    /// Copy out the half-open column range `[c0, c1)` as a strip.
    pub fn col_strip(&self, c0: usize, c1: usize) -> Matrix {
        let width = c1 - c0;
        let mut data = Vec::with_capacity(self.rows * width);
        for r in 0..self.rows {
            data.extend_from_slice(&self.row(r)[c0..c1]);
        }
        Matrix {
            rows: self.rows,
            cols: width,
            data,
        }
    }

    /// Write `block` into this matrix with its top-left corner at
    /// `(r0, c0)`.
    pub fn paste(&mut self, r0: usize, c0: usize, block: &Matrix) {
        for r in 0..block.rows {
            let dst = (r0 + r) * self.cols + c0;
            self.data[dst..dst + block.cols].copy_from_slice(block.row(r));
        }
    }

    /// Dense product; `InvalidShape` when the inner dimensions disagree.
    pub fn multiply(&self, rhs: &Matrix) -> Result<Matrix> {
        if self.cols != rhs.rows {
            return Err(FlotillaError::InvalidShape(format!(
                "cannot multiply {}x{} by {}x{}",
                self.rows, self.cols, rhs.rows, rhs.cols
            )));
        }
        let mut out = Matrix::zeros(self.rows, rhs.cols);
        // i-k-j order keeps the inner loop walking contiguous memory.
        for i in 0..self.rows {
            for k in 0..self.cols {
                let a = self.get(i, k);
                if a == 0.0 {
                    continue;
                }
                let rhs_row = rhs.row(k);
                let out_row = &mut out.data[i * out.cols..(i + 1) * out.cols];
                for (o, b) in out_row.iter_mut().zip(rhs_row) {
                    *o += a * b;
                }
            }
        }
        Ok(out)
    }

    pub fn to_payload(&self) -> Payload {
        Payload::Array(NumericArray::from_f64(
            vec![self.rows, self.cols],
            &self.data,
        ))
    }

    pub fn from_payload(payload: &Payload) -> Result<Matrix> {
        let array = payload.as_array()?;
        if array.shape.len() != 2 {
            return Err(FlotillaError::InvalidShape(format!(
                "expected a 2-D array, got shape {:?}",
                array.shape
            )));
        }
        Matrix::from_vec(array.shape[0], array.shape[1], array.to_f64()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiply_matches_hand_computation() {
        let a = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let b = Matrix::from_rows(vec![vec![5.0, 6.0], vec![7.0, 8.0]]).unwrap();
        let c = a.multiply(&b).unwrap();
        assert_eq!(c, Matrix::from_rows(vec![vec![19.0, 22.0], vec![43.0, 50.0]]).unwrap());
    }

    #[test]
    fn multiply_rejects_bad_dims() {
        let a = Matrix::zeros(2, 3);
        let b = Matrix::zeros(2, 2);
        assert!(matches!(
            a.multiply(&b),
            Err(FlotillaError::InvalidShape(_))
        ));
    }

    #[test]
    fn empty_dimensions_multiply_cleanly() {
        let a = Matrix::zeros(0, 4);
        let b = Matrix::zeros(4, 3);
        let c = a.multiply(&b).unwrap();
        assert_eq!(c.rows(), 0);
        assert_eq!(c.cols(), 3);

        let a = Matrix::zeros(2, 0);
        let b = Matrix::zeros(0, 2);
        let c = a.multiply(&b).unwrap();
        assert_eq!(c, Matrix::zeros(2, 2));
    }

    #[test]
    fn strips_and_paste_round_trip() {
        let m = Matrix::from_rows(vec![
            vec![1.0, 2.0, 3.0],
            vec![4.0, 5.0, 6.0],
            vec![7.0, 8.0, 9.0],
        ])
        .unwrap();
        let top = m.row_strip(0, 2);
        assert_eq!(top.rows(), 2);
        assert_eq!(top.get(1, 2), 6.0);

        let right = m.col_strip(2, 3);
        assert_eq!(right.cols(), 1);
        assert_eq!(right.get(2, 0), 9.0);

        let mut out = Matrix::zeros(3, 3);
        out.paste(0, 0, &m.row_strip(0, 3));
        assert_eq!(out, m);
    }

    #[test]
    fn payload_round_trip() {
        let m = Matrix::from_rows(vec![vec![1.5, -2.0], vec![0.0, 4.25]]).unwrap();
        let back = Matrix::from_payload(&m.to_payload()).unwrap();
        assert_eq!(back, m);
    }
}
