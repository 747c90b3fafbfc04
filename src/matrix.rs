//! Dense row-major matrix plus the storage dispatch used at query time.

use std::io::Write;
use std::sync::Arc;

use crate::error::Result;
use crate::io::{BinRead, Writer};
use crate::mmapfile::MmapInput;
use crate::quant::{MmapQMatrix, QMatrix};
use crate::Rng;

/// Row-major `m x n` matrix of f32.
#[derive(Debug, Clone)]
pub struct Matrix {
    m: usize,
    n: usize,
    data: Vec<f32>,
}

impl Matrix {
    pub fn new(m: usize, n: usize) -> Matrix {
        Matrix {
            m,
            n,
            data: vec![0.0; m * n],
        }
    }

    pub(crate) fn from_parts(m: usize, n: usize, data: Vec<f32>) -> Matrix {
        assert_eq!(data.len(), m * n);
        Matrix { m, n, data }
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn zero(&mut self) {
        self.data.fill(0.0);
    }

    /// Fill with uniform values in `-a..a` from a fresh generator seeded at 1.
    pub fn uniform(&mut self, a: f32) {
        let mut rng = Rng(1);
        for v in &mut self.data {
            *v = rng.rand_real() * 2.0 * a - a;
        }
    }

    pub fn at(&self, i: usize, j: usize) -> f32 {
        assert!(i < self.m && j < self.n);
        self.data[i * self.n + j]
    }

    pub fn at_row(&self, i: usize) -> &[f32] {
        assert!(i < self.m);
        &self.data[i * self.n..(i + 1) * self.n]
    }

    pub fn dot_row(&self, v: &[f32], i: usize) -> f32 {
        assert!(i < self.m);
        assert_eq!(v.len(), self.n);
        crate::dot(self.at_row(i), v)
    }

    /// row_i += a * v
    pub fn add_row(&mut self, v: &[f32], i: usize, a: f32) {
        assert!(i < self.m);
        assert_eq!(v.len(), self.n);
        let row = &mut self.data[i * self.n..(i + 1) * self.n];
        for (r, x) in row.iter_mut().zip(v) {
            *r += a * x;
        }
    }

    /// v += a * row_i
    pub fn add_row_to(&self, v: &mut [f32], i: usize, a: f32) {
        assert!(i < self.m);
        assert_eq!(v.len(), self.n);
        for (x, r) in v.iter_mut().zip(self.at_row(i)) {
            *x += a * r;
        }
    }

    /// Scale rows in `ib..ie` by the matching entries of `nums`.
    pub fn multiply_row(&mut self, nums: &[f32], ib: usize, ie: usize) {
        assert!(ie <= self.m && ib <= ie);
        assert!(ie - ib <= nums.len());
        for i in ib..ie {
            let num = nums[i - ib];
            for j in 0..self.n {
                self.data[i * self.n + j] *= num;
            }
        }
    }

    /// Divide rows in `ib..ie` by the matching entries of `denoms`.
    /// Rows whose denominator is zero are left untouched.
    pub fn divide_row(&mut self, denoms: &[f32], ib: usize, ie: usize) {
        assert!(ie <= self.m && ib <= ie);
        assert!(ie - ib <= denoms.len());
        for i in ib..ie {
            let denom = denoms[i - ib];
            if denom != 0.0 {
                for j in 0..self.n {
                    self.data[i * self.n + j] /= denom;
                }
            }
        }
    }

    pub fn l2_norm_row(&self, i: usize) -> f32 {
        crate::norm(self.at_row(i))
    }

    /// Norm of every row, written into `norms`.
    pub fn l2_norm_rows(&self, norms: &mut [f32]) {
        assert_eq!(norms.len(), self.m);
        for (i, norm) in norms.iter_mut().enumerate() {
            *norm = self.l2_norm_row(i);
        }
    }

    pub fn load<R: BinRead>(r: &mut R) -> Result<Matrix> {
        let m = r.read_i64()?;
        let n = r.read_i64()?;
        if m < 0 || n < 0 {
            return Err(crate::Error::InvalidModel(format!(
                "negative matrix dimensions {m}x{n}"
            )));
        }
        let (m, n) = (m as usize, n as usize);
        let mut data = vec![0.0f32; m * n];
        r.read_f32_into(&mut data)?;
        Ok(Matrix { m, n, data })
    }

    /// Identical byte layout in the single-file and sidecar forms:
    /// `m: i64, n: i64, m*n f32`.
    pub fn save<W: Write>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_i64(self.m as i64)?;
        w.write_i64(self.n as i64)?;
        w.write_f32_slice(&self.data)
    }
}

/// Dense matrix backed by a mapped file. Element `(i, j)` lives at byte
/// offset `16 + (i*n + j)*4`, after the two i64 dimension fields.
#[derive(Debug, Clone)]
pub struct MmapMatrix {
    m: usize,
    n: usize,
    input: MmapInput,
}

impl MmapMatrix {
    pub fn load(input: MmapInput) -> Result<MmapMatrix> {
        input.seek(0)?;
        let m = input.read_i64()? as usize;
        let n = input.read_i64()? as usize;
        Ok(MmapMatrix { m, n, input })
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    fn row_offset(&self, i: usize) -> u64 {
        16 + (i as u64 * self.n as u64) * 4
    }

    pub fn at(&self, i: usize, j: usize) -> Result<f32> {
        assert!(i < self.m && j < self.n);
        self.input.seek(self.row_offset(i) + j as u64 * 4)?;
        self.input.read_f32()
    }

    pub fn at_row(&self, i: usize) -> Result<Vec<f32>> {
        assert!(i < self.m);
        let mut row = vec![0.0f32; self.n];
        self.input.seek(self.row_offset(i))?;
        self.input
            .read_bytes(bytemuck::cast_slice_mut::<f32, u8>(&mut row))?;
        Ok(row)
    }

    pub fn dot_row(&self, v: &[f32], i: usize) -> Result<f32> {
        assert_eq!(v.len(), self.n);
        Ok(crate::dot(&self.at_row(i)?, v))
    }

    pub fn add_row_to(&self, v: &mut [f32], i: usize, a: f32) -> Result<()> {
        assert_eq!(v.len(), self.n);
        for (x, r) in v.iter_mut().zip(self.at_row(i)?) {
            *x += a * r;
        }
        Ok(())
    }

    pub fn l2_norm_row(&self, i: usize) -> Result<f32> {
        Ok(crate::norm(&self.at_row(i)?))
    }

    pub fn close(&self) {
        self.input.close();
    }
}

/// The input embedding in whichever of its four stored forms.
#[derive(Debug, Clone)]
pub enum InputMatrix {
    Dense(Arc<Matrix>),
    Quant(Arc<QMatrix>),
    MmapDense(MmapMatrix),
    MmapQuant(MmapQMatrix),
}

impl InputMatrix {
    /// v += row_t (scaled by the stored norm for quantized forms).
    pub fn add_row_to(&self, v: &mut [f32], t: usize) -> Result<()> {
        match self {
            InputMatrix::Dense(m) => {
                m.add_row_to(v, t, 1.0);
                Ok(())
            }
            InputMatrix::Quant(q) => q.add_row_to(v, t),
            InputMatrix::MmapDense(m) => m.add_row_to(v, t, 1.0),
            InputMatrix::MmapQuant(q) => q.add_row_to(v, t),
        }
    }

    pub fn n(&self) -> usize {
        match self {
            InputMatrix::Dense(m) => m.n(),
            InputMatrix::Quant(q) => q.n(),
            InputMatrix::MmapDense(m) => m.n(),
            InputMatrix::MmapQuant(q) => q.n(),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, InputMatrix::Quant(_) | InputMatrix::MmapQuant(_))
    }

    /// Same data, independent cursors.
    pub fn clone_handle(&self) -> InputMatrix {
        self.clone()
    }

    pub fn close(&self) {
        match self {
            InputMatrix::Dense(_) | InputMatrix::Quant(_) => {}
            InputMatrix::MmapDense(m) => m.close(),
            InputMatrix::MmapQuant(q) => q.close(),
        }
    }
}

/// The output layer: dense, or product-quantized when the classifier was
/// quantized with `qout`. Always resident in memory.
#[derive(Debug, Clone)]
pub enum OutputMatrix {
    Dense(Arc<Matrix>),
    Quant(Arc<QMatrix>),
}

impl OutputMatrix {
    pub fn dot_row(&self, v: &[f32], i: usize) -> f32 {
        match self {
            OutputMatrix::Dense(m) => m.dot_row(v, i),
            OutputMatrix::Quant(q) => q.dot_row(v, i),
        }
    }

    pub fn m(&self) -> usize {
        match self {
            OutputMatrix::Dense(m) => m.m(),
            OutputMatrix::Quant(q) => q.m(),
        }
    }
}
