//! Product-quantized matrices.
//!
//! A quantized row is `nsubq` single-byte codes, each selecting one of 256
//! centroids of a sub-codebook. All sub-quantizers span `dsub` dimensions
//! except possibly the last, which covers the `lastdsub`-wide tail when
//! `dim` is not a multiple of `dsub`.

use std::io::Write;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::io::{BinRead, Writer};
use crate::mmapfile::MmapInput;

/// Codes are single bytes: 2^8 centroids per sub-quantizer.
pub const KSUB: usize = 256;

#[derive(Debug, Clone)]
pub struct ProductQuantizer {
    dim: usize,
    nsubq: usize,
    dsub: usize,
    lastdsub: usize,
    centroids: Vec<f32>,
}

impl ProductQuantizer {
    pub fn new(dim: usize, dsub: usize, centroids: Vec<f32>) -> ProductQuantizer {
        assert_eq!(centroids.len(), dim * KSUB);
        let mut nsubq = dim / dsub;
        let mut lastdsub = dim % dsub;
        if lastdsub == 0 {
            lastdsub = dsub;
        } else {
            nsubq += 1;
        }
        ProductQuantizer {
            dim,
            nsubq,
            dsub,
            lastdsub,
            centroids,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nsubq(&self) -> usize {
        self.nsubq
    }

    pub fn load<R: BinRead>(r: &mut R) -> Result<ProductQuantizer> {
        let dim = r.read_i32()?;
        let nsubq = r.read_i32()?;
        let dsub = r.read_i32()?;
        let lastdsub = r.read_i32()?;
        if dim < 0 || nsubq < 0 || dsub <= 0 || lastdsub <= 0 {
            return Err(Error::InvalidModel(format!(
                "bad quantizer geometry dim={dim} nsubq={nsubq} dsub={dsub} lastdsub={lastdsub}"
            )));
        }
        let mut centroids = vec![0.0f32; dim as usize * KSUB];
        r.read_f32_into(&mut centroids)?;
        Ok(ProductQuantizer {
            dim: dim as usize,
            nsubq: nsubq as usize,
            dsub: dsub as usize,
            lastdsub: lastdsub as usize,
            centroids,
        })
    }

    pub fn save<W: Write>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_i32(self.dim as i32)?;
        w.write_i32(self.nsubq as i32)?;
        w.write_i32(self.dsub as i32)?;
        w.write_i32(self.lastdsub as i32)?;
        w.write_f32_slice(&self.centroids)
    }

    /// Offset of centroid `i` of sub-quantizer `m` in the codebook array.
    pub fn centroid_base(&self, m: usize, i: usize) -> usize {
        if m == self.nsubq - 1 {
            m * KSUB * self.dsub + i * self.lastdsub
        } else {
            (m * KSUB + i) * self.dsub
        }
    }

    pub fn centroid(&self, position: usize) -> f32 {
        self.centroids[position]
    }

    /// Dot product of `x` with decoded row `t` of `codes`, scaled by `alpha`.
    /// `codes` is the full code array; pass a single row with `t = 0`.
    pub fn mul_code(&self, x: &[f32], codes: &[u8], t: usize, alpha: f32) -> f32 {
        let mut res = 0.0;
        let row_start = t * self.nsubq;
        for m in 0..self.nsubq {
            let d = if m == self.nsubq - 1 { self.lastdsub } else { self.dsub };
            let c = self.centroid_base(m, codes[row_start + m] as usize);
            for n in 0..d {
                res += x[m * self.dsub + n] * self.centroids[c + n];
            }
        }
        res * alpha
    }

    /// x += alpha * decoded row `t` of `codes`.
    pub fn add_code(&self, x: &mut [f32], codes: &[u8], t: usize, alpha: f32) {
        let row_start = t * self.nsubq;
        for m in 0..self.nsubq {
            let d = if m == self.nsubq - 1 { self.lastdsub } else { self.dsub };
            let c = self.centroid_base(m, codes[row_start + m] as usize);
            for n in 0..d {
                x[m * self.dsub + n] += alpha * self.centroids[c + n];
            }
        }
    }
}

/// In-memory quantized matrix: one code row per matrix row, plus an
/// optional one-dimensional quantizer for per-row norms.
#[derive(Debug, Clone)]
pub struct QMatrix {
    qnorm: bool,
    m: usize,
    n: usize,
    codes: Vec<u8>,
    pq: ProductQuantizer,
    norm_codes: Vec<u8>,
    npq: Option<ProductQuantizer>,
}

impl QMatrix {
    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    fn alpha(&self, t: usize) -> f32 {
        match &self.npq {
            Some(npq) => npq.centroid(npq.centroid_base(0, self.norm_codes[t] as usize)),
            None => 1.0,
        }
    }

    pub fn dot_row(&self, v: &[f32], i: usize) -> f32 {
        assert!(i < self.m);
        assert_eq!(v.len(), self.n);
        self.pq.mul_code(v, &self.codes, i, self.alpha(i))
    }

    pub fn add_row_to(&self, v: &mut [f32], t: usize) -> Result<()> {
        assert!(t < self.m);
        assert_eq!(v.len(), self.n);
        self.pq.add_code(v, &self.codes, t, self.alpha(t));
        Ok(())
    }

    pub fn load<R: BinRead>(r: &mut R) -> Result<QMatrix> {
        let qnorm = r.read_bool()?;
        let m = r.read_i64()? as usize;
        let n = r.read_i64()? as usize;
        let code_size = r.read_i32()?;
        if code_size < 0 {
            return Err(Error::InvalidModel(format!("negative code size {code_size}")));
        }
        let mut codes = vec![0u8; code_size as usize];
        r.read_bytes(&mut codes)?;
        let pq = ProductQuantizer::load(r)?;
        let mut norm_codes = Vec::new();
        let mut npq = None;
        if qnorm {
            norm_codes = vec![0u8; m];
            r.read_bytes(&mut norm_codes)?;
            npq = Some(ProductQuantizer::load(r)?);
        }
        Ok(QMatrix {
            qnorm,
            m,
            n,
            codes,
            pq,
            norm_codes,
            npq,
        })
    }

    /// Identical byte layout in the single-file and sidecar forms.
    pub fn save<W: Write>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_bool(self.qnorm)?;
        w.write_i64(self.m as i64)?;
        w.write_i64(self.n as i64)?;
        w.write_i32(self.codes.len() as i32)?;
        w.write_bytes(&self.codes)?;
        self.pq.save(w)?;
        if self.qnorm {
            w.write_bytes(&self.norm_codes)?;
            if let Some(npq) = &self.npq {
                npq.save(w)?;
            }
        }
        Ok(())
    }
}

/// Quantized matrix whose code arrays stay in a mapped file; the codebooks
/// themselves are small and live in memory, shared between cursor clones.
#[derive(Debug, Clone)]
pub struct MmapQMatrix {
    qnorm: bool,
    m: usize,
    n: usize,
    codes_offset: u64,
    norm_codes_offset: u64,
    pq: Arc<ProductQuantizer>,
    npq: Option<Arc<ProductQuantizer>>,
    input: MmapInput,
}

impl MmapQMatrix {
    pub fn load(mut input: MmapInput) -> Result<MmapQMatrix> {
        input.seek(0)?;
        let qnorm = input.read_bool()?;
        let m = input.read_i64()? as usize;
        let n = input.read_i64()? as usize;
        let code_size = input.read_i32()?;
        if code_size < 0 {
            return Err(Error::InvalidModel(format!("negative code size {code_size}")));
        }
        let codes_offset = input.position();
        input.skip(code_size as u64)?;
        let pq = Arc::new(ProductQuantizer::load(&mut input)?);
        let mut norm_codes_offset = 0;
        let mut npq = None;
        if qnorm {
            norm_codes_offset = input.position();
            input.skip(m as u64)?;
            npq = Some(Arc::new(ProductQuantizer::load(&mut input)?));
        }
        Ok(MmapQMatrix {
            qnorm,
            m,
            n,
            codes_offset,
            norm_codes_offset,
            pq,
            npq,
            input,
        })
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    fn code_row(&self, t: usize) -> Result<Vec<u8>> {
        let nsubq = self.pq.nsubq();
        let mut row = vec![0u8; nsubq];
        self.input.seek(self.codes_offset + (t * nsubq) as u64)?;
        self.input.read_bytes(&mut row)?;
        Ok(row)
    }

    fn alpha(&self, t: usize) -> Result<f32> {
        match &self.npq {
            Some(npq) => {
                self.input.seek(self.norm_codes_offset + t as u64)?;
                let code = self.input.read_u8()?;
                Ok(npq.centroid(npq.centroid_base(0, code as usize)))
            }
            None => Ok(1.0),
        }
    }

    pub fn dot_row(&self, v: &[f32], i: usize) -> Result<f32> {
        assert!(i < self.m);
        assert_eq!(v.len(), self.n);
        let alpha = self.alpha(i)?;
        Ok(self.pq.mul_code(v, &self.code_row(i)?, 0, alpha))
    }

    pub fn add_row_to(&self, v: &mut [f32], t: usize) -> Result<()> {
        assert!(t < self.m);
        assert_eq!(v.len(), self.n);
        let alpha = self.alpha(t)?;
        self.pq.add_code(v, &self.code_row(t)?, 0, alpha);
        Ok(())
    }

    pub fn close(&self) {
        self.input.close();
    }
}
