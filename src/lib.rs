//! Read-only predictor for fastText binary models.
//!
//! Loads models produced by the fastText trainer (format versions 11 and
//! 12) and answers label predictions, word/sentence vector lookups and
//! nearest-neighbour / analogy queries. Training is out of scope; use the
//! trainer itself for that.
//!
//! Two loading modes share one query surface: the in-memory form reads the
//! whole model onto the heap, while the memory-mapped form (produced by
//! [`FastText::save_as_memory_mapped_model`]) keeps the dictionary and the
//! input matrix in mapped files and pages them in on demand.

pub mod args;
pub mod dictionary;
mod error;
mod fasttext;
pub mod io;
pub mod matrix;
pub mod mmapfile;
pub mod model;
pub mod quant;

pub use crate::error::{Error, Result};
pub use crate::fasttext::{
    FastText, Neighbor, Prediction, FASTTEXT_FILEFORMAT_MAGIC, FASTTEXT_VERSION,
};

pub fn norm(v: &[f32]) -> f32 {
    v.iter().copied().map(|e| e * e).sum::<f32>().sqrt()
}

pub fn normalize(v: &mut [f32]) {
    let len = norm(v);
    if len > 0.0 {
        for e in v {
            *e /= len;
        }
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&a, &b)| a * b).sum()
}

/// The trainer's linear-congruential generator. Kept local instead of
/// pulling in a random-number crate so every derived table is reproducible
/// from its seed.
pub struct Rng(pub u64);

impl Rng {
    pub fn rand_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(25214903917).wrapping_add(11);
        self.0
    }

    /// Get a uniformly distributed random number in `0.0 .. 1.0`.
    pub fn rand_real(&mut self) -> f32 {
        (self.rand_u64() & 0xFFFF) as f32 / 65536.0
    }
}
