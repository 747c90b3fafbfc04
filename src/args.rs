//! Hyperparameters of an already-trained model.

use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::io::{BinRead, Reader, Writer};

/// Loss the model was trained with. At predict time negative sampling
/// behaves like plain softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loss {
    HierarchicalSoftmax = 1,
    NegativeSampling = 2,
    Softmax = 3,
}

impl Loss {
    pub fn from_i32(value: i32) -> Result<Loss> {
        match value {
            1 => Ok(Loss::HierarchicalSoftmax),
            2 => Ok(Loss::NegativeSampling),
            3 => Ok(Loss::Softmax),
            _ => Err(Error::InvalidModel(format!("unknown loss value {value}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Cbow = 1,
    SkipGram = 2,
    Supervised = 3,
}

impl ModelKind {
    pub fn from_i32(value: i32) -> Result<ModelKind> {
        match value {
            1 => Ok(ModelKind::Cbow),
            2 => Ok(ModelKind::SkipGram),
            3 => Ok(ModelKind::Supervised),
            _ => Err(Error::InvalidModel(format!("unknown model value {value}"))),
        }
    }
}

/// Configuration read from a model file. Immutable once loaded apart from
/// the version-11 compatibility fixups applied right after.
#[derive(Debug, Clone)]
pub struct Args {
    pub dim: i32,
    pub ws: i32,
    pub epoch: i32,
    pub min_count: i32,
    pub neg: i32,
    pub word_ngrams: i32,
    pub loss: Loss,
    pub model: ModelKind,
    pub bucket: i32,
    pub minn: i32,
    pub maxn: i32,
    pub lr_update_rate: i32,
    /// Sub-sampling threshold.
    pub t: f64,

    // Runtime-only fields, never serialized.
    pub label: String,
    pub qout: bool,
    pub use_max_vocabulary_size: bool,
}

pub const DEFAULT_LABEL_PREFIX: &str = "__label__";

impl Args {
    pub fn load<R: Read>(r: &mut Reader<R>) -> Result<Args> {
        let dim = r.read_i32()?;
        let ws = r.read_i32()?;
        let epoch = r.read_i32()?;
        let min_count = r.read_i32()?;
        let neg = r.read_i32()?;
        let word_ngrams = r.read_i32()?;
        let loss = Loss::from_i32(r.read_i32()?)?;
        let model = ModelKind::from_i32(r.read_i32()?)?;
        let bucket = r.read_i32()?;
        let minn = r.read_i32()?;
        let maxn = r.read_i32()?;
        let lr_update_rate = r.read_i32()?;
        let t = r.read_f64()?;
        Ok(Args {
            dim,
            ws,
            epoch,
            min_count,
            neg,
            word_ngrams,
            loss,
            model,
            bucket,
            minn,
            maxn,
            lr_update_rate,
            t,
            label: DEFAULT_LABEL_PREFIX.to_string(),
            qout: false,
            use_max_vocabulary_size: false,
        })
    }

    pub fn save<W: Write>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_i32(self.dim)?;
        w.write_i32(self.ws)?;
        w.write_i32(self.epoch)?;
        w.write_i32(self.min_count)?;
        w.write_i32(self.neg)?;
        w.write_i32(self.word_ngrams)?;
        w.write_i32(self.loss as i32)?;
        w.write_i32(self.model as i32)?;
        w.write_i32(self.bucket)?;
        w.write_i32(self.minn)?;
        w.write_i32(self.maxn)?;
        w.write_i32(self.lr_update_rate)?;
        w.write_f64(self.t)
    }

    /// Version-11 models predate character n-grams for supervised models
    /// and sized their word hash table at the fixed maximum.
    pub fn apply_version_compat(&mut self, version: i32) {
        if version == 11 {
            if self.model == ModelKind::Supervised {
                self.maxn = 0;
            }
            self.use_max_vocabulary_size = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_args() -> Args {
        Args {
            dim: 100,
            ws: 5,
            epoch: 5,
            min_count: 1,
            neg: 5,
            word_ngrams: 2,
            loss: Loss::Softmax,
            model: ModelKind::Supervised,
            bucket: 2_000_000,
            minn: 3,
            maxn: 6,
            lr_update_rate: 100,
            t: 1e-4,
            label: DEFAULT_LABEL_PREFIX.to_string(),
            qout: false,
            use_max_vocabulary_size: false,
        }
    }

    #[test]
    fn round_trips_as_twelve_ints_and_a_double() {
        let args = sample_args();
        let mut w = Writer::new(Vec::new());
        args.save(&mut w).unwrap();
        assert_eq!(w.bytes_written(), 12 * 4 + 8);

        let buf = w.into_inner();
        let loaded = Args::load(&mut Reader::new(&buf[..])).unwrap();
        assert_eq!(loaded.dim, 100);
        assert_eq!(loaded.word_ngrams, 2);
        assert_eq!(loaded.loss, Loss::Softmax);
        assert_eq!(loaded.model, ModelKind::Supervised);
        assert_eq!(loaded.maxn, 6);
        assert_eq!(loaded.t, 1e-4);
    }

    #[test]
    fn version_eleven_supervised_disables_subwords() {
        let mut args = sample_args();
        args.apply_version_compat(11);
        assert_eq!(args.maxn, 0);
        assert!(args.use_max_vocabulary_size);

        let mut args = sample_args();
        args.model = ModelKind::SkipGram;
        args.apply_version_compat(11);
        assert_eq!(args.maxn, 6);
        assert!(args.use_max_vocabulary_size);

        let mut args = sample_args();
        args.apply_version_compat(12);
        assert_eq!(args.maxn, 6);
        assert!(!args.use_max_vocabulary_size);
    }

    #[test]
    fn unknown_enum_bytes_are_rejected() {
        let mut args = sample_args();
        args.loss = Loss::HierarchicalSoftmax;
        let mut w = Writer::new(Vec::new());
        args.save(&mut w).unwrap();
        let mut buf = w.into_inner();
        buf[6 * 4] = 9; // loss field
        assert!(matches!(
            Args::load(&mut Reader::new(&buf[..])),
            Err(Error::InvalidModel(_))
        ));
    }
}
