//! Builders that assemble syntactically valid model files byte by byte,
//! so tests exercise the real load path instead of internal constructors.
#![allow(dead_code)]

use fasttext_predict::io::Writer;
use fasttext_predict::FASTTEXT_FILEFORMAT_MAGIC;

pub struct TinyArgs {
    pub dim: i32,
    pub word_ngrams: i32,
    pub loss: i32,
    pub model: i32,
    pub bucket: i32,
    pub minn: i32,
    pub maxn: i32,
    pub t: f64,
}

impl TinyArgs {
    pub fn supervised_softmax(dim: i32) -> TinyArgs {
        TinyArgs {
            dim,
            word_ngrams: 1,
            loss: 3,
            model: 3,
            bucket: 64,
            minn: 0,
            maxn: 0,
            t: 1e-4,
        }
    }

    pub fn skipgram_softmax(dim: i32) -> TinyArgs {
        TinyArgs {
            dim,
            word_ngrams: 1,
            loss: 3,
            model: 2,
            bucket: 64,
            minn: 0,
            maxn: 0,
            t: 1e-4,
        }
    }
}

pub struct TinyModel {
    pub version: i32,
    pub args: TinyArgs,
    /// (word, count, entry type byte)
    pub entries: Vec<(String, i64, u8)>,
    pub n_words: usize,
    pub n_tokens: i64,
    /// Dense input matrix (rows, cols, data).
    pub input: (usize, usize, Vec<f32>),
    /// Dense output matrix (rows, cols, data).
    pub output: (usize, usize, Vec<f32>),
}

impl TinyModel {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new(Vec::new());
        w.write_i32(FASTTEXT_FILEFORMAT_MAGIC).unwrap();
        w.write_i32(self.version).unwrap();

        // args: twelve ints then the sampling threshold
        w.write_i32(self.args.dim).unwrap();
        w.write_i32(5).unwrap(); // ws
        w.write_i32(5).unwrap(); // epoch
        w.write_i32(1).unwrap(); // min_count
        w.write_i32(5).unwrap(); // neg
        w.write_i32(self.args.word_ngrams).unwrap();
        w.write_i32(self.args.loss).unwrap();
        w.write_i32(self.args.model).unwrap();
        w.write_i32(self.args.bucket).unwrap();
        w.write_i32(self.args.minn).unwrap();
        w.write_i32(self.args.maxn).unwrap();
        w.write_i32(100).unwrap(); // lr_update_rate
        w.write_f64(self.args.t).unwrap();

        // dictionary
        w.write_i32(self.entries.len() as i32).unwrap();
        w.write_i32(self.n_words as i32).unwrap();
        w.write_i32((self.entries.len() - self.n_words) as i32).unwrap();
        w.write_i64(self.n_tokens).unwrap();
        w.write_i64(-1).unwrap(); // no pruning section
        for (word, count, entry_type) in &self.entries {
            w.write_cstr(word).unwrap();
            w.write_i64(*count).unwrap();
            w.write_u8(*entry_type).unwrap();
        }

        // dense input matrix
        w.write_u8(0).unwrap(); // quant flag
        let (m, n, data) = &self.input;
        assert_eq!(data.len(), m * n);
        w.write_i64(*m as i64).unwrap();
        w.write_i64(*n as i64).unwrap();
        w.write_f32_slice(data).unwrap();

        // dense output matrix
        w.write_u8(0).unwrap(); // qout flag
        let (m, n, data) = &self.output;
        assert_eq!(data.len(), m * n);
        w.write_i64(*m as i64).unwrap();
        w.write_i64(*n as i64).unwrap();
        w.write_f32_slice(data).unwrap();

        w.into_inner()
    }
}

pub const WORD: u8 = 0;
pub const LABEL: u8 = 1;

/// Two words, two labels, dense softmax classifier.
pub fn pet_classifier() -> TinyModel {
    TinyModel {
        version: 12,
        args: TinyArgs::supervised_softmax(4),
        entries: vec![
            ("cat".to_string(), 5, WORD),
            ("dog".to_string(), 7, WORD),
            ("__label__a".to_string(), 3, LABEL),
            ("__label__b".to_string(), 4, LABEL),
        ],
        n_words: 2,
        n_tokens: 19,
        input: (
            5,
            4,
            vec![
                1.0, 0.0, 0.0, 0.0, // cat
                0.0, 1.0, 0.0, 0.0, // dog
                0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 0.0, //
            ],
        ),
        output: (
            2,
            4,
            vec![
                1.0, 1.0, 0.0, 0.0, // __label__a
                -1.0, -1.0, 0.0, 0.0, // __label__b
            ],
        ),
    }
}
