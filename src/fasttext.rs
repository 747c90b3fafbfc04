//! The predictor handle: loading, saving, and the public query surface.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use log::{debug, info};
use ordered_float::OrderedFloat;

use crate::args::{Args, ModelKind};
use crate::dictionary::{Dictionary, EntryType, MemDictionary, MmapDictionary};
use crate::error::{Error, Result};
use crate::io::{BinRead, Reader, Writer};
use crate::matrix::{InputMatrix, Matrix, MmapMatrix, OutputMatrix};
use crate::mmapfile::MmapFile;
use crate::model::Model;
use crate::quant::{MmapQMatrix, QMatrix};

pub const FASTTEXT_VERSION: i32 = 12;
pub const FASTTEXT_FILEFORMAT_MAGIC: i32 = 793_712_314;

/// One predicted label with its log-probability.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub log_prob: f32,
}

impl Prediction {
    pub fn prob(&self) -> f32 {
        self.log_prob.exp()
    }
}

/// One nearest-neighbour result.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub word: String,
    pub similarity: f32,
}

/// A loaded model. Handles are single-threaded: prediction reuses scratch
/// buffers and the memory-mapped variant moves file cursors. For
/// concurrent use, give each thread its own [`FastText::clone_handle`];
/// clones share the big read-only arrays and mappings.
pub struct FastText {
    args: Args,
    version: i32,
    quant: bool,
    mmap: bool,
    dict: Box<dyn Dictionary>,
    input: InputMatrix,
    output: OutputMatrix,
    model: Model,
    word_vectors: Arc<OnceLock<Matrix>>,
}

fn check_model_header<R: BinRead>(r: &mut R) -> Result<i32> {
    let magic = r.read_i32()?;
    if magic != FASTTEXT_FILEFORMAT_MAGIC {
        return Err(Error::InvalidModel("unhandled file format".to_string()));
    }
    let version = r.read_i32()?;
    if version > FASTTEXT_VERSION {
        return Err(Error::InvalidModel(format!(
            "input model version ({version}) is newer than the supported version ({FASTTEXT_VERSION})"
        )));
    }
    if version < 11 {
        return Err(Error::InvalidModel(format!(
            "input model version ({version}) is too old"
        )));
    }
    Ok(version)
}

impl FastText {
    /// Load a model. A regular file is read fully into memory; a directory
    /// is opened as the converted memory-mapped layout.
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<FastText> {
        let path = path.as_ref();
        if path.is_dir() {
            info!("loading memory-mapped model from {path:?}");
            Self::load_mmap_model(path)
        } else {
            info!("loading in-memory model from {path:?}");
            let file = File::open(path)?;
            Self::load_model_from_reader(&mut Reader::new(BufReader::new(file)))
        }
    }

    /// Load the single-file binary format from any reader.
    pub fn load_model_from_reader<R: Read>(r: &mut Reader<R>) -> Result<FastText> {
        let start = Instant::now();
        let version = check_model_header(r)?;
        let mut args = Args::load(r)?;
        args.apply_version_compat(version);

        debug!("loading dictionary");
        let dict = MemDictionary::load(args.clone(), r)?;

        let quant = r.read_bool()?;
        let input = if quant {
            debug!("model is quantized, loading quantized input matrix");
            InputMatrix::Quant(Arc::new(QMatrix::load(r)?))
        } else {
            debug!("loading input matrix");
            InputMatrix::Dense(Arc::new(Matrix::load(r)?))
        };
        if !quant && dict.prune_idx_size() >= 0 {
            return Err(Error::InvalidModel(
                "pruned dictionary without quantized input; please download an updated model"
                    .to_string(),
            ));
        }

        let qout = r.read_bool()?;
        args.qout = qout;
        let output = if quant && qout {
            debug!("classifier is quantized, loading quantized output matrix");
            OutputMatrix::Quant(Arc::new(QMatrix::load(r)?))
        } else {
            debug!("loading output matrix");
            OutputMatrix::Dense(Arc::new(Matrix::load(r)?))
        };

        let model = Self::build_model(&args, &dict, &output)?;
        info!("model loaded in {:.3}s", start.elapsed().as_secs_f64());
        Ok(FastText {
            args,
            version,
            quant,
            mmap: false,
            dict: Box::new(dict),
            input,
            output,
            model,
            word_vectors: Arc::new(OnceLock::new()),
        })
    }

    fn load_mmap_model(dir: &Path) -> Result<FastText> {
        let start = Instant::now();
        let model_path = [dir.join("model.bin"), dir.join("model.ftz")]
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no model.bin or model.ftz under {dir:?}"))
            })?;
        let mut r = Reader::new(BufReader::new(File::open(model_path)?));
        let version = check_model_header(&mut r)?;
        let mut args = Args::load(&mut r)?;
        args.apply_version_compat(version);

        debug!("loading memory-mapped dictionary");
        let dict = MmapDictionary::load(args.clone(), &MmapFile::new(dir.join("dict.mmap")))?;

        let quant = r.read_bool()?;
        let qout = r.read_bool()?;
        args.qout = qout;

        let in_file = MmapFile::new(dir.join("in.mmap"));
        let input = if quant {
            debug!("model is quantized, mapping quantized input matrix");
            InputMatrix::MmapQuant(MmapQMatrix::load(in_file.open_input()?)?)
        } else {
            debug!("mapping input matrix");
            InputMatrix::MmapDense(MmapMatrix::load(in_file.open_input()?)?)
        };
        if !quant && dict.prune_idx_size() >= 0 {
            return Err(Error::InvalidModel(
                "pruned dictionary without quantized input; please download an updated model"
                    .to_string(),
            ));
        }

        let output = if quant && qout {
            OutputMatrix::Quant(Arc::new(QMatrix::load(&mut r)?))
        } else {
            OutputMatrix::Dense(Arc::new(Matrix::load(&mut r)?))
        };

        let model = Self::build_model(&args, &dict, &output)?;
        info!("model loaded in {:.3}s", start.elapsed().as_secs_f64());
        Ok(FastText {
            args,
            version,
            quant,
            mmap: true,
            dict: Box::new(dict),
            input,
            output,
            model,
            word_vectors: Arc::new(OnceLock::new()),
        })
    }

    fn build_model(args: &Args, dict: &dyn Dictionary, output: &OutputMatrix) -> Result<Model> {
        let counts = if args.model == ModelKind::Supervised {
            dict.counts(EntryType::Label)?
        } else {
            dict.counts(EntryType::Word)?
        };
        if counts.len() != output.m() {
            return Err(Error::InvalidModel(format!(
                "output matrix has {} rows for {} classes",
                output.m(),
                counts.len()
            )));
        }
        Ok(Model::new(args.loss, args.dim as usize, output.m(), &counts))
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn is_quantized(&self) -> bool {
        self.quant
    }

    pub fn is_memory_mapped(&self) -> bool {
        self.mmap
    }

    pub fn dictionary(&self) -> &dyn Dictionary {
        self.dict.as_ref()
    }

    fn predict_ids(&mut self, words: &[i32], k: usize, threshold: f32) -> Result<Vec<Prediction>> {
        if words.is_empty() {
            return Ok(Vec::new());
        }
        let scored = self
            .model
            .predict(words, k, threshold, &self.input, &self.output)?;
        scored
            .into_iter()
            .map(|(log_prob, id)| {
                Ok(Prediction {
                    label: self.dict.label(id as usize)?,
                    log_prob,
                })
            })
            .collect()
    }

    /// Top-`k` labels with probability at least `threshold` for a
    /// whitespace-separated document.
    pub fn predict(&mut self, text: &str, k: usize, threshold: f32) -> Result<Vec<Prediction>> {
        let mut words = Vec::new();
        let mut labels = Vec::new();
        self.dict.line(text, &mut words, &mut labels)?;
        self.predict_ids(&words, k, threshold)
    }

    /// Like [`FastText::predict`] for an already tokenised document.
    pub fn predict_tokens(
        &mut self,
        tokens: &[String],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<Prediction>> {
        let mut words = Vec::new();
        let mut labels = Vec::new();
        self.dict.tokens_line(tokens, &mut words, &mut labels)?;
        self.predict_ids(&words, k, threshold)
    }

    /// Highest-probability label, if any clears `threshold`.
    pub fn predict_one(&mut self, text: &str, threshold: f32) -> Result<Option<Prediction>> {
        Ok(self.predict(text, 1, threshold)?.into_iter().next())
    }

    /// Every label whose probability clears `threshold`.
    pub fn predict_all(&mut self, text: &str, threshold: f32) -> Result<Vec<Prediction>> {
        let n_labels = self.dict.n_labels();
        self.predict(text, n_labels, threshold)
    }

    /// Vector of a single word: the average of its subword rows (and its
    /// own row when in vocabulary).
    pub fn word_vector(&self, word: &str) -> Result<Vec<f32>> {
        let mut vec = vec![0.0f32; self.args.dim as usize];
        let ngrams = self.dict.subwords(word)?;
        for &id in &ngrams {
            self.input.add_row_to(&mut vec, id as usize)?;
        }
        if !ngrams.is_empty() {
            let inv = 1.0 / ngrams.len() as f32;
            for v in &mut vec {
                *v *= inv;
            }
        }
        Ok(vec)
    }

    /// Vectors for a list of words.
    pub fn word_vectors(&self, words: &[String]) -> Result<Vec<Vec<f32>>> {
        words.iter().map(|w| self.word_vector(w)).collect()
    }

    /// One vector per subword of `word`, in subword order.
    pub fn ngram_vectors(&self, word: &str) -> Result<Vec<Vec<f32>>> {
        let dim = self.args.dim as usize;
        let mut vecs = Vec::new();
        for id in self.dict.subwords(word)? {
            let mut vec = vec![0.0f32; dim];
            if id >= 0 {
                self.input.add_row_to(&mut vec, id as usize)?;
            }
            vecs.push(vec);
        }
        Ok(vecs)
    }

    /// Sentence vector. Supervised models average the raw input rows of
    /// the decoded line; unsupervised models average the unit word vectors
    /// of tokens with a non-zero norm.
    pub fn sentence_vector(&self, tokens: &[String]) -> Result<Vec<f32>> {
        let dim = self.args.dim as usize;
        let mut svec = vec![0.0f32; dim];
        if self.args.model == ModelKind::Supervised {
            let mut words = Vec::new();
            let mut labels = Vec::new();
            self.dict.tokens_line(tokens, &mut words, &mut labels)?;
            for &id in &words {
                self.input.add_row_to(&mut svec, id as usize)?;
            }
            if !words.is_empty() {
                let inv = 1.0 / words.len() as f32;
                for v in &mut svec {
                    *v *= inv;
                }
            }
        } else {
            let mut count = 0;
            for token in tokens {
                let vec = self.word_vector(token)?;
                let norm = crate::norm(&vec);
                if norm > 0.0 {
                    for (s, v) in svec.iter_mut().zip(&vec) {
                        *s += v / norm;
                    }
                    count += 1;
                }
            }
            if count > 0 {
                let inv = 1.0 / count as f32;
                for v in &mut svec {
                    *v *= inv;
                }
            }
        }
        Ok(svec)
    }

    /// Vectors for a list of tokenised sentences.
    pub fn sentence_vectors(&self, sentences: &[Vec<String>]) -> Result<Vec<Vec<f32>>> {
        sentences.iter().map(|s| self.sentence_vector(s)).collect()
    }

    /// Average input row of a raw text's decoded ids.
    pub fn text_vector(&self, text: &str) -> Result<Vec<f32>> {
        let dim = self.args.dim as usize;
        let mut vec = vec![0.0f32; dim];
        let mut words = Vec::new();
        let mut labels = Vec::new();
        self.dict.line(text, &mut words, &mut labels)?;
        for &id in &words {
            self.input.add_row_to(&mut vec, id as usize)?;
        }
        if !words.is_empty() {
            let inv = 1.0 / words.len() as f32;
            for v in &mut vec {
                *v *= inv;
            }
        }
        Ok(vec)
    }

    /// Vectors for a list of documents.
    pub fn text_vectors(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.text_vector(t)).collect()
    }

    /// Unit word vectors for the whole vocabulary, built on the first
    /// nearest-neighbour query and shared by every cloned handle.
    fn word_vectors_matrix(&self) -> Result<&Matrix> {
        if let Some(wv) = self.word_vectors.get() {
            return Ok(wv);
        }
        info!("precomputing word vectors");
        let n_words = self.dict.n_words();
        let mut wv = Matrix::new(n_words, self.args.dim as usize);
        for i in 0..n_words {
            let word = self.dict.word(i)?;
            let vec = self.word_vector(&word)?;
            let norm = crate::norm(&vec);
            if norm > 0.0 {
                wv.add_row(&vec, i, 1.0 / norm);
            }
        }
        // A racing clone may have published an identical matrix first;
        // either way the table is never observed half-built.
        Ok(self.word_vectors.get_or_init(|| wv))
    }

    fn find_neighbors(
        &self,
        query: &[f32],
        k: usize,
        ban_set: &HashSet<String>,
    ) -> Result<Vec<Neighbor>> {
        let wv = self.word_vectors_matrix()?;
        let mut query_norm = crate::norm(query);
        if query_norm.abs() < 1e-8 {
            query_norm = 1.0;
        }

        let mut best: Vec<(f32, usize)> = (0..self.dict.n_words())
            .map(|i| (wv.dot_row(query, i) / query_norm, i))
            .collect();
        best.sort_by_key(|&(similarity, _)| std::cmp::Reverse(OrderedFloat(similarity)));

        let mut neighbors = Vec::with_capacity(k);
        for &(similarity, i) in &best {
            if neighbors.len() == k {
                break;
            }
            let word = self.dict.word(i)?;
            if !ban_set.contains(&word) {
                neighbors.push(Neighbor { word, similarity });
            }
        }
        Ok(neighbors)
    }

    /// The `k` vocabulary words closest to `word` by cosine similarity.
    pub fn nn(&self, word: &str, k: usize) -> Result<Vec<Neighbor>> {
        let mut ban_set = HashSet::new();
        ban_set.insert(word.to_string());
        let query = self.word_vector(word)?;
        self.find_neighbors(&query, k, &ban_set)
    }

    /// Word analogies over the triplet: scores `a - b + c` against the
    /// vocabulary, excluding the three query words.
    pub fn analogies(&self, a: &str, b: &str, c: &str, k: usize) -> Result<Vec<Neighbor>> {
        let mut ban_set = HashSet::new();
        let mut query = vec![0.0f32; self.args.dim as usize];
        for (word, sign) in [(a, 1.0f32), (b, -1.0), (c, 1.0)] {
            ban_set.insert(word.to_string());
            let vec = self.word_vector(word)?;
            for (q, v) in query.iter_mut().zip(&vec) {
                *q += sign * v;
            }
        }
        self.find_neighbors(&query, k, &ban_set)
    }

    /// New handle over the same model data: shared matrices, dictionary
    /// arrays and mappings; fresh cursors and scratch buffers.
    pub fn clone_handle(&self) -> FastText {
        FastText {
            args: self.args.clone(),
            version: self.version,
            quant: self.quant,
            mmap: self.mmap,
            dict: self.dict.clone_box(),
            input: self.input.clone_handle(),
            output: self.output.clone(),
            model: self.model.clone_handle(),
            word_vectors: Arc::clone(&self.word_vectors),
        }
    }

    /// Release file-backed resources. Further reads through this handle or
    /// any clone fail with [`Error::AlreadyClosed`].
    pub fn close(&self) -> Result<()> {
        self.dict.close()?;
        self.input.close();
        Ok(())
    }

    fn write_model(&self, out: &mut dyn Write) -> Result<()> {
        if self.mmap {
            return Err(Error::InvalidArgument(
                "cannot save a memory-mapped model".to_string(),
            ));
        }
        {
            let mut w = Writer::new(&mut *out);
            w.write_i32(FASTTEXT_FILEFORMAT_MAGIC)?;
            w.write_i32(self.version)?;
            self.args.save(&mut w)?;
        }
        self.dict.save(out)?;
        let mut w = Writer::new(&mut *out);
        w.write_bool(self.quant)?;
        match &self.input {
            InputMatrix::Dense(m) => m.save(&mut w)?,
            InputMatrix::Quant(q) => q.save(&mut w)?,
            _ => unreachable!("mmap handles cannot save"),
        }
        w.write_bool(self.args.qout)?;
        match &self.output {
            OutputMatrix::Dense(m) => m.save(&mut w)?,
            OutputMatrix::Quant(q) => q.save(&mut w)?,
        }
        Ok(())
    }

    /// Serialize the single-file binary format to any writer, byte-exact
    /// with respect to what was loaded.
    pub fn save_model_to_writer(&self, out: &mut dyn Write) -> Result<()> {
        self.write_model(out)
    }

    /// Save to `<path>.bin` (or `<path>.ftz` when quantized). Returns the
    /// full path written.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf> {
        if self.mmap {
            return Err(Error::InvalidArgument(
                "cannot save a memory-mapped model".to_string(),
            ));
        }
        let mut name = path.as_ref().as_os_str().to_os_string();
        name.push(if self.quant { ".ftz" } else { ".bin" });
        let path = PathBuf::from(name);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        info!("saving model to {path:?}");
        let mut out = BufWriter::new(File::create(&path)?);
        self.write_model(&mut out)?;
        out.flush()?;
        Ok(path)
    }

    /// Convert to the memory-mapped directory layout: `model.bin` (or
    /// `model.ftz`), `dict.mmap` and `in.mmap` under `dir`.
    pub fn save_as_memory_mapped_model<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        if self.mmap {
            return Err(Error::InvalidArgument(
                "cannot convert an already memory-mapped model".to_string(),
            ));
        }
        let start = Instant::now();
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let model_path = dir.join(if self.quant { "model.ftz" } else { "model.bin" });
        info!("saving core model to {model_path:?}");
        {
            let mut file = BufWriter::new(File::create(&model_path)?);
            let mut w = Writer::new(&mut file as &mut dyn Write);
            w.write_i32(FASTTEXT_FILEFORMAT_MAGIC)?;
            w.write_i32(self.version)?;
            self.args.save(&mut w)?;
            w.write_bool(self.quant)?;
            w.write_bool(self.args.qout)?;
            match &self.output {
                OutputMatrix::Dense(m) => m.save(&mut w)?,
                OutputMatrix::Quant(q) => q.save(&mut w)?,
            }
            debug!(
                "core model: {} bytes, crc32 {:08x}",
                w.bytes_written(),
                w.checksum()
            );
            file.flush()?;
        }

        let dict_path = dir.join("dict.mmap");
        info!("saving memory-mapped dictionary to {dict_path:?}");
        {
            let mut file = BufWriter::new(File::create(&dict_path)?);
            self.dict.save_to_mmap(&mut file)?;
            file.flush()?;
        }

        let input_path = dir.join("in.mmap");
        info!("saving memory-mapped input matrix to {input_path:?}");
        {
            let mut file = BufWriter::new(File::create(&input_path)?);
            let mut w = Writer::new(&mut file as &mut dyn Write);
            match &self.input {
                InputMatrix::Dense(m) => m.save(&mut w)?,
                InputMatrix::Quant(q) => q.save(&mut w)?,
                _ => unreachable!("mmap handles cannot convert"),
            }
            debug!(
                "input matrix: {} bytes, crc32 {:08x}",
                w.bytes_written(),
                w.checksum()
            );
            file.flush()?;
        }

        info!(
            "model converted to memory-mapped layout in {:.3}s",
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }
}
