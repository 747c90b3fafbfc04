//! Vocabulary and label dictionary.
//!
//! Two implementations share one contract: [`MemDictionary`] keeps every
//! entry on the heap the way the trainer's own reader does, and
//! [`MmapDictionary`] answers the same queries from a mapped sidecar file
//! using sorted-array lookups. Tokenisation, subword extraction and the
//! n-gram hashing rules live here as shared behaviour.

use crate::args::{Args, ModelKind};
use crate::error::{Error, Result};
use crate::Rng;

mod memory;
mod mmap;

pub use memory::MemDictionary;
pub use mmap::MmapDictionary;

/// Size of the conceptual word hash table for version-11 models.
pub const MAX_VOCAB_SIZE: u64 = 30_000_000;
/// Cap on tokens per decoded line for unsupervised models.
pub const MAX_LINE_SIZE: usize = 1024;

pub const EOS: &str = "</s>";
pub(crate) const BOW: char = '<';
pub(crate) const EOW: char = '>';

/// Sentinel id for "not in the vocabulary".
pub const WORD_ID_DEFAULT: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Word = 0,
    Label = 1,
}

impl EntryType {
    pub fn from_u8(value: u8) -> Result<EntryType> {
        match value {
            0 => Ok(EntryType::Word),
            1 => Ok(EntryType::Label),
            _ => Err(Error::InvalidModel(format!(
                "unknown entry type value {value}"
            ))),
        }
    }
}

/// One vocabulary or label entry. `subwords` holds the entry's own id
/// followed by the bucket ids of its character n-grams.
#[derive(Debug, Clone)]
pub struct Entry {
    pub word: String,
    pub count: i64,
    pub entry_type: EntryType,
    pub subwords: Vec<i32>,
}

/// FNV-1a over the UTF-8 bytes, in 32-bit two's-complement arithmetic,
/// widened to u64. This is the hash the trainer buckets everything with.
pub fn fnv1a32(bytes: &[u8]) -> u64 {
    let mut h: u32 = 0x811C_9DC5;
    for &b in bytes {
        h = (h ^ b as u32).wrapping_mul(0x0100_0193);
    }
    h as u64
}

/// The fixed whitespace set the trainer splits on.
fn is_space_break(cp: char) -> bool {
    matches!(cp,
        '\u{00A0}'
        | '\u{0009}'
        | '\u{000A}'..='\u{000D}'
        | '\u{0020}'
        | '\u{0085}'
        | '\u{1680}'
        | '\u{2000}'..='\u{200A}'
        | '\u{2028}'..='\u{2029}'
        | '\u{202F}'
        | '\u{205F}'
        | '\u{3000}')
}

/// Split a line on the trainer's whitespace set and append the
/// end-of-sentence sentinel.
pub fn line_tokens(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut token = String::new();
    for cp in line.chars() {
        if is_space_break(cp) {
            if !token.is_empty() {
                tokens.push(std::mem::take(&mut token));
            }
        } else {
            token.push(cp);
        }
    }
    if !token.is_empty() {
        tokens.push(token);
    }
    tokens.push(EOS.to_string());
    tokens
}

fn is_continuation_byte(b: u8) -> bool {
    b & 0xC0 == 0x80
}

/// Raw character-n-gram bucket ids of an already-padded word (`<` + word
/// + `>`). Walks UTF-8 bytes and grows each n-gram by code points; the
/// length-one n-grams touching either padding character are skipped.
pub(crate) fn char_ngram_buckets(padded: &str, minn: i32, maxn: i32, bucket: i32, out: &mut Vec<i32>) {
    let bytes = padded.as_bytes();
    let len = bytes.len();
    for i in 0..len {
        if is_continuation_byte(bytes[i]) {
            continue;
        }
        let mut j = i;
        let mut n = 1;
        while j < len && n <= maxn {
            j += 1;
            while j < len && is_continuation_byte(bytes[j]) {
                j += 1;
            }
            if n >= minn && !(n == 1 && (i == 0 || j == len)) {
                let h = fnv1a32(&bytes[i..j]) % bucket as u64;
                out.push(h as i32);
            }
            n += 1;
        }
    }
}

/// Widen a 32-bit token hash to the 64-bit seed of the rolling word-n-gram
/// hash. The trainer's arithmetic sign-extends hashes with the top bit set.
fn widen_token_hash(h: u64) -> u64 {
    if h > i32::MAX as u64 {
        0xFFFF_FFFF_0000_0000u64.wrapping_add(h)
    } else {
        h
    }
}

/// Read-only dictionary contract shared by the in-memory and memory-mapped
/// implementations. Entries `0..n_words` are words, the rest labels.
pub trait Dictionary {
    fn args(&self) -> &Args;
    fn size(&self) -> usize;
    fn n_words(&self) -> usize;
    fn n_labels(&self) -> usize;
    fn n_tokens(&self) -> i64;
    /// `-1` when the model carries no pruning section; `0` when pruning
    /// emptied the n-gram table entirely.
    fn prune_idx_size(&self) -> i64;

    /// Word text of any entry (word or label) by id.
    fn entry_word(&self, id: usize) -> Result<String>;
    fn count(&self, id: usize) -> Result<i64>;
    fn entry_type(&self, id: usize) -> Result<EntryType>;
    fn entry(&self, id: usize) -> Result<Entry>;
    /// Stored subword list of an in-vocabulary entry.
    fn subwords_of_id(&self, id: usize) -> Result<Vec<i32>>;

    /// Resolve a probe slot to an entry id, or [`WORD_ID_DEFAULT`].
    fn hash_to_id(&self, slot: u64) -> i32;
    /// Compacted bucket for `id`, or `-1` when `id` was pruned away.
    fn pruning(&self, id: i32) -> i32;
    /// Sub-sampling keep threshold for entry `id`.
    fn p_discard(&self, id: usize) -> f64;

    /// Native single-file section, byte-identical to what was loaded.
    /// Memory-mapped dictionaries cannot be saved back.
    fn save(&self, out: &mut dyn std::io::Write) -> Result<()>;
    /// Sidecar (`dict.mmap`) layout.
    fn save_to_mmap(&self, out: &mut dyn std::io::Write) -> Result<()>;
    /// Same data, independent cursor.
    fn clone_box(&self) -> Box<dyn Dictionary>;
    fn close(&self) -> Result<()>;

    fn word(&self, id: usize) -> Result<String> {
        debug_assert!(id < self.n_words());
        self.entry_word(id)
    }

    fn label(&self, lid: usize) -> Result<String> {
        debug_assert!(lid < self.n_labels());
        self.entry_word(lid + self.n_words())
    }

    /// Size of the conceptual open-addressed probe table.
    fn word2int_size(&self) -> u64 {
        if self.args().use_max_vocabulary_size {
            MAX_VOCAB_SIZE
        } else {
            (self.size() as f64 / 0.7).ceil() as u64
        }
    }

    /// Linear-probe for the slot of `word`: either its occupied slot or
    /// the first empty one.
    fn find_slot(&self, word: &str, hash: u64) -> Result<u64> {
        let table_size = self.word2int_size();
        let mut slot = hash % table_size;
        loop {
            let id = self.hash_to_id(slot);
            if id == WORD_ID_DEFAULT || self.entry_word(id as usize)? == word {
                return Ok(slot);
            }
            slot = (slot + 1) % table_size;
        }
    }

    fn id(&self, word: &str) -> Result<i32> {
        let slot = self.find_slot(word, fnv1a32(word.as_bytes()))?;
        Ok(self.hash_to_id(slot))
    }

    fn contains(&self, word: &str) -> Result<bool> {
        Ok(self.id(word)? >= 0)
    }

    /// Entry type inferred from the token text alone.
    fn token_type(&self, token: &str) -> EntryType {
        if token.starts_with(&self.args().label) {
            EntryType::Label
        } else {
            EntryType::Word
        }
    }

    /// Push an n-gram bucket id through the pruning gate.
    fn push_hash(&self, ngrams: &mut Vec<i32>, id: i32) {
        let prune_size = self.prune_idx_size();
        if prune_size == 0 || id < 0 {
            return;
        }
        let id = if prune_size > 0 {
            let remapped = self.pruning(id);
            if remapped < 0 {
                return;
            }
            remapped
        } else {
            id
        };
        ngrams.push(self.n_words() as i32 + id);
    }

    /// Character-n-gram bucket ids of `word`, computed on the fly.
    fn compute_subwords(&self, word: &str, ngrams: &mut Vec<i32>) {
        let args = self.args();
        let padded = format!("{BOW}{word}{EOW}");
        let mut raw = Vec::new();
        char_ngram_buckets(&padded, args.minn, args.maxn, args.bucket, &mut raw);
        for bucket in raw {
            self.push_hash(ngrams, bucket);
        }
    }

    /// Subword ids for a word: the stored list when in vocabulary, the
    /// freshly computed character n-grams otherwise. The sentinel token
    /// never gets computed subwords.
    fn subwords(&self, word: &str) -> Result<Vec<i32>> {
        let id = self.id(word)?;
        if id >= 0 {
            return self.subwords_of_id(id as usize);
        }
        let mut ngrams = Vec::new();
        if word != EOS {
            self.compute_subwords(word, &mut ngrams);
        }
        Ok(ngrams)
    }

    /// Should `id` be dropped from an unsupervised line given uniform draw
    /// `rand`?
    fn discard(&self, id: usize, rand: f64) -> bool {
        debug_assert!(id < self.n_words());
        if self.args().model == ModelKind::Supervised {
            false
        } else {
            rand > self.p_discard(id)
        }
    }

    /// Append the word-n-gram bucket ids of a decoded line. `hashes` are
    /// the 32-bit token hashes in line order.
    fn add_word_ngrams(&self, line: &mut Vec<i32>, hashes: &[u64], n: i32) {
        if self.prune_idx_size() == 0 || n < 2 {
            return;
        }
        let bucket = self.args().bucket as u64;
        for i in 0..hashes.len() {
            let mut h = widen_token_hash(hashes[i]);
            for j in (i + 1)..hashes.len().min(i + n as usize) {
                // reinterpret the second hash as signed so negative values
                // subtract, exactly like the trainer
                let h2 = hashes[j] as u32 as i32;
                h = h
                    .wrapping_mul(116_049_371)
                    .wrapping_add(h2 as i64 as u64);
                let id = (h % bucket) as i32;
                self.push_hash(line, id);
            }
        }
    }

    /// Decode `tokens` for the supervised/prediction path: subword ids for
    /// in-vocabulary words, label ids (offset by `n_words`), word n-grams
    /// bolted on for supervised models. No sub-sampling. Returns the number
    /// of in-vocabulary tokens seen.
    fn line_from_tokens(
        &self,
        tokens: &[String],
        words: &mut Vec<i32>,
        labels: &mut Vec<i32>,
    ) -> Result<usize> {
        words.clear();
        labels.clear();
        let mut hashes = Vec::new();
        let mut n_tokens = 0;
        let maxn = self.args().maxn;
        for token in tokens {
            let h = fnv1a32(token.as_bytes());
            let wid = self.hash_to_id(self.find_slot(token, h)?);
            if wid < 0 {
                if self.token_type(token) == EntryType::Word {
                    hashes.push(h);
                }
                continue;
            }
            n_tokens += 1;
            match self.entry_type(wid as usize)? {
                EntryType::Word => {
                    if maxn <= 0 {
                        words.push(wid);
                    } else {
                        words.extend(self.subwords_of_id(wid as usize)?);
                    }
                    hashes.push(h);
                }
                EntryType::Label => labels.push(wid - self.n_words() as i32),
            }
            if token == EOS {
                break;
            }
        }
        if self.args().model == ModelKind::Supervised {
            self.add_word_ngrams(words, &hashes, self.args().word_ngrams);
        }
        Ok(n_tokens)
    }

    /// Tokenise and decode a raw line. See [`Dictionary::line_from_tokens`].
    fn line(&self, text: &str, words: &mut Vec<i32>, labels: &mut Vec<i32>) -> Result<usize> {
        self.line_from_tokens(&line_tokens(text), words, labels)
    }

    /// Decode a caller-tokenised line; the end-of-sentence sentinel is
    /// appended here.
    fn tokens_line(
        &self,
        tokens: &[String],
        words: &mut Vec<i32>,
        labels: &mut Vec<i32>,
    ) -> Result<usize> {
        let mut with_eos = tokens.to_vec();
        with_eos.push(EOS.to_string());
        self.line_from_tokens(&with_eos, words, labels)
    }

    /// Decode a line keeping word ids only, sub-sampling frequent words.
    /// This is the path word-vector queries on unsupervised models use.
    fn line_words(&self, text: &str, words: &mut Vec<i32>, rng: &mut Rng) -> Result<usize> {
        words.clear();
        let mut n_tokens = 0;
        for token in line_tokens(text) {
            let h = fnv1a32(token.as_bytes());
            let wid = self.hash_to_id(self.find_slot(&token, h)?);
            if wid < 0 {
                continue;
            }
            n_tokens += 1;
            if self.entry_type(wid as usize)? == EntryType::Word
                && !self.discard(wid as usize, rng.rand_real() as f64)
            {
                words.push(wid);
            }
            if token == EOS {
                break;
            }
            if n_tokens > MAX_LINE_SIZE && self.args().model != ModelKind::Supervised {
                break;
            }
        }
        Ok(n_tokens)
    }

    /// Every entry, in id order.
    fn entries(&self) -> Result<Vec<Entry>> {
        (0..self.size()).map(|id| self.entry(id)).collect()
    }

    /// Counts of every entry of `entry_type`, in id order. Feeds the
    /// Huffman tree and negative-table builders.
    fn counts(&self, entry_type: EntryType) -> Result<Vec<i64>> {
        let mut counts = Vec::new();
        for id in 0..self.size() {
            if self.entry_type(id)? == entry_type {
                counts.push(self.count(id)?);
            }
        }
        Ok(counts)
    }
}

/// Discard thresholds from entry counts: `sqrt(t/f) + t/f` with
/// `f = count / n_tokens`.
pub(crate) fn discard_table(counts: &[i64], n_tokens: i64, t: f64) -> Vec<f64> {
    counts
        .iter()
        .map(|&count| {
            let f = count as f64 / n_tokens as f64;
            (t / f).sqrt() + t / f
        })
        .collect()
}
