//! Heap-resident dictionary, the direct counterpart of the trainer's own
//! reader.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::args::Args;
use crate::error::{Error, Result};
use crate::io::{BinRead, Reader, Writer};

use super::{
    char_ngram_buckets, discard_table, fnv1a32, Dictionary, Entry, EntryType, BOW, EOS, EOW,
    WORD_ID_DEFAULT,
};

/// In-memory dictionary. All derived tables (probe table, discard table,
/// subword lists) are built once at load and shared read-only between
/// cloned handles.
#[derive(Debug, Clone)]
pub struct MemDictionary {
    args: Args,
    size: usize,
    n_words: usize,
    n_labels: usize,
    n_tokens: i64,
    prune_idx_size: i64,
    entries: Arc<Vec<Entry>>,
    word2int: Arc<HashMap<u64, i32>>,
    /// Prune pairs in file order, kept for byte-identical saves.
    prune_pairs: Arc<Vec<(i32, i32)>>,
    prune_idx: Arc<HashMap<i32, i32>>,
    p_discard: Arc<Vec<f64>>,
}

impl MemDictionary {
    pub fn load<R: Read>(args: Args, r: &mut Reader<R>) -> Result<MemDictionary> {
        let size = r.read_i32()?;
        let n_words = r.read_i32()?;
        let n_labels = r.read_i32()?;
        let n_tokens = r.read_i64()?;
        let prune_idx_size = r.read_i64()?;

        if size <= 0 {
            return Err(Error::InvalidModel("empty vocabulary".to_string()));
        }
        if n_words < 0 || n_labels < 0 || n_words + n_labels != size {
            return Err(Error::InvalidModel(format!(
                "dictionary sections disagree: size={size} words={n_words} labels={n_labels}"
            )));
        }

        let size = size as usize;
        let mut entries = Vec::with_capacity(size);
        for _ in 0..size {
            let word = r.read_cstr()?;
            let count = r.read_i64()?;
            let entry_type = EntryType::from_u8(r.read_u8()?)?;
            entries.push(Entry {
                word,
                count,
                entry_type,
                subwords: Vec::new(),
            });
        }

        let mut prune_pairs = Vec::new();
        if prune_idx_size >= 0 {
            prune_pairs.reserve(prune_idx_size as usize);
            for _ in 0..prune_idx_size {
                let first = r.read_i32()?;
                let second = r.read_i32()?;
                prune_pairs.push((first, second));
            }
        }

        Self::build(
            args,
            size,
            n_words as usize,
            n_labels as usize,
            n_tokens,
            prune_idx_size,
            entries,
            prune_pairs,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        args: Args,
        size: usize,
        n_words: usize,
        n_labels: usize,
        n_tokens: i64,
        prune_idx_size: i64,
        mut entries: Vec<Entry>,
        prune_pairs: Vec<(i32, i32)>,
    ) -> Result<MemDictionary> {
        let prune_idx: HashMap<i32, i32> = prune_pairs.iter().copied().collect();

        // Probe table: each word gets the first free slot starting from its
        // hash, so slots are unique even for colliding hashes.
        let table_size = if args.use_max_vocabulary_size {
            super::MAX_VOCAB_SIZE
        } else {
            (size as f64 / 0.7).ceil() as u64
        };
        let mut word2int: HashMap<u64, i32> = HashMap::with_capacity(size);
        for (i, e) in entries.iter().enumerate() {
            let mut slot = fnv1a32(e.word.as_bytes()) % table_size;
            loop {
                match word2int.get(&slot) {
                    None => break,
                    Some(&id) if entries[id as usize].word == e.word => break,
                    _ => slot = (slot + 1) % table_size,
                }
            }
            word2int.insert(slot, i as i32);
        }

        let counts: Vec<i64> = entries.iter().map(|e| e.count).collect();
        let p_discard = discard_table(&counts, n_tokens, args.t);

        // Subword lists: own id first, then the pruned character n-grams.
        let mut raw = Vec::new();
        for (i, e) in entries.iter_mut().enumerate() {
            e.subwords.push(i as i32);
            if e.word == EOS {
                continue;
            }
            raw.clear();
            let padded = format!("{BOW}{}{EOW}", e.word);
            char_ngram_buckets(&padded, args.minn, args.maxn, args.bucket, &mut raw);
            for &bucket in &raw {
                if prune_idx_size == 0 {
                    break;
                }
                let id = if prune_idx_size > 0 {
                    match prune_idx.get(&bucket) {
                        Some(&remapped) => remapped,
                        None => continue,
                    }
                } else {
                    bucket
                };
                e.subwords.push(n_words as i32 + id);
            }
        }

        Ok(MemDictionary {
            args,
            size,
            n_words,
            n_labels,
            n_tokens,
            prune_idx_size,
            entries: Arc::new(entries),
            word2int: Arc::new(word2int),
            prune_pairs: Arc::new(prune_pairs),
            prune_idx: Arc::new(prune_idx),
            p_discard: Arc::new(p_discard),
        })
    }

    fn save_native<W: Write>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_i32(self.size as i32)?;
        w.write_i32(self.n_words as i32)?;
        w.write_i32(self.n_labels as i32)?;
        w.write_i64(self.n_tokens)?;
        w.write_i64(self.prune_idx_size)?;
        for e in self.entries.iter() {
            w.write_cstr(&e.word)?;
            w.write_i64(e.count)?;
            w.write_u8(e.entry_type as u8)?;
        }
        for &(first, second) in self.prune_pairs.iter() {
            w.write_i32(first)?;
            w.write_i32(second)?;
        }
        Ok(())
    }
}

impl Dictionary for MemDictionary {
    fn args(&self) -> &Args {
        &self.args
    }

    fn size(&self) -> usize {
        self.size
    }

    fn n_words(&self) -> usize {
        self.n_words
    }

    fn n_labels(&self) -> usize {
        self.n_labels
    }

    fn n_tokens(&self) -> i64 {
        self.n_tokens
    }

    fn prune_idx_size(&self) -> i64 {
        self.prune_idx_size
    }

    fn entry_word(&self, id: usize) -> Result<String> {
        Ok(self.entries[id].word.clone())
    }

    fn count(&self, id: usize) -> Result<i64> {
        Ok(self.entries[id].count)
    }

    fn entry_type(&self, id: usize) -> Result<EntryType> {
        Ok(self.entries[id].entry_type)
    }

    fn entry(&self, id: usize) -> Result<Entry> {
        Ok(self.entries[id].clone())
    }

    fn subwords_of_id(&self, id: usize) -> Result<Vec<i32>> {
        Ok(self.entries[id].subwords.clone())
    }

    fn hash_to_id(&self, slot: u64) -> i32 {
        self.word2int.get(&slot).copied().unwrap_or(WORD_ID_DEFAULT)
    }

    fn pruning(&self, id: i32) -> i32 {
        self.prune_idx.get(&id).copied().unwrap_or(-1)
    }

    fn p_discard(&self, id: usize) -> f64 {
        self.p_discard[id]
    }

    fn save(&self, out: &mut dyn Write) -> Result<()> {
        let mut w = Writer::new(out);
        self.save_native(&mut w)
    }

    /// Sidecar layout: fixed-width entry records preceded by the sorted
    /// slot/id arrays the mapped reader binary-searches.
    fn save_to_mmap(&self, out: &mut dyn Write) -> Result<()> {
        let mut w = Writer::new(out);
        let w = &mut w;
        let mut ordered_word2int: Vec<(u64, i32)> =
            self.word2int.iter().map(|(&slot, &id)| (slot, id)).collect();
        ordered_word2int.sort_unstable_by_key(|&(slot, _)| slot);
        debug_assert!(ordered_word2int.windows(2).all(|p| p[0].0 < p[1].0));

        let mut ordered_prune: Vec<(i32, i32)> = self.prune_pairs.to_vec();
        ordered_prune.sort_unstable_by_key(|&(key, _)| key);

        let word_bytes_len = self
            .entries
            .iter()
            .map(|e| e.word.as_bytes().len())
            .max()
            .unwrap_or(0);
        let subwords_bytes_len = 4 * self
            .entries
            .iter()
            .map(|e| e.subwords.len())
            .max()
            .unwrap_or(0);

        w.write_i32(word_bytes_len as i32)?;
        w.write_i32(subwords_bytes_len as i32)?;
        w.write_i32(self.size as i32)?;
        w.write_i32(self.n_words as i32)?;
        w.write_i32(self.n_labels as i32)?;
        w.write_i64(self.n_tokens)?;
        w.write_i64(self.prune_idx_size)?;
        for &(key, _) in &ordered_prune {
            w.write_i32(key)?;
        }
        for &(_, value) in &ordered_prune {
            w.write_i32(value)?;
        }
        for &(slot, _) in &ordered_word2int {
            w.write_i64(slot as i64)?;
        }
        for &(_, id) in &ordered_word2int {
            w.write_i32(id)?;
        }
        for e in self.entries.iter() {
            let word = e.word.as_bytes();
            w.write_i32(word.len() as i32)?;
            w.write_bytes(word)?;
            for _ in word.len()..word_bytes_len {
                w.write_u8(0)?;
            }
            w.write_i64(e.count)?;
            w.write_u8(e.entry_type as u8)?;
            w.write_i32(e.subwords.len() as i32)?;
            for &subword in &e.subwords {
                w.write_i32(subword)?;
            }
            for _ in 4 * e.subwords.len()..subwords_bytes_len {
                w.write_u8(0)?;
            }
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Dictionary> {
        Box::new(self.clone())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
