//! Dictionary backed by the `dict.mmap` sidecar file.
//!
//! The probe table becomes a sorted array of occupied slots with a parallel
//! id array, resolved by binary search; entry records are fixed width so
//! any field is one seek away. Only the small lookup arrays and the discard
//! table live on the heap.

use std::io::Write;
use std::sync::Arc;

use crate::args::Args;
use crate::error::{Error, Result};
use crate::mmapfile::{MmapFile, MmapInput};

use super::{discard_table, Dictionary, Entry, EntryType, WORD_ID_DEFAULT};

#[derive(Debug, Clone)]
pub struct MmapDictionary {
    args: Args,
    size: usize,
    n_words: usize,
    n_labels: usize,
    n_tokens: i64,
    prune_idx_size: i64,
    /// Occupied probe slots, strictly increasing.
    word_hashes: Arc<Vec<i64>>,
    /// Entry ids in the same permutation as `word_hashes`.
    ids: Arc<Vec<i32>>,
    prune_keys: Arc<Vec<i32>>,
    prune_values: Arc<Vec<i32>>,
    p_discard: Arc<Vec<f64>>,
    entries_offset: u64,
    word_bytes_len: usize,
    subwords_bytes_len: usize,
    input: MmapInput,
}

impl MmapDictionary {
    pub fn load(args: Args, file: &MmapFile) -> Result<MmapDictionary> {
        let input = file.open_input()?;
        input.seek(0)?;

        let word_bytes_len = input.read_i32()?;
        let subwords_bytes_len = input.read_i32()?;
        let size = input.read_i32()?;
        let n_words = input.read_i32()?;
        let n_labels = input.read_i32()?;
        let n_tokens = input.read_i64()?;
        let prune_idx_size = input.read_i64()?;

        if word_bytes_len < 0 || subwords_bytes_len < 0 {
            return Err(Error::InvalidModel(format!(
                "negative entry field widths {word_bytes_len}/{subwords_bytes_len}"
            )));
        }
        if size <= 0 {
            return Err(Error::InvalidModel("empty vocabulary".to_string()));
        }
        if n_words < 0 || n_labels < 0 || n_words + n_labels != size {
            return Err(Error::InvalidModel(format!(
                "dictionary sections disagree: size={size} words={n_words} labels={n_labels}"
            )));
        }
        let size = size as usize;

        let n_prune = prune_idx_size.max(0) as usize;
        let mut prune_keys = Vec::with_capacity(n_prune);
        for _ in 0..n_prune {
            prune_keys.push(input.read_i32()?);
        }
        let mut prune_values = Vec::with_capacity(n_prune);
        for _ in 0..n_prune {
            prune_values.push(input.read_i32()?);
        }

        let mut word_hashes = Vec::with_capacity(size);
        for _ in 0..size {
            word_hashes.push(input.read_i64()?);
        }
        let mut ids = Vec::with_capacity(size);
        for _ in 0..size {
            ids.push(input.read_i32()?);
        }
        // Probe slots are unique by construction; a sorted file with
        // duplicates cannot answer lookups and is rejected outright.
        if !word_hashes.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(Error::InvalidModel(
                "word hash table is not strictly increasing".to_string(),
            ));
        }

        let entries_offset = input.position();

        let mut dict = MmapDictionary {
            args,
            size,
            n_words: n_words as usize,
            n_labels: n_labels as usize,
            n_tokens,
            prune_idx_size,
            word_hashes: Arc::new(word_hashes),
            ids: Arc::new(ids),
            prune_keys: Arc::new(prune_keys),
            prune_values: Arc::new(prune_values),
            p_discard: Arc::new(Vec::new()),
            entries_offset,
            word_bytes_len: word_bytes_len as usize,
            subwords_bytes_len: subwords_bytes_len as usize,
            input,
        };

        let mut counts = Vec::with_capacity(size);
        for id in 0..size {
            counts.push(dict.read_count(id)?);
        }
        dict.p_discard = Arc::new(discard_table(&counts, n_tokens, dict.args.t));
        Ok(dict)
    }

    fn entry_len(&self) -> u64 {
        // word length + padded word + count + type + subword count + padded subwords
        (4 + self.word_bytes_len + 8 + 1 + 4 + self.subwords_bytes_len) as u64
    }

    fn entry_position(&self, id: usize) -> u64 {
        self.entries_offset + self.entry_len() * id as u64
    }

    fn count_offset(&self) -> u64 {
        4 + self.word_bytes_len as u64
    }

    fn type_offset(&self) -> u64 {
        self.count_offset() + 8
    }

    fn subwords_offset(&self) -> u64 {
        self.type_offset() + 1
    }

    fn read_word(&self, id: usize) -> Result<String> {
        self.input.seek(self.entry_position(id))?;
        let len = self.input.read_i32()? as usize;
        if len > self.word_bytes_len {
            return Err(Error::InvalidModel(format!(
                "entry word length {len} exceeds field width {}",
                self.word_bytes_len
            )));
        }
        let mut bytes = vec![0u8; len];
        self.input.read_bytes(&mut bytes)?;
        Ok(String::from_utf8(bytes)?)
    }

    fn read_count(&self, id: usize) -> Result<i64> {
        self.input
            .seek(self.entry_position(id) + self.count_offset())?;
        self.input.read_i64()
    }

    fn read_type(&self, id: usize) -> Result<EntryType> {
        self.input
            .seek(self.entry_position(id) + self.type_offset())?;
        EntryType::from_u8(self.input.read_u8()?)
    }

    fn read_subwords(&self, id: usize) -> Result<Vec<i32>> {
        self.input
            .seek(self.entry_position(id) + self.subwords_offset())?;
        let len = self.input.read_i32()? as usize;
        if len * 4 > self.subwords_bytes_len {
            return Err(Error::InvalidModel(format!(
                "entry subword count {len} exceeds field width {}",
                self.subwords_bytes_len
            )));
        }
        let mut subwords = Vec::with_capacity(len);
        for _ in 0..len {
            subwords.push(self.input.read_i32()?);
        }
        Ok(subwords)
    }
}

impl Dictionary for MmapDictionary {
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
        assert!(id < self.size);
        self.read_word(id)
    }

    fn count(&self, id: usize) -> Result<i64> {
        assert!(id < self.size);
        self.read_count(id)
    }

    fn entry_type(&self, id: usize) -> Result<EntryType> {
        assert!(id < self.size);
        self.read_type(id)
    }

    fn entry(&self, id: usize) -> Result<Entry> {
        assert!(id < self.size);
        Ok(Entry {
            word: self.read_word(id)?,
            count: self.read_count(id)?,
            entry_type: self.read_type(id)?,
            subwords: self.read_subwords(id)?,
        })
    }

    fn subwords_of_id(&self, id: usize) -> Result<Vec<i32>> {
        assert!(id < self.size);
        self.read_subwords(id)
    }

    fn hash_to_id(&self, slot: u64) -> i32 {
        match self.word_hashes.binary_search(&(slot as i64)) {
            Ok(idx) => self.ids[idx],
            Err(_) => WORD_ID_DEFAULT,
        }
    }

    fn pruning(&self, id: i32) -> i32 {
        match self.prune_keys.binary_search(&id) {
            Ok(idx) => self.prune_values[idx],
            Err(_) => -1,
        }
    }

    fn p_discard(&self, id: usize) -> f64 {
        self.p_discard[id]
    }

    fn save(&self, _out: &mut dyn Write) -> Result<()> {
        Err(Error::InvalidArgument(
            "cannot save a memory-mapped dictionary".to_string(),
        ))
    }

    fn save_to_mmap(&self, _out: &mut dyn Write) -> Result<()> {
        Err(Error::InvalidArgument(
            "cannot convert an already memory-mapped dictionary".to_string(),
        ))
    }

    fn clone_box(&self) -> Box<dyn Dictionary> {
        Box::new(self.clone())
    }

    fn close(&self) -> Result<()> {
        self.input.close();
        Ok(())
    }
}
