//! Inference: averaged hidden layer, softmax and hierarchical-softmax
//! output heads, bounded k-best selection.
//!
//! Sigmoid and log go through small lookup tables, as in the trainer, so
//! reported scores match its quantisation. The Huffman tree (hierarchical
//! softmax) and the negative table are rebuilt from entry counts at load;
//! prediction only walks the tree, but a negative-sampling model keeps its
//! table reconstructible all the same.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use ordered_float::OrderedFloat;

use crate::args::Loss;
use crate::error::{Error, Result};
use crate::matrix::{InputMatrix, OutputMatrix};

const SIGMOID_TABLE_SIZE: usize = 512;
const MAX_SIGMOID: f32 = 8.0;
const LOG_TABLE_SIZE: usize = 512;
const NEGATIVE_TABLE_SIZE: usize = 10_000_000;

#[derive(Debug, Clone)]
struct Node {
    parent: i32,
    left: i32,
    right: i32,
    count: i64,
    binary: bool,
}

/// Everything read-only after load, shared between cloned handles.
#[derive(Debug)]
struct ModelShared {
    loss: Loss,
    osz: usize,
    hsz: usize,
    t_sigmoid: Vec<f32>,
    t_log: Vec<f32>,
    tree: Vec<Node>,
    paths: Vec<Vec<i32>>,
    codes: Vec<Vec<bool>>,
    negatives: Vec<i32>,
}

#[derive(Debug)]
pub struct Model {
    shared: Arc<ModelShared>,
    hidden: Vec<f32>,
    output: Vec<f32>,
    #[allow(dead_code)]
    grad: Vec<f32>,
    negpos: usize,
}

impl Model {
    /// `counts` are the per-class counts in id order (labels for
    /// supervised models, words otherwise) and must have one entry per
    /// output row.
    pub fn new(loss: Loss, dim: usize, osz: usize, counts: &[i64]) -> Model {
        assert_eq!(counts.len(), osz);

        let t_sigmoid = (0..=SIGMOID_TABLE_SIZE)
            .map(|i| {
                let x = (i as f32 * 2.0 * MAX_SIGMOID) / SIGMOID_TABLE_SIZE as f32 - MAX_SIGMOID;
                1.0 / (1.0 + (-x).exp())
            })
            .collect();
        let t_log = (0..=LOG_TABLE_SIZE)
            .map(|i| ((i as f32 + 1e-5) / LOG_TABLE_SIZE as f32).ln())
            .collect();

        let (tree, paths, codes) = if loss == Loss::HierarchicalSoftmax {
            build_tree(counts, osz)
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };
        let negatives = if loss == Loss::NegativeSampling {
            build_negative_table(counts, NEGATIVE_TABLE_SIZE)
        } else {
            Vec::new()
        };

        Model {
            shared: Arc::new(ModelShared {
                loss,
                osz,
                hsz: dim,
                t_sigmoid,
                t_log,
                tree,
                paths,
                codes,
                negatives,
            }),
            hidden: vec![0.0; dim],
            output: vec![0.0; osz],
            grad: vec![0.0; dim],
            negpos: 0,
        }
    }

    /// Same tables and tree, fresh scratch state.
    pub fn clone_handle(&self) -> Model {
        Model {
            shared: Arc::clone(&self.shared),
            hidden: vec![0.0; self.shared.hsz],
            output: vec![0.0; self.shared.osz],
            grad: vec![0.0; self.shared.hsz],
            negpos: 0,
        }
    }

    pub fn osz(&self) -> usize {
        self.shared.osz
    }

    pub fn sigmoid(&self, x: f32) -> f32 {
        if x < -MAX_SIGMOID {
            0.0
        } else if x > MAX_SIGMOID {
            1.0
        } else {
            let i = ((x + MAX_SIGMOID) * SIGMOID_TABLE_SIZE as f32 / MAX_SIGMOID / 2.0) as usize;
            self.shared.t_sigmoid[i]
        }
    }

    pub fn log(&self, x: f32) -> f32 {
        if x > 1.0 {
            0.0
        } else {
            let i = (x * LOG_TABLE_SIZE as f32) as usize;
            self.shared.t_log[i]
        }
    }

    /// Average of the input rows for `input`.
    pub fn compute_hidden(&mut self, input: &[i32], wi: &InputMatrix) -> Result<()> {
        self.hidden.fill(0.0);
        for &id in input {
            wi.add_row_to(&mut self.hidden, id as usize)?;
        }
        let inv = 1.0 / input.len() as f32;
        for h in &mut self.hidden {
            *h *= inv;
        }
        Ok(())
    }

    /// Softmax over the output rows against the current hidden vector,
    /// numerically stabilised by the running maximum.
    pub fn compute_output_softmax(&mut self, wo: &OutputMatrix) {
        let osz = self.shared.osz;
        for i in 0..osz {
            self.output[i] = wo.dot_row(&self.hidden, i);
        }
        let mut max = self.output[0];
        for i in 1..osz {
            max = max.max(self.output[i]);
        }
        let mut z = 0.0;
        for i in 0..osz {
            let p = (self.output[i] - max).exp();
            z += p;
            self.output[i] = p;
        }
        for i in 0..osz {
            self.output[i] /= z;
        }
    }

    /// Top-`k` classes above `threshold` for the given input ids. Returns
    /// `(log probability, class id)` pairs ordered by descending score;
    /// empty input yields no results.
    pub fn predict(
        &mut self,
        input: &[i32],
        k: usize,
        threshold: f32,
        wi: &InputMatrix,
        wo: &OutputMatrix,
    ) -> Result<Vec<(f32, i32)>> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be positive".to_string()));
        }
        if input.is_empty() {
            return Ok(Vec::new());
        }
        self.compute_hidden(input, wi)?;

        let mut heap = KBest::new(k);
        let threshold_log = threshold.ln();
        if self.shared.loss == Loss::HierarchicalSoftmax {
            let root = 2 * self.shared.osz as i32 - 2;
            self.dfs(k, threshold_log, root, 0.0, &mut heap, wo)?;
        } else {
            self.find_k_best(k, threshold_log, &mut heap, wo);
        }
        Ok(heap.into_sorted())
    }

    fn find_k_best(&mut self, k: usize, threshold_log: f32, heap: &mut KBest, wo: &OutputMatrix) {
        self.compute_output_softmax(wo);
        for i in 0..self.shared.osz {
            let lp = self.log(self.output[i]);
            if lp < threshold_log {
                continue;
            }
            if heap.len() == k && lp < heap.min_score() {
                continue;
            }
            heap.push(lp, i as i32);
        }
    }

    /// Depth-first descent of the Huffman tree, pruning subtrees that can
    /// no longer reach the current k-th best score.
    fn dfs(
        &self,
        k: usize,
        threshold_log: f32,
        node: i32,
        score: f32,
        heap: &mut KBest,
        wo: &OutputMatrix,
    ) -> Result<()> {
        if score < threshold_log {
            return Ok(());
        }
        if heap.len() == k && score < heap.min_score() {
            return Ok(());
        }
        let n = &self.shared.tree[node as usize];
        if n.left == -1 && n.right == -1 {
            heap.push(score, node);
            return Ok(());
        }
        let f = self.sigmoid(wo.dot_row(&self.hidden, (node as usize) - self.shared.osz));
        self.dfs(k, threshold_log, n.left, score + self.log(1.0 - f), heap, wo)?;
        self.dfs(k, threshold_log, n.right, score + self.log(f), heap, wo)
    }

    /// Next entry of the negative table that is not `target`.
    pub fn next_negative(&mut self, target: i32) -> i32 {
        let negatives = &self.shared.negatives;
        loop {
            let negative = negatives[self.negpos];
            self.negpos = (self.negpos + 1) % negatives.len();
            if negative != target {
                return negative;
            }
        }
    }
}

/// Huffman tree over class counts: `2*osz - 1` nodes, leaves first. Uses
/// the classic two-cursor merge over the count-sorted leaves and the
/// internal nodes created so far.
fn build_tree(counts: &[i64], osz: usize) -> (Vec<Node>, Vec<Vec<i32>>, Vec<Vec<bool>>) {
    let mut tree = vec![
        Node {
            parent: -1,
            left: -1,
            right: -1,
            count: 1_000_000_000_000_000,
            binary: false,
        };
        2 * osz - 1
    ];
    for i in 0..osz {
        tree[i].count = counts[i];
    }
    let mut leaf = osz as i64 - 1;
    let mut node = osz;
    for i in osz..(2 * osz - 1) {
        let mut mini = [0usize; 2];
        for slot in &mut mini {
            if leaf >= 0 && tree[leaf as usize].count < tree[node].count {
                *slot = leaf as usize;
                leaf -= 1;
            } else {
                *slot = node;
                node += 1;
            }
        }
        tree[i].left = mini[0] as i32;
        tree[i].right = mini[1] as i32;
        tree[i].count = tree[mini[0]].count + tree[mini[1]].count;
        tree[mini[0]].parent = i as i32;
        tree[mini[1]].parent = i as i32;
        tree[mini[1]].binary = true;
    }

    let mut paths = Vec::with_capacity(osz);
    let mut codes = Vec::with_capacity(osz);
    for i in 0..osz {
        let mut path = Vec::new();
        let mut code = Vec::new();
        let mut j = i;
        while tree[j].parent != -1 {
            path.push(tree[j].parent - osz as i32);
            code.push(tree[j].binary);
            j = tree[j].parent as usize;
        }
        paths.push(path);
        codes.push(code);
    }
    (tree, paths, codes)
}

/// Unigram table for negative sampling: class `i` appears about
/// `sqrt(count_i) * size / z` times.
fn build_negative_table(counts: &[i64], size: usize) -> Vec<i32> {
    let z: f32 = counts.iter().map(|&c| (c as f32).sqrt()).sum();
    let mut negatives = Vec::with_capacity(size);
    for (i, &count) in counts.iter().enumerate() {
        let bound = (count as f32).sqrt() * size as f32 / z;
        let mut j = 0u64;
        while (j as f32) < bound {
            negatives.push(i as i32);
            j += 1;
        }
    }
    negatives
}

/// Bounded double-ended priority queue for the k best scores. Orders by
/// descending score, ties broken by insertion order; once full, pushes
/// below the current minimum fall out again.
#[derive(Debug)]
pub(crate) struct KBest {
    k: usize,
    seq: u32,
    heap: BinaryHeap<Reverse<(OrderedFloat<f32>, Reverse<u32>, i32)>>,
}

impl KBest {
    pub(crate) fn new(k: usize) -> KBest {
        KBest {
            k,
            seq: 0,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Lowest retained score; only meaningful once non-empty.
    pub(crate) fn min_score(&self) -> f32 {
        match self.heap.peek() {
            Some(Reverse((score, _, _))) => score.0,
            None => f32::NEG_INFINITY,
        }
    }

    pub(crate) fn push(&mut self, score: f32, id: i32) {
        self.heap
            .push(Reverse((OrderedFloat(score), Reverse(self.seq), id)));
        self.seq += 1;
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    /// Drain to a list ordered by descending score.
    pub(crate) fn into_sorted(mut self) -> Vec<(f32, i32)> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(Reverse((score, _, id))) = self.heap.pop() {
            out.push((score.0, id));
        }
        out.reverse();
        out
    }
}
