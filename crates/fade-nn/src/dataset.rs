// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::{seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Rectangular batch of token-id sequences, stored row-major.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<u32>>", into = "Vec<Vec<u32>>")]
pub struct TokenBatch {
    tokens: Vec<u32>,
    batch: usize,
    seq_len: usize,
}

impl TokenBatch {
    /// Builds a batch from equally long sequences.
    pub fn new(sequences: Vec<Vec<u32>>) -> PureResult<Self> {
        let batch = sequences.len();
        let seq_len = sequences.first().map(Vec::len).unwrap_or(0);
        if batch == 0 || seq_len == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: batch,
                cols: seq_len,
            });
        }
        let mut tokens = Vec::with_capacity(batch * seq_len);
        for sequence in sequences {
            if sequence.len() != seq_len {
                return Err(TensorError::DataLength {
                    expected: seq_len,
                    got: sequence.len(),
                });
            }
            tokens.extend(sequence);
        }
        Ok(Self {
            tokens,
            batch,
            seq_len,
        })
    }

    /// Stacks batches along the batch axis.
    pub fn concat(batches: &[TokenBatch]) -> PureResult<Self> {
        let Some(first) = batches.first() else {
            return Err(TensorError::EmptyInput("TokenBatch::concat"));
        };
        let mut tokens = Vec::new();
        let mut batch = 0;
        for item in batches {
            if item.seq_len != first.seq_len {
                return Err(TensorError::DataLength {
                    expected: first.seq_len,
                    got: item.seq_len,
                });
            }
            tokens.extend_from_slice(&item.tokens);
            batch += item.batch;
        }
        Ok(Self {
            tokens,
            batch,
            seq_len: first.seq_len,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn sequence(&self, index: usize) -> &[u32] {
        &self.tokens[index * self.seq_len..(index + 1) * self.seq_len]
    }

    /// Flattened `(batch * seq_len, 1)` id tensor in the layout embeddings
    /// consume.
    pub fn to_tensor(&self) -> PureResult<Tensor> {
        Tensor::from_vec(
            self.tokens.len(),
            1,
            self.tokens.iter().map(|&t| t as f32).collect(),
        )
    }
}

impl TryFrom<Vec<Vec<u32>>> for TokenBatch {
    type Error = TensorError;

    fn try_from(value: Vec<Vec<u32>>) -> Result<Self, Self::Error> {
        TokenBatch::new(value)
    }
}

impl From<TokenBatch> for Vec<Vec<u32>> {
    fn from(batch: TokenBatch) -> Self {
        batch
            .tokens
            .chunks(batch.seq_len)
            .map(<[u32]>::to_vec)
            .collect()
    }
}

/// Anything that can hand out token batches forever.
pub trait BatchSource {
    fn next_batch(&mut self) -> PureResult<TokenBatch>;

    /// Rewinds to the first batch of a fresh pass.
    fn restart(&mut self);
}

/// In-memory split of equally long token sequences.
#[derive(Clone, Debug, Default)]
pub struct TokenDataset {
    sequences: Arc<[Vec<u32>]>,
}

impl TokenDataset {
    pub fn new(sequences: Vec<Vec<u32>>) -> Self {
        Self {
            sequences: sequences.into(),
        }
    }

    /// Reads a JSON array of token-id arrays.
    pub fn load_json<P: AsRef<Path>>(path: P) -> PureResult<Self> {
        let file = File::open(path.as_ref()).map_err(|err| TensorError::IoError {
            message: err.to_string(),
        })?;
        let sequences: Vec<Vec<u32>> = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| TensorError::SerializationError {
                message: err.to_string(),
            })?;
        Ok(Self::new(sequences))
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Infinite batch iterator. With a seed, every pass reshuffles the order
    /// deterministically; without one, passes replay the stored order.
    pub fn batches(&self, batch_size: usize, shuffle_seed: Option<u64>) -> PureResult<LoopingBatches> {
        LoopingBatches::new(self.sequences.clone(), batch_size, shuffle_seed)
    }

    /// First `batch_size` sequences as one batch, typically a fixed
    /// evaluation batch.
    pub fn head(&self, batch_size: usize) -> PureResult<TokenBatch> {
        let take = batch_size.min(self.sequences.len());
        TokenBatch::new(self.sequences[..take].to_vec())
    }
}

/// Batch iterator that wraps around at the end of the data instead of
/// stopping.
#[derive(Clone, Debug)]
pub struct LoopingBatches {
    sequences: Arc<[Vec<u32>]>,
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
    epoch: u64,
    shuffle_seed: Option<u64>,
}

impl LoopingBatches {
    pub fn new(
        sequences: Arc<[Vec<u32>]>,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> PureResult<Self> {
        if sequences.is_empty() {
            return Err(TensorError::EmptyInput("LoopingBatches"));
        }
        if batch_size == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: batch_size,
                cols: sequences.len(),
            });
        }
        let mut batches = Self {
            order: Vec::new(),
            sequences,
            batch_size,
            position: 0,
            epoch: 0,
            shuffle_seed,
        };
        batches.reorder();
        Ok(batches)
    }

    fn reorder(&mut self) {
        self.order = (0..self.sequences.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(self.epoch));
            self.order.shuffle(&mut rng);
        }
    }

    /// Number of completed passes over the data.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl BatchSource for LoopingBatches {
    fn next_batch(&mut self) -> PureResult<TokenBatch> {
        let mut rows = Vec::with_capacity(self.batch_size);
        while rows.len() < self.batch_size {
            if self.position >= self.order.len() {
                self.epoch += 1;
                self.position = 0;
                self.reorder();
            }
            rows.push(self.sequences[self.order[self.position]].clone());
            self.position += 1;
        }
        TokenBatch::new(rows)
    }

    fn restart(&mut self) {
        self.epoch = 0;
        self.position = 0;
        self.reorder();
    }
}

/// Repeats one batch forever.
#[derive(Clone, Debug)]
pub struct ConstantBatches {
    batch: TokenBatch,
}

impl ConstantBatches {
    pub fn new(batch: TokenBatch) -> Self {
        Self { batch }
    }
}

impl BatchSource for ConstantBatches {
    fn next_batch(&mut self) -> PureResult<TokenBatch> {
        Ok(self.batch.clone())
    }

    fn restart(&mut self) {}
}
