// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, TensorError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use slm_config::determinism;

/// Padded batch of token-id prefixes with their true lengths and the next
/// token to predict.
///
/// Token ids are stored row-major as `[batch, max_len]`. Construction only
/// checks that the three arrays agree on the batch dimension; the ranges of
/// lengths and ids are checked where the model indexes with them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    token_ids: Vec<usize>,
    lengths: Vec<usize>,
    targets: Vec<usize>,
    max_len: usize,
}

impl Batch {
    pub fn new(rows: Vec<Vec<usize>>, lengths: Vec<usize>, targets: Vec<usize>) -> PureResult<Self> {
        let Some(first) = rows.first() else {
            return Err(TensorError::EmptyInput("batch_rows"));
        };
        let max_len = first.len();
        if max_len == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: rows.len(),
                cols: 0,
            });
        }
        if let Some(row) = rows.iter().find(|row| row.len() != max_len) {
            return Err(TensorError::DataLength {
                expected: max_len,
                got: row.len(),
            });
        }
        for column in [&lengths, &targets] {
            if column.len() != rows.len() {
                return Err(TensorError::DataLength {
                    expected: rows.len(),
                    got: column.len(),
                });
            }
        }
        Ok(Self {
            token_ids: rows.into_iter().flatten().collect(),
            lengths,
            targets,
            max_len,
        })
    }

    /// Pads `(prefix, next_token)` examples to the longest prefix with `pad_id`.
    pub fn from_examples(examples: &[(Vec<usize>, usize)], pad_id: usize) -> PureResult<Self> {
        let max_len = examples
            .iter()
            .map(|(prefix, _)| prefix.len())
            .max()
            .unwrap_or(0);
        let mut rows = Vec::with_capacity(examples.len());
        let mut lengths = Vec::with_capacity(examples.len());
        let mut targets = Vec::with_capacity(examples.len());
        for (prefix, target) in examples {
            let mut row = prefix.clone();
            row.resize(max_len, pad_id);
            rows.push(row);
            lengths.push(prefix.len());
            targets.push(*target);
        }
        Self::new(rows, lengths, targets)
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Flattened `[batch, max_len]` token ids.
    pub fn token_ids(&self) -> &[usize] {
        &self.token_ids
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn targets(&self) -> &[usize] {
        &self.targets
    }
}

/// Supplier of batches for one pass over a dataset.
///
/// `next_batch` returns `Ok(None)` once the pass is exhausted; that is the
/// normal end-of-epoch signal, not an error.
pub trait BatchSource {
    fn next_batch(&mut self) -> PureResult<Option<Batch>>;

    /// Total batches per pass, used only for progress reporting.
    fn num_batch(&self) -> usize;
}

/// In-memory [`BatchSource`] over pre-built batches.
///
/// After signalling exhaustion the feed rewinds itself (reshuffling when a
/// shuffle RNG is installed), so the same feed serves every epoch.
#[derive(Debug)]
pub struct VecFeed {
    batches: Vec<Batch>,
    order: Vec<usize>,
    cursor: usize,
    rng: Option<StdRng>,
}

impl VecFeed {
    pub fn new(batches: Vec<Batch>) -> Self {
        let order = (0..batches.len()).collect();
        Self {
            batches,
            order,
            cursor: 0,
            rng: None,
        }
    }

    /// Chunks `(prefix, next_token)` examples into padded batches of
    /// `batch_size`; the last batch may be smaller.
    pub fn from_examples(
        examples: &[(Vec<usize>, usize)],
        batch_size: usize,
        pad_id: usize,
    ) -> PureResult<Self> {
        if batch_size == 0 {
            return Err(TensorError::InvalidValue { label: "batch_size" });
        }
        let batches = examples
            .chunks(batch_size)
            .map(|chunk| Batch::from_examples(chunk, pad_id))
            .collect::<PureResult<Vec<_>>>()?;
        Ok(Self::new(batches))
    }

    /// Shuffles batch order at the start of every pass.
    pub fn shuffled(mut self, seed: Option<u64>) -> Self {
        let mut rng = determinism::rng_from_optional(seed, "slm-nn/feed/shuffle");
        self.order.shuffle(&mut rng);
        self.rng = Some(rng);
        self
    }

    /// Restarts the pass from the first batch.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        if let Some(rng) = self.rng.as_mut() {
            self.order.shuffle(rng);
        }
    }
}

impl BatchSource for VecFeed {
    fn next_batch(&mut self) -> PureResult<Option<Batch>> {
        match self.order.get(self.cursor) {
            Some(&index) => {
                self.cursor += 1;
                Ok(Some(self.batches[index].clone()))
            }
            None => {
                self.rewind();
                Ok(None)
            }
        }
    }

    fn num_batch(&self) -> usize {
        self.batches.len()
    }
}
