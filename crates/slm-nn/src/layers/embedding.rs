// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::init::glorot_uniform;
use crate::module::{Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};
use slm_config::determinism::derive_seed;

/// Embedding lookup table without a bias term.
///
/// Token ids are plain `usize` values; an id outside the vocabulary is a
/// precondition violation reported as [`TensorError::IndexOutOfBounds`].
/// Lookups return one row per id, shaped `(ids.len(), embed_dim)`.
#[derive(Debug)]
pub struct Embedding {
    weight: Parameter,
    vocab_size: usize,
    embed_dim: usize,
}

impl Embedding {
    pub fn new(
        name: impl Into<String>,
        vocab_size: usize,
        embed_dim: usize,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if vocab_size == 0 || embed_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: vocab_size,
                cols: embed_dim,
            });
        }
        let name = name.into();
        let weight = glorot_uniform(
            vocab_size,
            embed_dim,
            derive_seed(seed, &format!("{name}::embedding_w")),
        )?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::embedding_w"), weight),
            vocab_size,
            embed_dim,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    fn check_id(&self, id: usize) -> PureResult<usize> {
        if id >= self.vocab_size {
            return Err(TensorError::IndexOutOfBounds {
                label: "embedding_lookup",
                index: id as i64,
                len: self.vocab_size,
            });
        }
        Ok(id)
    }

    pub fn lookup(&self, ids: &[usize]) -> PureResult<Tensor> {
        if ids.is_empty() {
            return Err(TensorError::EmptyInput("embedding_lookup"));
        }
        let weights = self.weight.value().data();
        let mut out = Vec::with_capacity(ids.len() * self.embed_dim);
        for &id in ids {
            let start = self.check_id(id)? * self.embed_dim;
            out.extend_from_slice(&weights[start..start + self.embed_dim]);
        }
        Tensor::from_vec(ids.len(), self.embed_dim, out)
    }

    /// Scatters `grad_output` rows back into the rows that were looked up.
    pub fn backward(&mut self, ids: &[usize], grad_output: &Tensor) -> PureResult<()> {
        if grad_output.shape() != (ids.len(), self.embed_dim) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (ids.len(), self.embed_dim),
            });
        }
        let grad_data = grad_output.data();
        let mut grad_weight = vec![0.0f32; self.vocab_size * self.embed_dim];
        for (row, &id) in ids.iter().enumerate() {
            let base = self.check_id(id)? * self.embed_dim;
            let src = &grad_data[row * self.embed_dim..(row + 1) * self.embed_dim];
            for (dst, g) in grad_weight[base..base + self.embed_dim].iter_mut().zip(src) {
                *dst += g;
            }
        }
        let grad_w = Tensor::from_vec(self.vocab_size, self.embed_dim, grad_weight)?;
        self.weight.accumulate_euclidean(&grad_w)
    }
}

impl Parameterized for Embedding {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_lookup_picks_rows() {
        let layer = Embedding::new("emb", 4, 3, Some(1)).unwrap();
        let output = layer.lookup(&[0, 1, 3, 2, 1, 0]).unwrap();
        assert_eq!(output.shape(), (6, 3));
        let weights = layer.weight().value();
        for (row, id) in [0usize, 1, 3, 2, 1, 0].iter().enumerate() {
            assert_eq!(output.row(row).unwrap(), weights.row(*id).unwrap());
        }
    }

    #[test]
    fn embedding_rejects_out_of_vocab_ids() {
        let layer = Embedding::new("emb", 4, 2, Some(1)).unwrap();
        let err = layer.lookup(&[1, 4]).unwrap_err();
        assert_eq!(
            err,
            TensorError::IndexOutOfBounds {
                label: "embedding_lookup",
                index: 4,
                len: 4
            }
        );
    }

    #[test]
    fn embedding_backward_scatters_repeated_ids() {
        let mut layer = Embedding::new("emb", 3, 2, Some(2)).unwrap();
        let ids = [2usize, 0, 2];
        let grad = Tensor::from_vec(3, 2, vec![1.0, 1.0, 0.5, 0.5, 2.0, -1.0]).unwrap();
        layer.backward(&ids, &grad).unwrap();
        let g = layer.weight().gradient().unwrap();
        assert_eq!(g.row(0).unwrap(), &[0.5, 0.5]);
        assert_eq!(g.row(1).unwrap(), &[0.0, 0.0]);
        assert_eq!(g.row(2).unwrap(), &[3.0, 0.0]);
    }
}
