// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Embedding plus stacked peephole LSTM encoder with last-relevant extraction.

use crate::feed::Batch;
use crate::layers::{Dropout, Embedding, PeepholeLstm};
use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};
use slm_config::determinism::derive_seed;
use std::cell::{Cell, RefCell};
use tracing::debug;

/// Gathers, for every example `b`, the output row at its last real timestep:
/// row `b * max_len + (lengths[b] - 1)` of the flattened `[batch * max_len,
/// hidden]` outputs.
///
/// A zero length yields the offset `b * max_len - 1`; for `b = 0` that is
/// negative and the gather fails with [`TensorError::IndexOutOfBounds`].
pub fn last_relevant(outputs: &Tensor, lengths: &[usize], max_len: usize) -> PureResult<Tensor> {
    let offsets: Vec<i64> = lengths
        .iter()
        .enumerate()
        .map(|(b, &len)| (b * max_len + len) as i64 - 1)
        .collect();
    outputs.gather_rows(&offsets)
}

/// Adjoint of [`last_relevant`]: places each gradient row back at its
/// example's last real timestep inside a zero `[lengths.len() * max_len,
/// hidden]` tensor.
pub fn scatter_last_relevant(
    grad: &Tensor,
    lengths: &[usize],
    max_len: usize,
) -> PureResult<Tensor> {
    let (batch, hidden) = grad.shape();
    if batch != lengths.len() {
        return Err(TensorError::DataLength {
            expected: lengths.len(),
            got: batch,
        });
    }
    let rows = batch * max_len;
    let mut out = Tensor::zeros(rows, hidden)?;
    let data = out.data_mut();
    for (b, &len) in lengths.iter().enumerate() {
        let offset = (b * max_len + len) as i64 - 1;
        let row = usize::try_from(offset)
            .ok()
            .filter(|&row| row < rows)
            .ok_or(TensorError::IndexOutOfBounds {
                label: "scatter_last_relevant",
                index: offset,
                len: rows,
            })?;
        let src = grad.row(b)?;
        for (dst, g) in data[row * hidden..(row + 1) * hidden].iter_mut().zip(src) {
            *dst += g;
        }
    }
    Ok(out)
}

#[derive(Debug)]
struct EncoderLayer {
    lstm: PeepholeLstm,
    dropout: Option<Dropout>,
}

#[derive(Debug)]
struct EncoderCache {
    token_ids: Vec<usize>,
    lengths: Vec<usize>,
    max_len: usize,
    layer_inputs: Vec<Tensor>,
    lstm_outputs: Vec<Tensor>,
}

/// Embedding lookup followed by `num_layer` stacked peephole LSTMs, each
/// wrapped in optional output dropout.
///
/// Parameters are named `word-embedding::embedding_w` and
/// `rnn::cell_<l>::{weight_ih, weight_hh, bias, peephole_i, peephole_f,
/// peephole_o}`.
#[derive(Debug)]
pub struct SequenceEncoder {
    embedding: Embedding,
    layers: Vec<EncoderLayer>,
    keep_prob: Cell<f32>,
    cache: RefCell<Option<EncoderCache>>,
}

impl SequenceEncoder {
    pub fn new(
        vocab_size: usize,
        embedding_size: usize,
        cell_size: usize,
        num_layer: usize,
        use_dropout: bool,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if num_layer == 0 {
            return Err(TensorError::InvalidValue { label: "num_layer" });
        }
        let embedding = Embedding::new(
            "word-embedding",
            vocab_size,
            embedding_size,
            derive_seed(seed, "word-embedding"),
        )?;
        let mut layers = Vec::with_capacity(num_layer);
        for layer in 0..num_layer {
            let name = format!("rnn::cell_{layer}");
            let input_dim = if layer == 0 { embedding_size } else { cell_size };
            let lstm = PeepholeLstm::new(&name, input_dim, cell_size, derive_seed(seed, &name))?;
            let dropout = use_dropout
                .then(|| Dropout::with_seed(derive_seed(seed, &format!("{name}::dropout"))));
            layers.push(EncoderLayer { lstm, dropout });
        }
        Ok(Self {
            embedding,
            layers,
            keep_prob: Cell::new(1.0),
            cache: RefCell::new(None),
        })
    }

    pub fn num_layer(&self) -> usize {
        self.layers.len()
    }

    pub fn cell_size(&self) -> usize {
        self.layers[0].lstm.hidden_dim()
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    /// Whether output dropout layers exist at all.
    pub fn uses_dropout(&self) -> bool {
        self.layers.iter().any(|layer| layer.dropout.is_some())
    }

    /// Keep-probability bound by the most recent [`SequenceEncoder::bind_keep_prob`].
    pub fn keep_prob(&self) -> f32 {
        self.keep_prob.get()
    }

    /// Keep-probability currently held by each dropout layer, bottom to top.
    /// Empty when dropout is disabled.
    pub fn dropout_keep_probs(&self) -> Vec<f32> {
        self.layers
            .iter()
            .filter_map(|layer| layer.dropout.as_ref().map(Dropout::keep_prob))
            .collect()
    }

    /// Binds the dropout keep-probability for subsequent forward passes. The
    /// value is recorded even when dropout is disabled.
    pub fn bind_keep_prob(&self, keep_prob: f32) -> PureResult<()> {
        for layer in &self.layers {
            if let Some(dropout) = &layer.dropout {
                dropout.set_keep_prob(keep_prob)?;
            }
        }
        self.keep_prob.set(keep_prob);
        Ok(())
    }

    /// Runs the stack over the padded batch and returns every timestep of the
    /// top layer, shaped `[batch * max_len, cell_size]`.
    pub fn forward(&self, batch: &Batch) -> PureResult<Tensor> {
        let lengths = batch.lengths();
        let max_len = batch.max_len();
        let mut hidden = self.embedding.lookup(batch.token_ids())?;
        let mut layer_inputs = Vec::with_capacity(self.layers.len());
        let mut lstm_outputs = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let output = layer.lstm.forward_masked(&hidden, lengths, max_len)?;
            layer_inputs.push(hidden);
            hidden = match &layer.dropout {
                Some(dropout) => dropout.forward(&output)?,
                None => output.clone(),
            };
            lstm_outputs.push(output);
        }
        debug!(
            batch = batch.batch_size(),
            max_len,
            keep_prob = self.keep_prob.get(),
            "encoded batch"
        );
        *self.cache.borrow_mut() = Some(EncoderCache {
            token_ids: batch.token_ids().to_vec(),
            lengths: lengths.to_vec(),
            max_len,
            layer_inputs,
            lstm_outputs,
        });
        Ok(hidden)
    }

    /// Hidden state at each example's last real timestep, `[batch, cell_size]`.
    pub fn encode(&self, batch: &Batch) -> PureResult<Tensor> {
        let outputs = self.forward(batch)?;
        last_relevant(&outputs, batch.lengths(), batch.max_len())
    }

    /// Back-propagates a gradient on the top-layer outputs through dropout,
    /// every LSTM layer and the embedding table.
    pub fn backward(&mut self, grad_output: &Tensor) -> PureResult<()> {
        let cache = self
            .cache
            .borrow_mut()
            .take()
            .ok_or(TensorError::InvalidValue {
                label: "encoder_cache_missing",
            })?;
        let mut grad = grad_output.clone();
        for (index, layer) in self.layers.iter_mut().enumerate().rev() {
            if let Some(dropout) = layer.dropout.as_mut() {
                grad = dropout.backward(&cache.lstm_outputs[index], &grad)?;
            }
            grad = layer.lstm.backward_masked(
                &cache.layer_inputs[index],
                &cache.lengths,
                cache.max_len,
                &grad,
            )?;
        }
        self.embedding.backward(&cache.token_ids, &grad)
    }
}

impl Parameterized for SequenceEncoder {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.embedding.visit_parameters(visitor)?;
        for layer in &self.layers {
            layer.lstm.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.embedding.visit_parameters_mut(visitor)?;
        for layer in &mut self.layers {
            layer.lstm.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker_outputs(batch: usize, max_len: usize, hidden: usize) -> Tensor {
        // example b at step t carries 10 * b + t in every unit
        Tensor::from_fn(batch * max_len, hidden, |row, _| {
            (10 * (row / max_len) + row % max_len) as f32
        })
        .unwrap()
    }

    #[test]
    fn last_relevant_picks_final_real_step() {
        let outputs = marker_outputs(2, 4, 3);
        let picked = last_relevant(&outputs, &[2, 4], 4).unwrap();
        assert_eq!(picked.shape(), (2, 3));
        assert_eq!(picked.row(0).unwrap(), &[1.0, 1.0, 1.0]);
        assert_eq!(picked.row(1).unwrap(), &[13.0, 13.0, 13.0]);
    }

    #[test]
    fn zero_length_first_example_is_out_of_bounds() {
        let outputs = marker_outputs(2, 3, 2);
        let err = last_relevant(&outputs, &[0, 2], 3).unwrap_err();
        assert!(matches!(
            err,
            TensorError::IndexOutOfBounds { index: -1, .. }
        ));
    }

    #[test]
    fn scatter_is_adjoint_of_gather() {
        let grad = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let scattered = scatter_last_relevant(&grad, &[1, 3], 3).unwrap();
        assert_eq!(scattered.shape(), (6, 2));
        assert_eq!(scattered.row(0).unwrap(), &[1.0, 2.0]);
        assert_eq!(scattered.row(5).unwrap(), &[3.0, 4.0]);
        assert_eq!(scattered.squared_l2_norm(), 30.0);
        assert_eq!(last_relevant(&scattered, &[1, 3], 3).unwrap(), grad);
    }

    #[test]
    fn encoding_ignores_padding_tokens() {
        let encoder = SequenceEncoder::new(6, 3, 4, 2, true, Some(5)).unwrap();
        encoder.bind_keep_prob(1.0).unwrap();
        let short = Batch::new(vec![vec![1, 2, 3]], vec![3], vec![4]).unwrap();
        let padded = Batch::new(
            vec![vec![1, 2, 3, 0, 0, 0], vec![5, 4, 0, 0, 0, 0]],
            vec![3, 2],
            vec![4, 1],
        )
        .unwrap();
        let a = encoder.encode(&short).unwrap();
        let b = encoder.encode(&padded).unwrap();
        for (x, y) in a.row(0).unwrap().iter().zip(b.row(0).unwrap()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn bind_keep_prob_records_value_without_dropout() {
        let encoder = SequenceEncoder::new(4, 2, 3, 1, false, Some(1)).unwrap();
        assert!(!encoder.uses_dropout());
        encoder.bind_keep_prob(0.5).unwrap();
        assert_eq!(encoder.keep_prob(), 0.5);
    }

    #[test]
    fn parameter_names_follow_layer_scopes() {
        let encoder = SequenceEncoder::new(4, 2, 3, 2, true, Some(1)).unwrap();
        let state = encoder.state_dict().unwrap();
        assert_eq!(state.len(), 1 + 2 * 6);
        assert!(state.contains_key("word-embedding::embedding_w"));
        assert!(state.contains_key("rnn::cell_1::peephole_o"));
        assert_eq!(state["rnn::cell_1::weight_ih"].shape(), (3, 12));
        assert_eq!(state["rnn::cell_0::weight_ih"].shape(), (2, 12));
    }
}
