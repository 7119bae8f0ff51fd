// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::init::glorot_uniform;
use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};
use slm_config::determinism::derive_seed;
use std::cell::RefCell;

/// Constant added to the forget-gate pre-activation.
pub const FORGET_BIAS: f32 = 1.0;

fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

/// LSTM layer with diagonal peephole connections that runs a padded batch of
/// variable-length sequences.
///
/// Sequences are flattened along the row axis: example `b` at timestep `t`
/// lives in row `b * max_len + t`. Gates are packed as input, forget,
/// candidate, output along the `4 * hidden_dim` axis:
///
/// ```text
/// i = σ(z_i + p_i ⊙ c_prev)
/// f = σ(z_f + 1 + p_f ⊙ c_prev)
/// g = tanh(z_g)
/// c = f ⊙ c_prev + i ⊙ g
/// o = σ(z_o + p_o ⊙ c)
/// h = o ⊙ tanh(c)
/// ```
///
/// Rows at `t >= lengths[b]` emit zeros and leave the state of example `b`
/// untouched, so padding never leaks into it. Every batch starts from a zero
/// state.
#[derive(Debug)]
pub struct PeepholeLstm {
    input_dim: usize,
    hidden_dim: usize,
    weight_ih: Parameter,
    weight_hh: Parameter,
    bias: Parameter,
    peephole_i: Parameter,
    peephole_f: Parameter,
    peephole_o: Parameter,
    cache: RefCell<Option<LstmCache>>,
}

#[derive(Debug, Clone)]
struct LstmCache {
    lengths: Vec<usize>,
    max_len: usize,
    hidden_prev: Vec<f32>,
    cell_prev: Vec<f32>,
    cell: Vec<f32>,
    gates_i: Vec<f32>,
    gates_f: Vec<f32>,
    gates_g: Vec<f32>,
    gates_o: Vec<f32>,
}

impl LstmCache {
    fn new(lengths: &[usize], max_len: usize, hidden_dim: usize) -> Self {
        let size = lengths.len() * max_len * hidden_dim;
        Self {
            lengths: lengths.to_vec(),
            max_len,
            hidden_prev: vec![0.0; size],
            cell_prev: vec![0.0; size],
            cell: vec![0.0; size],
            gates_i: vec![0.0; size],
            gates_f: vec![0.0; size],
            gates_g: vec![0.0; size],
            gates_o: vec![0.0; size],
        }
    }
}

impl PeepholeLstm {
    /// Creates a layer with Glorot-initialised weights, zero bias and zero
    /// peepholes. Parameters are named `{name}::weight_ih`, `{name}::weight_hh`,
    /// `{name}::bias` and `{name}::peephole_{i,f,o}`.
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        hidden_dim: usize,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if input_dim == 0 || hidden_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: hidden_dim,
            });
        }
        let name = name.into();
        let weight_ih = glorot_uniform(
            input_dim,
            4 * hidden_dim,
            derive_seed(seed, &format!("{name}::weight_ih")),
        )?;
        let weight_hh = glorot_uniform(
            hidden_dim,
            4 * hidden_dim,
            derive_seed(seed, &format!("{name}::weight_hh")),
        )?;
        Ok(Self {
            input_dim,
            hidden_dim,
            weight_ih: Parameter::new(format!("{name}::weight_ih"), weight_ih),
            weight_hh: Parameter::new(format!("{name}::weight_hh"), weight_hh),
            bias: Parameter::new(format!("{name}::bias"), Tensor::zeros(1, 4 * hidden_dim)?),
            peephole_i: Parameter::new(
                format!("{name}::peephole_i"),
                Tensor::zeros(1, hidden_dim)?,
            ),
            peephole_f: Parameter::new(
                format!("{name}::peephole_f"),
                Tensor::zeros(1, hidden_dim)?,
            ),
            peephole_o: Parameter::new(
                format!("{name}::peephole_o"),
                Tensor::zeros(1, hidden_dim)?,
            ),
            cache: RefCell::new(None),
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    fn guard_input(&self, input: &Tensor, lengths: &[usize], max_len: usize) -> PureResult<()> {
        if lengths.is_empty() || max_len == 0 {
            return Err(TensorError::EmptyInput("lstm_forward"));
        }
        let expected = (lengths.len() * max_len, self.input_dim);
        if input.shape() != expected {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: expected,
            });
        }
        if let Some(&len) = lengths.iter().find(|&&len| len > max_len) {
            return Err(TensorError::IndexOutOfBounds {
                label: "sequence_length",
                index: len as i64,
                len: max_len,
            });
        }
        Ok(())
    }

    /// Runs the padded batch, returning `(lengths.len() * max_len, hidden_dim)`.
    pub fn forward_masked(
        &self,
        input: &Tensor,
        lengths: &[usize],
        max_len: usize,
    ) -> PureResult<Tensor> {
        self.guard_input(input, lengths, max_len)?;
        let batch = lengths.len();
        let hidden_dim = self.hidden_dim;
        let input_dim = self.input_dim;
        let gate_width = 4 * hidden_dim;
        let mut cache = LstmCache::new(lengths, max_len, hidden_dim);
        let mut output = vec![0.0f32; batch * max_len * hidden_dim];
        let mut hidden = vec![0.0f32; batch * hidden_dim];
        let mut cell = vec![0.0f32; batch * hidden_dim];
        let weight_ih = self.weight_ih.value().data();
        let weight_hh = self.weight_hh.value().data();
        let bias = self.bias.value().data();
        let p_i = self.peephole_i.value().data();
        let p_f = self.peephole_f.value().data();
        let p_o = self.peephole_o.value().data();
        let mut gates = vec![0.0f32; gate_width];
        for t in 0..max_len {
            for (b, &len) in lengths.iter().enumerate() {
                if t >= len {
                    continue;
                }
                let row = b * max_len + t;
                let x = &input.data()[row * input_dim..(row + 1) * input_dim];
                let h_prev = &hidden[b * hidden_dim..(b + 1) * hidden_dim];
                gates.copy_from_slice(bias);
                for (k, &xk) in x.iter().enumerate() {
                    let w_row = &weight_ih[k * gate_width..(k + 1) * gate_width];
                    for (gate, w) in gates.iter_mut().zip(w_row) {
                        *gate += xk * w;
                    }
                }
                for (k, &hk) in h_prev.iter().enumerate() {
                    let w_row = &weight_hh[k * gate_width..(k + 1) * gate_width];
                    for (gate, w) in gates.iter_mut().zip(w_row) {
                        *gate += hk * w;
                    }
                }
                let base = row * hidden_dim;
                for unit in 0..hidden_dim {
                    let state = b * hidden_dim + unit;
                    let c_prev = cell[state];
                    let gi = sigmoid(gates[unit] + p_i[unit] * c_prev);
                    let gf = sigmoid(gates[hidden_dim + unit] + FORGET_BIAS + p_f[unit] * c_prev);
                    let gg = gates[2 * hidden_dim + unit].tanh();
                    let c = gf * c_prev + gi * gg;
                    let go = sigmoid(gates[3 * hidden_dim + unit] + p_o[unit] * c);
                    let h = go * c.tanh();
                    cache.hidden_prev[base + unit] = hidden[state];
                    cache.cell_prev[base + unit] = c_prev;
                    cache.cell[base + unit] = c;
                    cache.gates_i[base + unit] = gi;
                    cache.gates_f[base + unit] = gf;
                    cache.gates_g[base + unit] = gg;
                    cache.gates_o[base + unit] = go;
                    output[base + unit] = h;
                }
                hidden[b * hidden_dim..(b + 1) * hidden_dim]
                    .copy_from_slice(&output[base..base + hidden_dim]);
                for unit in 0..hidden_dim {
                    cell[b * hidden_dim + unit] = cache.cell[base + unit];
                }
            }
        }
        *self.cache.borrow_mut() = Some(cache);
        Tensor::from_vec(batch * max_len, hidden_dim, output)
    }

    /// Back-propagates through time over the valid steps of the last
    /// [`PeepholeLstm::forward_masked`] call and returns the input gradient.
    pub fn backward_masked(
        &mut self,
        input: &Tensor,
        lengths: &[usize],
        max_len: usize,
        grad_output: &Tensor,
    ) -> PureResult<Tensor> {
        self.guard_input(input, lengths, max_len)?;
        let rows = lengths.len() * max_len;
        if grad_output.shape() != (rows, self.hidden_dim) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (rows, self.hidden_dim),
            });
        }
        let cache = self
            .cache
            .borrow_mut()
            .take()
            .ok_or(TensorError::InvalidValue {
                label: "lstm_cache_missing",
            })?;
        if cache.lengths != lengths || cache.max_len != max_len {
            return Err(TensorError::InvalidValue {
                label: "lstm_cache_mismatch",
            });
        }
        let hidden_dim = self.hidden_dim;
        let input_dim = self.input_dim;
        let gate_width = 4 * hidden_dim;
        let batch = lengths.len();
        let weight_ih = self.weight_ih.value().data();
        let weight_hh = self.weight_hh.value().data();
        let p_i = self.peephole_i.value().data();
        let p_f = self.peephole_f.value().data();
        let p_o = self.peephole_o.value().data();
        let grad_out = grad_output.data();

        let mut grad_input = vec![0.0f32; rows * input_dim];
        let mut grad_w_ih = vec![0.0f32; input_dim * gate_width];
        let mut grad_w_hh = vec![0.0f32; hidden_dim * gate_width];
        let mut grad_bias = vec![0.0f32; gate_width];
        let mut grad_p_i = vec![0.0f32; hidden_dim];
        let mut grad_p_f = vec![0.0f32; hidden_dim];
        let mut grad_p_o = vec![0.0f32; hidden_dim];
        let mut grad_h_next = vec![0.0f32; batch * hidden_dim];
        let mut grad_c_next = vec![0.0f32; batch * hidden_dim];
        let mut gate_grad = vec![0.0f32; gate_width];

        for t in (0..max_len).rev() {
            for (b, &len) in lengths.iter().enumerate() {
                if t >= len {
                    continue;
                }
                let row = b * max_len + t;
                let base = row * hidden_dim;
                for unit in 0..hidden_dim {
                    let state = b * hidden_dim + unit;
                    let i = cache.gates_i[base + unit];
                    let f = cache.gates_f[base + unit];
                    let g = cache.gates_g[base + unit];
                    let o = cache.gates_o[base + unit];
                    let c = cache.cell[base + unit];
                    let c_prev = cache.cell_prev[base + unit];
                    let dh = grad_out[base + unit] + grad_h_next[state];
                    let tanh_c = c.tanh();
                    let d_o = dh * tanh_c * o * (1.0 - o);
                    let dc = dh * o * (1.0 - tanh_c * tanh_c) + grad_c_next[state] + d_o * p_o[unit];
                    let d_i = dc * g * i * (1.0 - i);
                    let d_g = dc * i * (1.0 - g * g);
                    let d_f = dc * c_prev * f * (1.0 - f);
                    grad_p_o[unit] += d_o * c;
                    grad_p_i[unit] += d_i * c_prev;
                    grad_p_f[unit] += d_f * c_prev;
                    grad_c_next[state] = dc * f + d_i * p_i[unit] + d_f * p_f[unit];
                    gate_grad[unit] = d_i;
                    gate_grad[hidden_dim + unit] = d_f;
                    gate_grad[2 * hidden_dim + unit] = d_g;
                    gate_grad[3 * hidden_dim + unit] = d_o;
                }
                for (acc, g) in grad_bias.iter_mut().zip(&gate_grad) {
                    *acc += g;
                }
                let x = &input.data()[row * input_dim..(row + 1) * input_dim];
                for (k, &xk) in x.iter().enumerate() {
                    let w_row = &weight_ih[k * gate_width..(k + 1) * gate_width];
                    let gw_row = &mut grad_w_ih[k * gate_width..(k + 1) * gate_width];
                    let mut acc = 0.0f32;
                    for gate in 0..gate_width {
                        acc += gate_grad[gate] * w_row[gate];
                        gw_row[gate] += xk * gate_grad[gate];
                    }
                    grad_input[row * input_dim + k] = acc;
                }
                let h_prev = &cache.hidden_prev[base..base + hidden_dim];
                for (k, &hk) in h_prev.iter().enumerate() {
                    let w_row = &weight_hh[k * gate_width..(k + 1) * gate_width];
                    let gw_row = &mut grad_w_hh[k * gate_width..(k + 1) * gate_width];
                    let mut acc = 0.0f32;
                    for gate in 0..gate_width {
                        acc += gate_grad[gate] * w_row[gate];
                        gw_row[gate] += hk * gate_grad[gate];
                    }
                    grad_h_next[b * hidden_dim + k] = acc;
                }
            }
        }

        let grad_w_ih = Tensor::from_vec(input_dim, gate_width, grad_w_ih)?;
        let grad_w_hh = Tensor::from_vec(hidden_dim, gate_width, grad_w_hh)?;
        let grad_bias = Tensor::from_vec(1, gate_width, grad_bias)?;
        let grad_p_i = Tensor::from_vec(1, hidden_dim, grad_p_i)?;
        let grad_p_f = Tensor::from_vec(1, hidden_dim, grad_p_f)?;
        let grad_p_o = Tensor::from_vec(1, hidden_dim, grad_p_o)?;
        self.weight_ih.accumulate_euclidean(&grad_w_ih)?;
        self.weight_hh.accumulate_euclidean(&grad_w_hh)?;
        self.bias.accumulate_euclidean(&grad_bias)?;
        self.peephole_i.accumulate_euclidean(&grad_p_i)?;
        self.peephole_f.accumulate_euclidean(&grad_p_f)?;
        self.peephole_o.accumulate_euclidean(&grad_p_o)?;
        Tensor::from_vec(rows, input_dim, grad_input)
    }
}

impl Parameterized for PeepholeLstm {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight_ih)?;
        visitor(&self.weight_hh)?;
        visitor(&self.bias)?;
        visitor(&self.peephole_i)?;
        visitor(&self.peephole_f)?;
        visitor(&self.peephole_o)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight_ih)?;
        visitor(&mut self.weight_hh)?;
        visitor(&mut self.bias)?;
        visitor(&mut self.peephole_i)?;
        visitor(&mut self.peephole_f)?;
        visitor(&mut self.peephole_o)
    }
}

/// Treats the whole input as one unpadded sequence.
impl Module for PeepholeLstm {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let steps = input.shape().0;
        self.forward_masked(input, &[steps], steps)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let steps = input.shape().0;
        self.backward_masked(input, &[steps], steps, grad_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn peephole_lstm(input_dim: usize, hidden_dim: usize) -> PeepholeLstm {
        let mut lstm = PeepholeLstm::new("cell", input_dim, hidden_dim, Some(17)).unwrap();
        // non-zero peepholes so their gradients are exercised
        lstm.visit_parameters_mut(&mut |param| {
            if param.name().contains("peephole") {
                let shape = param.value().shape();
                let value = Tensor::from_fn(shape.0, shape.1, |_, c| 0.1 * (c as f32 + 1.0))?;
                param.load_value(&value)?;
            }
            Ok(())
        })
        .unwrap();
        lstm
    }

    #[test]
    fn padded_rows_emit_zeros_and_do_not_leak() {
        let lstm = peephole_lstm(2, 3);
        let padded = Tensor::from_vec(
            6,
            2,
            vec![0.5, -0.2, 0.1, 0.4, 9.0, 9.0, 0.3, 0.3, -0.7, 0.2, 0.6, -0.1],
        )
        .unwrap();
        let output = lstm.forward_masked(&padded, &[2, 3], 3).unwrap();
        assert_eq!(output.shape(), (6, 3));
        assert!(output.row(2).unwrap().iter().all(|v| *v == 0.0));

        let alone = Tensor::from_vec(2, 2, vec![0.5, -0.2, 0.1, 0.4]).unwrap();
        let reference = lstm.forward(&alone).unwrap();
        for step in 0..2 {
            let got = output.row(step).unwrap();
            let want = reference.row(step).unwrap();
            for (a, b) in got.iter().zip(want) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn rejects_lengths_beyond_max_len() {
        let lstm = peephole_lstm(2, 2);
        let input = Tensor::zeros(4, 2).unwrap();
        let err = lstm.forward_masked(&input, &[2, 3], 2).unwrap_err();
        assert!(matches!(
            err,
            TensorError::IndexOutOfBounds {
                label: "sequence_length",
                ..
            }
        ));
    }

    #[test]
    fn backward_without_forward_fails() {
        let mut lstm = peephole_lstm(2, 2);
        let input = Tensor::zeros(2, 2).unwrap();
        let grad = Tensor::zeros(2, 2).unwrap();
        assert!(lstm.backward(&input, &grad).is_err());
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut lstm = peephole_lstm(2, 3);
        let lengths = [3usize, 2];
        let max_len = 3;
        let input = Tensor::from_fn(6, 2, |r, c| ((r * 2 + c) as f32 * 0.37).sin()).unwrap();
        let weights = Tensor::from_fn(6, 3, |r, c| ((r * 3 + c) as f32 * 0.91).cos()).unwrap();
        let objective = |lstm: &PeepholeLstm| -> f32 {
            let out = lstm.forward_masked(&input, &lengths, max_len).unwrap();
            out.hadamard(&weights).unwrap().data().iter().sum()
        };

        let _ = lstm.forward_masked(&input, &lengths, max_len).unwrap();
        let grad_input = lstm
            .backward_masked(&input, &lengths, max_len, &weights)
            .unwrap();
        let mut analytic: HashMap<String, Tensor> = HashMap::new();
        lstm.visit_parameters(&mut |param| {
            analytic.insert(param.name().to_string(), param.gradient().unwrap().clone());
            Ok(())
        })
        .unwrap();

        let eps = 1e-2f32;
        let base = lstm.state_dict().unwrap();
        for (name, grad) in &analytic {
            for index in [0usize, grad.len() / 2, grad.len() - 1] {
                let mut plus = base.clone();
                plus.get_mut(name).unwrap().data_mut()[index] += eps;
                lstm.load_state_dict(&plus).unwrap();
                let f_plus = objective(&lstm);
                let mut minus = base.clone();
                minus.get_mut(name).unwrap().data_mut()[index] -= eps;
                lstm.load_state_dict(&minus).unwrap();
                let f_minus = objective(&lstm);
                let numeric = (f_plus - f_minus) / (2.0 * eps);
                let got = grad.data()[index];
                assert!(
                    (numeric - got).abs() <= 2e-3 + 2e-2 * numeric.abs(),
                    "{name}[{index}]: analytic {got} vs numeric {numeric}"
                );
            }
        }
        lstm.load_state_dict(&base).unwrap();
        // padded rows receive no input gradient
        assert!(grad_input.row(5).unwrap().iter().all(|v| *v == 0.0));
    }
}
