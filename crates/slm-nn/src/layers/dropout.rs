// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};
use rand::{rngs::StdRng, Rng};
use slm_config::determinism;
use std::cell::{Cell, RefCell};

/// Inverted output dropout driven by a keep-probability bound before each
/// forward pass.
///
/// A keep-probability of `1.0` turns the layer into the identity. Any other
/// value samples a fresh mask per forward call and scales kept units by
/// `1 / keep_prob`, so activations keep their expectation.
pub struct Dropout {
    keep_prob: Cell<f32>,
    rng: RefCell<StdRng>,
    last_mask: RefCell<Option<Tensor>>,
}

impl core::fmt::Debug for Dropout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dropout")
            .field("keep_prob", &self.keep_prob.get())
            .finish()
    }
}

impl Dropout {
    /// Builds a dropout layer; the seed falls back to the process-wide
    /// determinism settings when absent.
    pub fn with_seed(seed: Option<u64>) -> Self {
        Self {
            keep_prob: Cell::new(1.0),
            rng: RefCell::new(determinism::rng_from_optional(seed, "slm-nn/dropout")),
            last_mask: RefCell::new(None),
        }
    }

    /// Returns the keep-probability currently bound to the layer.
    pub fn keep_prob(&self) -> f32 {
        self.keep_prob.get()
    }

    /// Binds the keep-probability used by subsequent forward passes.
    pub fn set_keep_prob(&self, keep_prob: f32) -> PureResult<()> {
        if !(keep_prob > 0.0 && keep_prob <= 1.0) {
            return Err(TensorError::InvalidValue {
                label: "dropout_keep_prob",
            });
        }
        self.keep_prob.set(keep_prob);
        if keep_prob == 1.0 {
            self.last_mask.borrow_mut().take();
        }
        Ok(())
    }

    fn sample_mask(&self, rows: usize, cols: usize, keep_prob: f32) -> PureResult<Tensor> {
        let scale = 1.0 / keep_prob;
        let mut rng = self.rng.borrow_mut();
        let mut mask = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            if rng.gen::<f32>() < keep_prob {
                mask.push(scale);
            } else {
                mask.push(0.0);
            }
        }
        Tensor::from_vec(rows, cols, mask)
    }
}

impl Parameterized for Dropout {
    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

impl Module for Dropout {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let keep_prob = self.keep_prob.get();
        if keep_prob >= 1.0 {
            self.last_mask.borrow_mut().take();
            return Ok(input.clone());
        }
        let (rows, cols) = input.shape();
        let mask = self.sample_mask(rows, cols, keep_prob)?;
        let output = input.hadamard(&mask)?;
        self.last_mask.borrow_mut().replace(mask);
        Ok(output)
    }

    fn backward(&mut self, _input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if self.keep_prob.get() >= 1.0 {
            return Ok(grad_output.clone());
        }
        let Some(mask) = self.last_mask.borrow_mut().take() else {
            return Err(TensorError::InvalidValue {
                label: "dropout_mask",
            });
        };
        grad_output.hadamard(&mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropout_rejects_invalid_keep_prob() {
        let dropout = Dropout::with_seed(Some(1));
        assert!(dropout.set_keep_prob(0.0).is_err());
        assert!(dropout.set_keep_prob(1.5).is_err());
        assert!(dropout.set_keep_prob(f32::NAN).is_err());
        assert_eq!(dropout.keep_prob(), 1.0);
    }

    #[test]
    fn dropout_forward_and_backward_share_mask() {
        let mut dropout = Dropout::with_seed(Some(42));
        dropout.set_keep_prob(0.5).unwrap();
        let input = Tensor::from_vec(2, 3, vec![1.0; 6]).unwrap();
        let output = dropout.forward(&input).unwrap();
        assert!(output.data().iter().all(|v| *v == 0.0 || *v == 2.0));

        let grad = Tensor::from_vec(2, 3, vec![1.0; 6]).unwrap();
        let grad_in = dropout.backward(&input, &grad).unwrap();
        assert_eq!(grad_in, output);
    }

    #[test]
    fn dropout_full_keep_is_identity() {
        let mut dropout = Dropout::with_seed(Some(7));
        let input = Tensor::from_vec(1, 4, vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(dropout.forward(&input).unwrap(), input);
        let grad = Tensor::from_vec(1, 4, vec![1.0, -1.0, 0.5, -0.5]).unwrap();
        assert_eq!(dropout.backward(&input, &grad).unwrap(), grad);
    }
}
