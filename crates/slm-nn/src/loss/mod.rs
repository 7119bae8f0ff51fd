// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

mod l2;
mod sparse_cross_entropy;

use crate::{PureResult, Tensor};

pub use l2::{accumulate_l2_gradient, l2_penalty};
pub use sparse_cross_entropy::SparseSoftmaxCrossEntropy;

/// Trait implemented by differentiable losses over class-index targets.
pub trait Loss {
    /// Computes the batch-mean loss for the given predictions and targets.
    fn forward(&mut self, prediction: &Tensor, target: &[usize]) -> PureResult<f32>;

    /// Returns the gradient of the batch-mean loss with respect to the predictions.
    fn backward(&mut self, prediction: &Tensor, target: &[usize]) -> PureResult<Tensor>;
}

/// Scalars produced for one batch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossReport {
    /// Mean cross-entropy over the batch.
    pub loss: f32,
    /// `exp(loss)`.
    pub perplexity: f32,
    /// Sum of squared norms of every non-bias parameter.
    pub l2_term: f32,
    /// `loss + l2_coef * l2_term`, the objective the optimiser minimises.
    pub regularized_loss: f32,
}

impl LossReport {
    pub fn new(loss: f32, l2_term: f32, l2_coef: f32) -> Self {
        Self {
            loss,
            perplexity: loss.exp(),
            l2_term,
            regularized_loss: loss + l2_coef * l2_term,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_derives_perplexity_and_objective() {
        let report = LossReport::new(2.0, 10.0, 0.5);
        assert_eq!(report.perplexity, 2.0f32.exp());
        assert_eq!(report.regularized_loss, 7.0);
    }
}
