// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{PureResult, Tensor, TensorError};

/// Softmax cross entropy over raw logits with integer class targets,
/// averaged over the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SparseSoftmaxCrossEntropy;

impl SparseSoftmaxCrossEntropy {
    pub fn new() -> Self {
        Self
    }

    fn guard(prediction: &Tensor, target: &[usize]) -> PureResult<()> {
        let (rows, cols) = prediction.shape();
        if rows != target.len() {
            return Err(TensorError::DataLength {
                expected: rows,
                got: target.len(),
            });
        }
        if let Some(&class) = target.iter().find(|&&class| class >= cols) {
            return Err(TensorError::IndexOutOfBounds {
                label: "cross_entropy_target",
                index: class as i64,
                len: cols,
            });
        }
        Ok(())
    }
}

impl Loss for SparseSoftmaxCrossEntropy {
    fn forward(&mut self, prediction: &Tensor, target: &[usize]) -> PureResult<f32> {
        Self::guard(prediction, target)?;
        let cols = prediction.shape().1;
        let mut sum = 0.0f32;
        for (row, &class) in prediction.data().chunks(cols).zip(target) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_sum: f32 = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
            sum += log_sum + max - row[class];
        }
        Ok(sum / target.len() as f32)
    }

    fn backward(&mut self, prediction: &Tensor, target: &[usize]) -> PureResult<Tensor> {
        Self::guard(prediction, target)?;
        let (rows, cols) = prediction.shape();
        let inv_batch = 1.0 / rows as f32;
        let mut grad = prediction.row_softmax()?;
        let data = grad.data_mut();
        for (row, &class) in target.iter().enumerate() {
            data[row * cols + class] -= 1.0;
        }
        for value in data.iter_mut() {
            *value *= inv_batch;
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_logits_give_log_vocab() {
        let mut loss = SparseSoftmaxCrossEntropy::new();
        let logits = Tensor::zeros(3, 4).unwrap();
        let value = loss.forward(&logits, &[0, 1, 3]).unwrap();
        assert!((value - 4.0f32.ln()).abs() < 1e-6);
        assert!((value.exp() - 4.0).abs() < 1e-5);
    }

    #[test]
    fn matches_manual_softmax() {
        let mut loss = SparseSoftmaxCrossEntropy::new();
        let logits = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 0.5, 0.0, -0.5]).unwrap();
        let value = loss.forward(&logits, &[2, 0]).unwrap();
        let p0 = 3.0f32.exp() / (1.0f32.exp() + 2.0f32.exp() + 3.0f32.exp());
        let p1 = 0.5f32.exp() / (0.5f32.exp() + 1.0 + (-0.5f32).exp());
        let expected = -(p0.ln() + p1.ln()) / 2.0;
        assert!((value - expected).abs() < 1e-5);

        let grad = loss.backward(&logits, &[2, 0]).unwrap();
        assert!((grad.data()[2] - (p0 - 1.0) / 2.0).abs() < 1e-6);
        for row in grad.data().chunks(3) {
            assert!(row.iter().sum::<f32>().abs() < 1e-6);
        }
    }

    #[test]
    fn rejects_out_of_vocab_targets() {
        let mut loss = SparseSoftmaxCrossEntropy::new();
        let logits = Tensor::zeros(1, 3).unwrap();
        assert!(matches!(
            loss.forward(&logits, &[3]),
            Err(TensorError::IndexOutOfBounds { index: 3, len: 3, .. })
        ));
        assert!(loss.forward(&logits, &[0, 1]).is_err());
    }
}
