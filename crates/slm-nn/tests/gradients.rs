// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use slm_nn::{l2_penalty, Batch, Parameterized, StateLm, StateLmConfig, Tensor};
use std::collections::HashMap;
use tempfile::tempdir;

fn regularized_loss(model: &mut StateLm, batch: &Batch) -> f32 {
    let logits = model.forward(batch, 1.0).unwrap();
    model
        .loss_report(&logits, batch.targets())
        .unwrap()
        .regularized_loss
}

#[test]
fn analytic_gradients_match_finite_differences() {
    let dir = tempdir().unwrap();
    let config = StateLmConfig::new(5, 3, 2, 2, dir.path())
        .with_seed(13)
        .with_dropout(false)
        .with_l2_coef(0.01);
    let mut model = StateLm::new(config).unwrap();

    // non-zero peepholes and biases so every term carries signal
    let mut state = model.state_dict().unwrap();
    for (name, tensor) in state.iter_mut() {
        if name.contains("peephole") || name.ends_with("bias") {
            let (rows, cols) = tensor.shape();
            *tensor = Tensor::from_fn(rows, cols, |_, c| 0.05 * (c as f32 + 1.0).sin()).unwrap();
        }
    }
    model.load_state_dict(&state).unwrap();

    let batch = Batch::from_examples(&[(vec![1, 2, 3], 4), (vec![4], 0), (vec![2, 2], 1)], 0)
        .unwrap();
    model.compute_gradients(&batch, 1.0).unwrap();
    let mut analytic: HashMap<String, Tensor> = HashMap::new();
    model
        .visit_parameters(&mut |param| {
            analytic.insert(param.name().to_string(), param.gradient().unwrap().clone());
            Ok(())
        })
        .unwrap();

    let eps = 1e-2f32;
    let base = model.state_dict().unwrap();
    for (name, grad) in &analytic {
        for index in [0usize, grad.len() / 3, grad.len() - 1] {
            let mut plus = base.clone();
            plus.get_mut(name).unwrap().data_mut()[index] += eps;
            model.load_state_dict(&plus).unwrap();
            let f_plus = regularized_loss(&mut model, &batch);

            let mut minus = base.clone();
            minus.get_mut(name).unwrap().data_mut()[index] -= eps;
            model.load_state_dict(&minus).unwrap();
            let f_minus = regularized_loss(&mut model, &batch);

            let numeric = (f_plus - f_minus) / (2.0 * eps);
            let got = grad.data()[index];
            assert!(
                (numeric - got).abs() <= 1e-3 + 5e-2 * numeric.abs(),
                "{name}[{index}]: analytic {got} vs numeric {numeric}"
            );
        }
    }
}

#[test]
fn zero_weights_with_nonzero_bias_have_no_l2_term() {
    let dir = tempdir().unwrap();
    let mut model = StateLm::new(StateLmConfig::new(4, 3, 2, 1, dir.path()).with_seed(2)).unwrap();
    let mut state = model.state_dict().unwrap();
    for (name, tensor) in state.iter_mut() {
        let (rows, cols) = tensor.shape();
        *tensor = if name.to_lowercase().contains("bias") {
            Tensor::from_vec(rows, cols, vec![0.75; rows * cols]).unwrap()
        } else {
            Tensor::zeros(rows, cols).unwrap()
        };
    }
    model.load_state_dict(&state).unwrap();
    assert_eq!(l2_penalty(&model).unwrap(), 0.0);

    let batch = Batch::from_examples(&[(vec![1, 2], 3)], 0).unwrap();
    let logits = model.forward(&batch, 1.0).unwrap();
    let report = model.loss_report(&logits, batch.targets()).unwrap();
    assert_eq!(report.l2_term, 0.0);
    assert_eq!(report.regularized_loss, report.loss);
}

#[test]
fn gradients_ignore_padding_positions() {
    let dir = tempdir().unwrap();
    let config = StateLmConfig::new(6, 3, 2, 1, dir.path())
        .with_seed(4)
        .with_dropout(false)
        .with_l2_coef(0.0);
    let mut model = StateLm::new(config).unwrap();
    // token 5 only ever appears as padding
    let batch = Batch::new(
        vec![vec![1, 2, 5, 5], vec![3, 5, 5, 5]],
        vec![2, 1],
        vec![4, 0],
    )
    .unwrap();
    model.compute_gradients(&batch, 1.0).unwrap();
    let mut padding_row = None;
    model
        .visit_parameters(&mut |param| {
            if param.name() == "word-embedding::embedding_w" {
                padding_row = Some(param.gradient().unwrap().row(5)?.to_vec());
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(padding_row.unwrap(), vec![0.0, 0.0]);
}
