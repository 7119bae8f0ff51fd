// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Optimizer;
use crate::module::Parameterized;
use crate::{PureResult, TensorError};
use std::collections::HashMap;

#[derive(Clone, Debug)]
struct Moments {
    first: Vec<f32>,
    second: Vec<f32>,
}

/// Adam with bias-corrected first and second moments, kept per parameter
/// name.
#[derive(Clone, Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    timestep: u64,
    moments: HashMap<String, Moments>,
}

impl Adam {
    /// Adam with `beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-8`.
    pub fn new(learning_rate: f32) -> PureResult<Self> {
        if !(learning_rate > 0.0) || !learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        Ok(Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            timestep: 0,
            moments: HashMap::new(),
        })
    }

    /// Number of updates applied so far.
    pub fn timestep(&self) -> u64 {
        self.timestep
    }
}

impl Optimizer for Adam {
    fn step(&mut self, module: &mut dyn Parameterized) -> PureResult<()> {
        self.timestep += 1;
        let t = self.timestep as i32;
        let correction1 = 1.0 - self.beta1.powi(t);
        let correction2 = 1.0 - self.beta2.powi(t);
        let (lr, beta1, beta2, epsilon) =
            (self.learning_rate, self.beta1, self.beta2, self.epsilon);
        let moments = &mut self.moments;
        module.visit_parameters_mut(&mut |param| {
            let Some(grad) = param.gradient().cloned() else {
                return Ok(());
            };
            let size = grad.len();
            let state = moments
                .entry(param.name().to_string())
                .or_insert_with(|| Moments {
                    first: vec![0.0; size],
                    second: vec![0.0; size],
                });
            let values = param.value_mut().data_mut();
            for (((value, g), m), v) in values
                .iter_mut()
                .zip(grad.data())
                .zip(state.first.iter_mut())
                .zip(state.second.iter_mut())
            {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / correction1;
                let v_hat = *v / correction2;
                *value -= lr * m_hat / (v_hat.sqrt() + epsilon);
            }
            param.zero_gradient();
            Ok(())
        })
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}
