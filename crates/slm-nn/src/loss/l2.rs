// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Parameterized;
use crate::PureResult;

/// Sum of squared L2 norms over every parameter whose name does not contain
/// "bias" (case-insensitive).
///
/// This is the unhalved `Σ v²`, twice `tf.nn.l2_loss`; halve an `l2_coef`
/// tuned against the halved form to get the same decay.
pub fn l2_penalty<M: Parameterized + ?Sized>(module: &M) -> PureResult<f32> {
    let mut total = 0.0f32;
    module.visit_parameters(&mut |param| {
        if !param.is_bias() {
            total += param.value().squared_l2_norm();
        }
        Ok(())
    })?;
    Ok(total)
}

/// Adds `d(coef * l2_penalty)/dp = 2 * coef * p` to every non-bias gradient.
pub fn accumulate_l2_gradient<M: Parameterized + ?Sized>(module: &mut M, coef: f32) -> PureResult<()> {
    if coef == 0.0 {
        return Ok(());
    }
    module.visit_parameters_mut(&mut |param| {
        if param.is_bias() {
            return Ok(());
        }
        let update = param.value().scale(2.0 * coef)?;
        param.accumulate_euclidean(&update)
    })
}
