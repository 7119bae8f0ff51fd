// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Weight initialisers shared by the layers.

use crate::{PureResult, Tensor};

/// Glorot/Xavier uniform initialisation: samples `U(-a, a)` with
/// `a = sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_uniform(rows: usize, cols: usize, seed: Option<u64>) -> PureResult<Tensor> {
    let limit = (6.0 / (rows + cols).max(1) as f32).sqrt();
    Tensor::random_uniform(rows, cols, -limit, limit, seed)
}
