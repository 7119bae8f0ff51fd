// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

mod adam;

use crate::module::Parameterized;
use crate::PureResult;

pub use adam::Adam;

/// Consumes the gradients accumulated on a module and updates its values.
pub trait Optimizer {
    /// Applies one update to every parameter carrying a gradient, then clears
    /// those gradients.
    fn step(&mut self, module: &mut dyn Parameterized) -> PureResult<()>;

    /// Base learning rate.
    fn learning_rate(&self) -> f32;
}
