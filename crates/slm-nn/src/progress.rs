// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use tracing::info;

/// Training reports progress every this many local steps.
pub const PROGRESS_INTERVAL: usize = 50;

/// Receives informational progress from the training loop. Reports never
/// influence training.
pub trait ProgressReporter {
    /// `fraction` is `local_step / num_batch`, or `0.0` when the source does
    /// not know its batch count.
    fn report(&mut self, fraction: f32, local_step: usize, num_batch: usize);
}

/// Default reporter that logs through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn report(&mut self, fraction: f32, local_step: usize, num_batch: usize) {
        info!(local_step, num_batch, "training progress {:.3}", fraction);
    }
}

/// Fraction of the pass completed, guarding against an empty source.
pub(crate) fn progress_fraction(local_step: usize, num_batch: usize) -> f32 {
    if num_batch == 0 {
        0.0
    } else {
        local_step as f32 / num_batch as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_handles_unknown_batch_count() {
        assert_eq!(progress_fraction(50, 0), 0.0);
        assert_eq!(progress_fraction(50, 200), 0.25);
    }
}
