// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

// Run with `RUST_LOG=slm_nn=debug cargo run -p slm-nn --example train_toy`
// to watch per-step losses; set STATELM_TRACE_CHROME=trace.json for a Chrome trace.

use slm_nn::{PureResult, StateLm, StateLmConfig, VecFeed};

const VOCAB: usize = 12;

/// Prefixes of a cyclic token stream `1, 2, ..., 11, 1, 2, ...`, each paired
/// with the token that follows it. Id 0 is reserved for padding.
fn cyclic_examples(count: usize, offset: usize) -> Vec<(Vec<usize>, usize)> {
    (0..count)
        .map(|i| {
            let start = i + offset;
            let len = 1 + i % 5;
            let prefix: Vec<usize> = (0..len).map(|t| 1 + (start + t) % (VOCAB - 1)).collect();
            let target = 1 + (start + len) % (VOCAB - 1);
            (prefix, target)
        })
        .collect()
}

fn main() -> PureResult<()> {
    slm_config::ensure_tracing();

    let log_dir = std::env::temp_dir().join("statelm-train-toy");
    let config = StateLmConfig::new(VOCAB, 24, 8, 2, &log_dir)
        .with_learning_rate(0.01)
        .with_seed(0xC0FFEE);
    let mut model = StateLm::new(config)?;

    let mut train_feed =
        VecFeed::from_examples(&cyclic_examples(256, 0), 16, 0)?.shuffled(Some(7));
    let mut valid_feed = VecFeed::from_examples(&cyclic_examples(64, 3), 16, 0)?;

    let mut global_step = 0u64;
    for epoch in 0..8u64 {
        let (step, train_losses) = model.train(global_step, &mut train_feed)?;
        global_step = step;
        let valid_losses = model.valid(epoch, &mut valid_feed)?;
        let mean = |losses: &[f32]| losses.iter().sum::<f32>() / losses.len().max(1) as f32;
        println!(
            "epoch {epoch}: step {global_step} train loss {:.4} valid loss {:.4} (ppl {:.2})",
            mean(&train_losses),
            mean(&valid_losses),
            mean(&valid_losses).exp()
        );
    }

    let checkpoint = log_dir.join("checkpoint.json");
    model.save_checkpoint(&checkpoint)?;
    println!("saved {}", checkpoint.display());
    Ok(())
}
