// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

// The determinism config is read once per process, so this binary holds a
// single test that sets the environment before any model is built.

use slm_nn::{Parameterized, StateLm, StateLmConfig};
use tempfile::tempdir;

#[test]
fn unseeded_deterministic_models_draw_distinct_reproducible_weights() {
    std::env::set_var("STATELM_DETERMINISTIC", "1");
    std::env::set_var("STATELM_DETERMINISTIC_SEED", "42");
    assert!(slm_config::determinism::config().enabled);

    let dir = tempdir().unwrap();
    // embedding_size == cell_size so every recurrent weight has the same shape
    let build = || StateLm::new(StateLmConfig::new(6, 4, 4, 2, dir.path())).unwrap();
    let first = build().state_dict().unwrap();
    let second = build().state_dict().unwrap();
    assert_eq!(first, second);

    let cell0_ih = &first["rnn::cell_0::weight_ih"];
    let cell1_ih = &first["rnn::cell_1::weight_ih"];
    let cell0_hh = &first["rnn::cell_0::weight_hh"];
    assert_eq!(cell0_ih.shape(), cell1_ih.shape());
    assert_ne!(cell0_ih, cell1_ih);
    assert_ne!(cell0_ih, cell0_hh);
    assert_ne!(cell1_ih, &first["rnn::cell_1::weight_hh"]);

    // a rescaled copy of the same draws keeps every element ratio equal
    let embedding = &first["word-embedding::embedding_w"];
    let ratios: Vec<f32> = embedding.data()[..4]
        .iter()
        .zip(&cell0_ih.data()[..4])
        .map(|(e, w)| e / w)
        .collect();
    assert!(ratios.iter().any(|r| (r - ratios[0]).abs() > 1e-3));
}
