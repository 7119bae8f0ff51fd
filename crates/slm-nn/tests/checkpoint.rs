// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use slm_nn::{
    load_state_dict_json, Batch, Parameterized, StateLm, StateLmConfig, TensorError, VecFeed,
};
use tempfile::tempdir;

fn config(dir: &std::path::Path, seed: u64) -> StateLmConfig {
    StateLmConfig::new(6, 4, 3, 2, dir.join("logs")).with_seed(seed)
}

#[test]
fn checkpoint_restores_every_trainable_tensor() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ckpt").join("model.json");
    let mut model = StateLm::new(config(dir.path(), 1)).unwrap();
    let batch = Batch::from_examples(&[(vec![1, 2], 3), (vec![4, 5, 1], 2)], 0).unwrap();
    let mut feed = VecFeed::new(vec![batch.clone()]);
    model.train(0, &mut feed).unwrap();

    model.save_checkpoint(&path).unwrap();
    let saved = model.state_dict().unwrap();
    let stored = load_state_dict_json(&path).unwrap();
    assert_eq!(stored, saved);

    model.train(1, &mut feed).unwrap();
    assert_ne!(model.state_dict().unwrap(), saved);
    model.load_checkpoint(&path).unwrap();
    assert_eq!(model.state_dict().unwrap(), saved);

    let mut fresh = StateLm::new(config(dir.path(), 99)).unwrap();
    fresh.load_checkpoint(&path).unwrap();
    assert_eq!(
        fresh.forward(&batch, 1.0).unwrap(),
        model.forward(&batch, 1.0).unwrap()
    );
}

#[test]
fn checkpoint_from_a_different_architecture_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("small.json");
    let small = StateLm::new(StateLmConfig::new(6, 4, 3, 1, dir.path().join("a"))).unwrap();
    small.save_checkpoint(&path).unwrap();
    let mut deeper = StateLm::new(StateLmConfig::new(6, 4, 3, 2, dir.path().join("b"))).unwrap();
    assert!(matches!(
        deeper.load_checkpoint(&path),
        Err(TensorError::MissingParameter { .. })
    ));
    let mut wider = StateLm::new(StateLmConfig::new(6, 5, 3, 1, dir.path().join("c"))).unwrap();
    assert!(matches!(
        wider.load_checkpoint(&path),
        Err(TensorError::ShapeMismatch { .. })
    ));
}
