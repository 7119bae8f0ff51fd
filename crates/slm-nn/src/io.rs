// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! JSON checkpoints keyed by parameter name.

use crate::module::Parameterized;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        let (rows, cols) = tensor.shape();
        StoredTensor {
            rows,
            cols,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

// BTreeMap keeps checkpoint files stable across runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Checkpoint {
    parameters: BTreeMap<String, StoredTensor>,
}

fn checkpoint_from_state(state: &HashMap<String, Tensor>) -> Checkpoint {
    let parameters = state
        .iter()
        .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
        .collect();
    Checkpoint { parameters }
}

fn state_from_checkpoint(checkpoint: Checkpoint) -> PureResult<HashMap<String, Tensor>> {
    let mut state = HashMap::with_capacity(checkpoint.parameters.len());
    for (name, tensor) in checkpoint.parameters {
        state.insert(name, tensor.into_tensor()?);
    }
    Ok(state)
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

pub fn save_state_dict_json<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
) -> PureResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let checkpoint = checkpoint_from_state(state);
    let file = File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &checkpoint).map_err(serde_error)?;
    writer.flush().map_err(io_error)?;
    info!(path = %path.display(), tensors = state.len(), "saved checkpoint");
    Ok(())
}

pub fn load_state_dict_json<P: AsRef<Path>>(path: P) -> PureResult<HashMap<String, Tensor>> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let checkpoint: Checkpoint = serde_json::from_reader(reader).map_err(serde_error)?;
    state_from_checkpoint(checkpoint)
}

/// Writes every trainable tensor of `module` to `path`.
pub fn save_json<M: Parameterized + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_json(&module.state_dict()?, path)
}

/// Restores every trainable tensor of `module` from `path`. Missing names or
/// mismatched shapes fail without partial guarantees.
pub fn load_json<M: Parameterized + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let state = load_state_dict_json(path)?;
    module.load_state_dict(&state)
}
