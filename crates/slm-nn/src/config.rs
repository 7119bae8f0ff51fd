// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, TensorError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_learning_rate() -> f32 {
    0.001
}

fn default_momentum() -> f32 {
    0.9
}

fn default_use_dropout() -> bool {
    true
}

fn default_l2_coef() -> f32 {
    1e-6
}

/// Construction parameters of a [`crate::StateLm`].
///
/// Loadable from TOML or JSON; omitted optional fields take their defaults.
/// `momentum` is accepted for compatibility with older run files and is not
/// used by the Adam optimiser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateLmConfig {
    pub vocab_size: usize,
    pub cell_size: usize,
    pub embedding_size: usize,
    pub num_layer: usize,
    /// Summaries go to `<log_dir>/train` and `<log_dir>/valid`.
    pub log_dir: PathBuf,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default = "default_use_dropout")]
    pub use_dropout: bool,
    #[serde(default = "default_l2_coef")]
    pub l2_coef: f32,
    /// Base seed for initialisation and dropout masks.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl StateLmConfig {
    pub fn new(
        vocab_size: usize,
        cell_size: usize,
        embedding_size: usize,
        num_layer: usize,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            vocab_size,
            cell_size,
            embedding_size,
            num_layer,
            log_dir: log_dir.into(),
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            use_dropout: default_use_dropout(),
            l2_coef: default_l2_coef(),
            seed: None,
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_dropout(mut self, use_dropout: bool) -> Self {
        self.use_dropout = use_dropout;
        self
    }

    pub fn with_l2_coef(mut self, l2_coef: f32) -> Self {
        self.l2_coef = l2_coef;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn from_toml_str(text: &str) -> PureResult<Self> {
        let config: Self = toml::from_str(text).map_err(serde_error)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> PureResult<Self> {
        let config: Self = serde_json::from_str(text).map_err(serde_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a `.toml` or `.json` file, chosen by extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> PureResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| TensorError::IoError {
            message: format!("{}: {err}", path.display()),
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("json") => Self::from_json_str(&text),
            _ => Err(TensorError::InvalidValue {
                label: "config_extension",
            }),
        }
    }

    pub fn validate(&self) -> PureResult<()> {
        if self.vocab_size == 0 || self.embedding_size == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: self.vocab_size,
                cols: self.embedding_size,
            });
        }
        if self.cell_size == 0 {
            return Err(TensorError::InvalidValue { label: "cell_size" });
        }
        if self.num_layer == 0 {
            return Err(TensorError::InvalidValue { label: "num_layer" });
        }
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: self.learning_rate,
            });
        }
        if !(self.l2_coef >= 0.0) || !self.l2_coef.is_finite() {
            return Err(TensorError::InvalidValue { label: "l2_coef" });
        }
        Ok(())
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}
