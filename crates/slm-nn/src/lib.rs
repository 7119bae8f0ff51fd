// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Next-word language model built on the `slm-tensor` runtime.
//!
//! The crate keeps the `nn.Module` style surface of its siblings: named
//! [`Parameter`]s, modules that cache activations during `forward` and
//! accumulate gradients during `backward`, and optimisers that walk the
//! parameters through a visitor. On top of that sit the peephole LSTM
//! encoder, the sparse cross-entropy objective, the Adam optimiser and the
//! [`StateLm`] train/valid loops that drive an external [`BatchSource`].

pub mod config;
pub mod encoder;
pub mod feed;
pub mod init;
pub mod io;
pub mod layers;
pub mod loss;
pub mod model;
pub mod module;
pub mod optim;
pub mod progress;
pub mod summary;

pub use config::StateLmConfig;
pub use encoder::{last_relevant, scatter_last_relevant, SequenceEncoder};
pub use feed::{Batch, BatchSource, VecFeed};
pub use io::{load_json, load_state_dict_json, save_json, save_state_dict_json};
pub use layers::{Dropout, Embedding, Linear, PeepholeLstm};
pub use loss::{l2_penalty, Loss, LossReport, SparseSoftmaxCrossEntropy};
pub use model::{StateLm, StepMetrics, TRAIN_KEEP_PROB, VALID_KEEP_PROB};
pub use module::{Module, Parameter, Parameterized};
pub use optim::{Adam, Optimizer};
pub use progress::{ProgressReporter, TracingProgress, PROGRESS_INTERVAL};
pub use summary::{read_events, ScalarEvent, SummaryWriter};

pub use slm_tensor::{PureResult, Tensor, TensorError};
