// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The next-word language model and its training/validation loops.
//!
//! A [`StateLm`] is built once from a [`StateLmConfig`] and then driven batch
//! by batch. [`StateLm::train`] runs encoder, projection, loss and one Adam
//! update per batch with dropout keep-probability `0.5`;
//! [`StateLm::valid`] runs the same pipeline with keep-probability `1.0` and
//! never touches the parameters. Both loops stop when the [`BatchSource`]
//! reports exhaustion and append `entropy_loss` / `perplexity` scalars to
//! their own summary stream.

use crate::config::StateLmConfig;
use crate::encoder::{last_relevant, scatter_last_relevant, SequenceEncoder};
use crate::feed::{Batch, BatchSource};
use crate::io;
use crate::layers::Linear;
use crate::loss::{accumulate_l2_gradient, l2_penalty, Loss, LossReport, SparseSoftmaxCrossEntropy};
use crate::module::{Module, Parameter, Parameterized};
use crate::optim::{Adam, Optimizer};
use crate::progress::{progress_fraction, ProgressReporter, TracingProgress, PROGRESS_INTERVAL};
use crate::summary::SummaryWriter;
use crate::{PureResult, Tensor};
use slm_config::determinism::derive_seed;
use std::path::Path;
use tracing::{debug, info, info_span};

/// Dropout keep-probability bound for every training step.
pub const TRAIN_KEEP_PROB: f32 = 0.5;
/// Dropout keep-probability bound for every validation step.
pub const VALID_KEEP_PROB: f32 = 1.0;

const LOSS_TAG: &str = "entropy_loss";
const PERPLEXITY_TAG: &str = "perplexity";

/// Per-batch scalars returned by the step functions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepMetrics {
    pub loss: f32,
    pub perplexity: f32,
    /// Keep-probability that was bound to the dropout layers for this batch.
    pub keep_prob: f32,
}

#[derive(Debug)]
struct LanguageNetwork {
    encoder: SequenceEncoder,
    projection: Linear,
}

impl Parameterized for LanguageNetwork {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.encoder.visit_parameters(visitor)?;
        self.projection.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.encoder.visit_parameters_mut(visitor)?;
        self.projection.visit_parameters_mut(visitor)
    }
}

/// Peephole-LSTM next-word model with its optimiser and summary streams.
pub struct StateLm {
    config: StateLmConfig,
    network: LanguageNetwork,
    loss: SparseSoftmaxCrossEntropy,
    optimizer: Adam,
    train_writer: SummaryWriter,
    valid_writer: SummaryWriter,
    progress: Box<dyn ProgressReporter>,
}

impl core::fmt::Debug for StateLm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StateLm")
            .field("config", &self.config)
            .field("optimizer_timestep", &self.optimizer.timestep())
            .finish()
    }
}

impl StateLm {
    pub fn new(config: StateLmConfig) -> PureResult<Self> {
        config.validate()?;
        let encoder = SequenceEncoder::new(
            config.vocab_size,
            config.embedding_size,
            config.cell_size,
            config.num_layer,
            config.use_dropout,
            config.seed,
        )?;
        let projection = Linear::new(
            "output_project",
            config.cell_size,
            config.vocab_size,
            derive_seed(config.seed, "output_project"),
        )?;
        let optimizer = Adam::new(config.learning_rate)?;
        let train_writer = SummaryWriter::create(config.log_dir.join("train"))?;
        let valid_writer = SummaryWriter::create(config.log_dir.join("valid"))?;
        let network = LanguageNetwork {
            encoder,
            projection,
        };
        info!(
            vocab_size = config.vocab_size,
            cell_size = config.cell_size,
            embedding_size = config.embedding_size,
            num_layer = config.num_layer,
            use_dropout = config.use_dropout,
            learning_rate = optimizer.learning_rate(),
            l2_coef = config.l2_coef,
            parameters = network.parameter_count()?,
            "built language model"
        );
        debug!(momentum = config.momentum, "momentum is not used by Adam");
        Ok(Self {
            config,
            network,
            loss: SparseSoftmaxCrossEntropy::new(),
            optimizer,
            train_writer,
            valid_writer,
            progress: Box::new(TracingProgress),
        })
    }

    /// Replaces the progress reporter used by [`StateLm::train`].
    pub fn with_progress(mut self, reporter: impl ProgressReporter + 'static) -> Self {
        self.progress = Box::new(reporter);
        self
    }

    pub fn config(&self) -> &StateLmConfig {
        &self.config
    }

    pub fn encoder(&self) -> &SequenceEncoder {
        &self.network.encoder
    }

    pub fn projection(&self) -> &Linear {
        &self.network.projection
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Keep-probability bound by the most recent forward pass.
    pub fn keep_prob(&self) -> f32 {
        self.network.encoder.keep_prob()
    }

    pub fn train_summary_path(&self) -> &Path {
        self.train_writer.path()
    }

    pub fn valid_summary_path(&self) -> &Path {
        self.valid_writer.path()
    }

    /// Unnormalised next-token scores, `[batch, vocab_size]`.
    pub fn forward(&self, batch: &Batch, keep_prob: f32) -> PureResult<Tensor> {
        self.network.encoder.bind_keep_prob(keep_prob)?;
        let last_hidden = self.network.encoder.encode(batch)?;
        self.network.projection.forward(&last_hidden)
    }

    /// Cross entropy, perplexity and the L2-regularised objective for `logits`.
    pub fn loss_report(&mut self, logits: &Tensor, targets: &[usize]) -> PureResult<LossReport> {
        let loss = self.loss.forward(logits, targets)?;
        let l2_term = l2_penalty(&self.network)?;
        Ok(LossReport::new(loss, l2_term, self.config.l2_coef))
    }

    /// Clears every gradient, then accumulates the gradient of the
    /// regularised loss on `batch` without updating any parameter.
    pub fn compute_gradients(&mut self, batch: &Batch, keep_prob: f32) -> PureResult<LossReport> {
        self.network.zero_accumulators()?;
        self.network.encoder.bind_keep_prob(keep_prob)?;
        let outputs = self.network.encoder.forward(batch)?;
        let last_hidden = last_relevant(&outputs, batch.lengths(), batch.max_len())?;
        let logits = self.network.projection.forward(&last_hidden)?;
        let report = self.loss_report(&logits, batch.targets())?;

        let grad_logits = self.loss.backward(&logits, batch.targets())?;
        let grad_hidden = self.network.projection.backward(&last_hidden, &grad_logits)?;
        let grad_outputs = scatter_last_relevant(&grad_hidden, batch.lengths(), batch.max_len())?;
        self.network.encoder.backward(&grad_outputs)?;
        accumulate_l2_gradient(&mut self.network, self.config.l2_coef)?;
        Ok(report)
    }

    /// One optimisation step on `batch` with dropout keep-probability `0.5`.
    pub fn train_step(&mut self, batch: &Batch) -> PureResult<StepMetrics> {
        let report = self.compute_gradients(batch, TRAIN_KEEP_PROB)?;
        self.optimizer.step(&mut self.network)?;
        Ok(StepMetrics {
            loss: report.loss,
            perplexity: report.perplexity,
            keep_prob: self.keep_prob(),
        })
    }

    /// Loss on `batch` with dropout disabled; parameters are left untouched.
    pub fn eval_step(&mut self, batch: &Batch) -> PureResult<StepMetrics> {
        let logits = self.forward(batch, VALID_KEEP_PROB)?;
        let loss = self.loss.forward(&logits, batch.targets())?;
        Ok(StepMetrics {
            loss,
            perplexity: loss.exp(),
            keep_prob: self.keep_prob(),
        })
    }

    /// Runs one training pass and returns the advanced global step together
    /// with the metrics of every batch.
    pub fn train_metrics<B>(
        &mut self,
        mut global_step: u64,
        feed: &mut B,
    ) -> PureResult<(u64, Vec<StepMetrics>)>
    where
        B: BatchSource + ?Sized,
    {
        let _span = info_span!("train", start_step = global_step).entered();
        let num_batch = feed.num_batch();
        let mut local_step = 0usize;
        let mut history = Vec::with_capacity(num_batch);
        while let Some(batch) = feed.next_batch()? {
            let metrics = self.train_step(&batch)?;
            record(&mut self.train_writer, global_step, &metrics)?;
            debug!(global_step, loss = metrics.loss, "train step");
            history.push(metrics);
            global_step += 1;
            local_step += 1;
            if local_step % PROGRESS_INTERVAL == 0 {
                self.progress
                    .report(progress_fraction(local_step, num_batch), local_step, num_batch);
            }
        }
        info!(
            global_step,
            batches = history.len(),
            mean_loss = mean_loss(&history),
            "finished training pass"
        );
        Ok((global_step, history))
    }

    /// `train(global_step, feed) -> (new_global_step, losses)`.
    pub fn train<B>(&mut self, global_step: u64, feed: &mut B) -> PureResult<(u64, Vec<f32>)>
    where
        B: BatchSource + ?Sized,
    {
        let (global_step, history) = self.train_metrics(global_step, feed)?;
        Ok((global_step, history.iter().map(|m| m.loss).collect()))
    }

    /// Runs one validation pass; every batch is recorded at `step`.
    pub fn valid_metrics<B>(&mut self, step: u64, feed: &mut B) -> PureResult<Vec<StepMetrics>>
    where
        B: BatchSource + ?Sized,
    {
        let _span = info_span!("valid", step).entered();
        let mut history = Vec::with_capacity(feed.num_batch());
        while let Some(batch) = feed.next_batch()? {
            let metrics = self.eval_step(&batch)?;
            record(&mut self.valid_writer, step, &metrics)?;
            history.push(metrics);
        }
        info!(
            step,
            batches = history.len(),
            mean_loss = mean_loss(&history),
            "finished validation pass"
        );
        Ok(history)
    }

    /// `valid(step, feed) -> losses`.
    pub fn valid<B>(&mut self, step: u64, feed: &mut B) -> PureResult<Vec<f32>>
    where
        B: BatchSource + ?Sized,
    {
        let history = self.valid_metrics(step, feed)?;
        Ok(history.iter().map(|m| m.loss).collect())
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> PureResult<()> {
        io::save_json(&self.network, path)
    }

    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> PureResult<()> {
        io::load_json(&mut self.network, path)
    }
}

impl Parameterized for StateLm {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.network.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.network.visit_parameters_mut(visitor)
    }
}

fn record(writer: &mut SummaryWriter, step: u64, metrics: &StepMetrics) -> PureResult<()> {
    writer.add_scalar(step, LOSS_TAG, metrics.loss)?;
    writer.add_scalar(step, PERPLEXITY_TAG, metrics.perplexity)
}

fn mean_loss(history: &[StepMetrics]) -> f32 {
    if history.is_empty() {
        return 0.0;
    }
    history.iter().map(|m| m.loss).sum::<f32>() / history.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn toy_batch() -> Batch {
        Batch::from_examples(&[(vec![1, 2, 3], 4), (vec![2, 5], 1)], 0).unwrap()
    }

    #[test]
    fn forward_produces_vocab_logits() {
        let dir = tempdir().unwrap();
        let model = StateLm::new(StateLmConfig::new(6, 4, 3, 2, dir.path()).with_seed(1)).unwrap();
        let logits = model.forward(&toy_batch(), 1.0).unwrap();
        assert_eq!(logits.shape(), (2, 6));
        assert!(dir.path().join("train").is_dir());
        assert!(dir.path().join("valid").is_dir());
    }

    #[test]
    fn parameter_set_matches_layout() {
        let dir = tempdir().unwrap();
        let model = StateLm::new(StateLmConfig::new(6, 4, 3, 2, dir.path()).with_seed(1)).unwrap();
        let state = model.state_dict().unwrap();
        assert_eq!(state.len(), 1 + 2 * 6 + 2);
        assert_eq!(state["output_project::weight"].shape(), (4, 6));
        assert_eq!(state["output_project::bias"].shape(), (1, 6));
        assert_eq!(state["word-embedding::embedding_w"].shape(), (6, 3));
    }

    #[test]
    fn perplexity_is_exp_of_loss() {
        let dir = tempdir().unwrap();
        let mut model =
            StateLm::new(StateLmConfig::new(6, 4, 3, 1, dir.path()).with_seed(2)).unwrap();
        let batch = toy_batch();
        let train = model.train_step(&batch).unwrap();
        let eval = model.eval_step(&batch).unwrap();
        for metrics in [train, eval] {
            assert!((metrics.perplexity - metrics.loss.exp()).abs() <= 1e-5 * metrics.perplexity);
        }
        assert_eq!(train.keep_prob, TRAIN_KEEP_PROB);
        assert_eq!(eval.keep_prob, VALID_KEEP_PROB);
    }

    #[test]
    fn regularised_loss_adds_scaled_penalty() {
        let dir = tempdir().unwrap();
        let mut model = StateLm::new(
            StateLmConfig::new(6, 4, 3, 1, dir.path())
                .with_seed(3)
                .with_l2_coef(0.01),
        )
        .unwrap();
        let report = model.compute_gradients(&toy_batch(), 1.0).unwrap();
        let expected = l2_penalty(&model).unwrap();
        assert!((report.l2_term - expected).abs() < 1e-5);
        assert!((report.regularized_loss - (report.loss + 0.01 * expected)).abs() < 1e-5);
    }
}
