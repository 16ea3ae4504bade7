//! Training loop for the VQ-VAE.

use std::path::Path;
use std::sync::Arc;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::optimizer::{Adam, AdamConfig};
use crate::data::{FeatureBatch, FeatureStream};
use crate::error::{Error, Result};
use crate::logging::StatusLogger;
use crate::models::ConvolutionalVqVae;

/// Metrics of one parameter update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-indexed update number
    pub step: usize,
    pub loss: f32,
    pub reconstruction_error: f32,
    pub vq_loss: f32,
    pub perplexity: f32,
}

/// Every update recorded so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub records: Vec<StepRecord>,
}

impl TrainingHistory {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&StepRecord> {
        self.records.last()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// Resumable part of the trainer, persisted in the checkpoint manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Updates completed so far
    pub step: usize,
    pub history: TrainingHistory,
}

/// Mean squared error over the time steps both tensors share.
///
/// The decoder output can be one frame longer or shorter than the target.
pub fn reconstruction_error(reconstruction: &Tensor, target: &Tensor) -> Result<Tensor> {
    let (_, recon_time, recon_filters) = reconstruction.dims3()?;
    let (_, target_time, target_filters) = target.dims3()?;
    if recon_filters != target_filters {
        return Err(Error::ShapeMismatch(format!(
            "Reconstruction has {recon_filters} filters, target has {target_filters}"
        )));
    }
    let time = recon_time.min(target_time);
    let reconstruction = reconstruction.narrow(1, 0, time)?;
    let target = target.narrow(1, 0, time)?;
    Ok(candle_nn::loss::mse(&reconstruction, &target)?)
}

pub struct Trainer {
    optimizer: Adam,
    state: TrainerState,
    num_training_updates: usize,
    log_every: usize,
    logger: Arc<dyn StatusLogger>,
}

impl Trainer {
    /// Fresh trainer over every parameter of `model`.
    pub fn new(model: &ConvolutionalVqVae, logger: Arc<dyn StatusLogger>) -> Result<Self> {
        Self::restore(model, TrainerState::default(), logger)
    }

    /// Trainer resuming from `state`; optimizer moments start at zero until
    /// [`Trainer::load_optimizer`] is called.
    pub fn restore(
        model: &ConvolutionalVqVae,
        state: TrainerState,
        logger: Arc<dyn StatusLogger>,
    ) -> Result<Self> {
        let config = model.config();
        let optimizer = Adam::new(AdamConfig::from_config(config), model.named_vars()?)?;
        Ok(Self {
            optimizer,
            state,
            num_training_updates: config.num_training_updates,
            log_every: config.log_every.max(1),
            logger,
        })
    }

    pub fn step(&self) -> usize {
        self.state.step
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.state.history
    }

    pub fn num_training_updates(&self) -> usize {
        self.num_training_updates
    }

    pub fn save_optimizer(&self, path: &Path) -> Result<()> {
        self.optimizer.save(path)
    }

    pub fn load_optimizer(&mut self, path: &Path) -> Result<()> {
        self.optimizer.load(path)
    }

    /// One forward/backward/update on `batch`.
    pub fn train_step(
        &mut self,
        model: &ConvolutionalVqVae,
        batch: FeatureBatch,
    ) -> Result<StepRecord> {
        let (inputs, _speaker_ids, _aux, targets, _wav_filenames) = batch.into_parts();

        let output = model.forward_t(&inputs, true)?;
        let recon_error = reconstruction_error(&output.reconstruction, &targets)?;
        let loss = (&recon_error + &output.vq.loss)?;

        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;
        self.state.step += 1;

        let record = StepRecord {
            step: self.state.step,
            loss: loss.to_scalar::<f32>()?,
            reconstruction_error: recon_error.to_scalar::<f32>()?,
            vq_loss: output.vq.loss.to_scalar::<f32>()?,
            perplexity: output.vq.perplexity.to_scalar::<f32>()?,
        };
        self.state.history.records.push(record);
        Ok(record)
    }

    /// Run updates until `num_training_updates`, cycling over the training split.
    pub fn train(
        &mut self,
        model: &ConvolutionalVqVae,
        stream: &dyn FeatureStream,
    ) -> Result<&TrainingHistory> {
        if self.state.step >= self.num_training_updates {
            self.logger.warn(&format!(
                "Already trained for {} updates, nothing to do",
                self.state.step
            ));
            return Ok(&self.state.history);
        }

        let mut loader = stream.training_loader()?;
        while self.state.step < self.num_training_updates {
            let batch = match loader.next() {
                Some(batch) => batch?,
                None => {
                    debug!("Training split exhausted at step {}, restarting", self.state.step);
                    loader = stream.training_loader()?;
                    loader.next().ok_or_else(|| {
                        Error::DataError("Training split contains no utterances".to_string())
                    })??
                }
            };

            let record = self.train_step(model, batch)?;
            if record.step % self.log_every == 0 || record.step == self.num_training_updates {
                self.logger.status(&format!(
                    "Iteration {}/{}: loss {:.4}, reconstruction error {:.4}, vq loss {:.4}, perplexity {:.2}",
                    record.step,
                    self.num_training_updates,
                    record.loss,
                    record.reconstruction_error,
                    record.vq_loss,
                    record.perplexity
                ));
            }
        }
        Ok(&self.state.history)
    }
}
