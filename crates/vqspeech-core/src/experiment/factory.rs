//! Builds the model, trainer and evaluator of an experiment.

use std::path::PathBuf;
use std::sync::Arc;

use candle_core::Device;
use tracing::info;

use super::checkpoint::CheckpointBundle;
use crate::config::Configuration;
use crate::error::Result;
use crate::evaluation::Evaluator;
use crate::logging::StatusLogger;
use crate::models::ConvolutionalVqVae;
use crate::training::Trainer;

/// The trainable components of one experiment.
pub struct ExperimentComponents {
    pub model: ConvolutionalVqVae,
    pub trainer: Trainer,
    pub evaluator: Evaluator,
    /// Configuration the components were built from
    pub configuration: Configuration,
}

pub struct ModelFactory {
    results_path: PathBuf,
    experiment_name: String,
    device: Device,
    logger: Arc<dyn StatusLogger>,
}

impl ModelFactory {
    pub fn new(
        results_path: impl Into<PathBuf>,
        experiment_name: impl Into<String>,
        device: Device,
        logger: Arc<dyn StatusLogger>,
    ) -> Self {
        Self {
            results_path: results_path.into(),
            experiment_name: experiment_name.into(),
            device,
            logger,
        }
    }

    /// Freshly initialised components.
    pub fn build(&self, configuration: &Configuration) -> Result<ExperimentComponents> {
        let config = configuration.typed()?;
        let model = ConvolutionalVqVae::new(&config, &self.device)?;
        info!(
            "Built model with {} parameters on {:?}",
            model.num_parameters(),
            self.device
        );
        let trainer = Trainer::new(&model, self.logger.clone())?;
        let evaluator = Evaluator::new(
            self.results_path.clone(),
            self.experiment_name.clone(),
            self.logger.clone(),
        );
        Ok(ExperimentComponents {
            model,
            trainer,
            evaluator,
            configuration: configuration.clone(),
        })
    }

    /// Components restored from a checkpoint written for `configuration`.
    pub fn restore(
        &self,
        configuration: &Configuration,
        bundle: &CheckpointBundle,
    ) -> Result<ExperimentComponents> {
        let config = configuration.typed()?;
        let model = ConvolutionalVqVae::load(&config, &self.device, &bundle.model_path)?;
        let mut trainer = Trainer::restore(
            &model,
            bundle.manifest.trainer.clone(),
            self.logger.clone(),
        )?;
        trainer.load_optimizer(&bundle.optimizer_path)?;
        let evaluator = Evaluator::restore(
            self.results_path.clone(),
            self.experiment_name.clone(),
            bundle.manifest.evaluator.clone(),
            self.logger.clone(),
        );
        info!("Restored model at training step {}", trainer.step());
        Ok(ExperimentComponents {
            model,
            trainer,
            evaluator,
            configuration: configuration.clone(),
        })
    }
}
