//! Qualitative and quantitative evaluation on the validation split.

pub mod plot;
pub mod projection;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::data::FeatureStream;
use crate::error::{Error, Result};
use crate::logging::StatusLogger;
use crate::models::ConvolutionalVqVae;
use crate::training::reconstruction_error;

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub reconstruction_error: f32,
    pub perplexity: f32,
    /// Four-panel comparison: input, target, distance softmax, reconstruction
    pub plot_path: PathBuf,
    /// Utterances of the evaluated batch
    pub wav_filenames: Vec<String>,
}

/// Resumable evaluator state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorState {
    pub last_report: Option<EvaluationReport>,
}

pub struct Evaluator {
    results_path: PathBuf,
    experiment_name: String,
    state: EvaluatorState,
    logger: Arc<dyn StatusLogger>,
}

impl Evaluator {
    pub fn new(
        results_path: impl Into<PathBuf>,
        experiment_name: impl Into<String>,
        logger: Arc<dyn StatusLogger>,
    ) -> Self {
        Self::restore(results_path, experiment_name, EvaluatorState::default(), logger)
    }

    pub fn restore(
        results_path: impl Into<PathBuf>,
        experiment_name: impl Into<String>,
        state: EvaluatorState,
        logger: Arc<dyn StatusLogger>,
    ) -> Self {
        Self {
            results_path: results_path.into(),
            experiment_name: experiment_name.into(),
            state,
            logger,
        }
    }

    pub fn state(&self) -> &EvaluatorState {
        &self.state
    }

    pub fn comparison_plot_path(&self) -> PathBuf {
        self.results_path.join(format!(
            "{}_evaluation-comparaison-plot.png",
            self.experiment_name
        ))
    }

    pub fn embedding_plot_path(&self) -> PathBuf {
        self.results_path
            .join(format!("{}_embedding-plot.png", self.experiment_name))
    }

    /// Reconstruct the first validation batch and plot the first utterance.
    pub fn evaluate(
        &mut self,
        model: &ConvolutionalVqVae,
        stream: &dyn FeatureStream,
    ) -> Result<EvaluationReport> {
        let batch = stream.validation_loader()?.next().ok_or_else(|| {
            Error::DataError("Validation split contains no utterances".to_string())
        })??;
        let (inputs, _speaker_ids, _aux, targets, wav_filenames) = batch.into_parts();

        let latent = model.encode(&inputs)?;
        let vq = model.quantize(&latent, false)?;
        let reconstruction = model.decode(&vq.quantized)?;

        let recon_error = reconstruction_error(&reconstruction, &targets)?.to_scalar::<f32>()?;
        let perplexity = vq.perplexity.to_scalar::<f32>()?;

        // Distances are (batch * time, K), batch-major.
        let reduced_time = latent.dim(D::Minus1)?;
        let probs = candle_nn::ops::softmax(&vq.distances, D::Minus1)?;
        let panels = [
            first_item(&inputs)?,
            first_item(&targets)?,
            probs.narrow(0, 0, reduced_time)?.to_vec2::<f32>()?,
            first_item(&reconstruction)?,
        ];
        let plot_path = self.comparison_plot_path();
        plot::save_heatmaps(&plot_path, &panels)?;

        self.logger.status(&format!(
            "Evaluated {} utterances: reconstruction error {:.4}, perplexity {:.2}",
            wav_filenames.len(),
            recon_error,
            perplexity
        ));

        let report = EvaluationReport {
            reconstruction_error: recon_error,
            perplexity,
            plot_path,
            wav_filenames,
        };
        self.state.last_report = Some(report.clone());
        Ok(report)
    }

    /// Scatter plot of the codebook; needs the `embedding-projection` feature.
    pub fn save_embedding_plot(&self, model: &ConvolutionalVqVae) -> Result<PathBuf> {
        let path = self.embedding_plot_path();
        projection::save_embedding_plot(model.quantizer().codebook(), &path)?;
        Ok(path)
    }
}

/// `[time][filter]` values of the first item of a `(batch, time, filters)` tensor.
fn first_item(batch: &Tensor) -> Result<Vec<Vec<f32>>> {
    Ok(batch.get(0)?.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?)
}

/// Persist a report next to the other results of an experiment.
pub fn save_report(report: &EvaluationReport, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
