//! Experiment lifecycle: configuration, resume-or-rebuild, training and evaluation.
//!
//! An experiment is identified by its name. Its configuration lives at
//! `<experiments_path>/<name>_configuration.yaml`; when that file already
//! exists the experiment resumes from the checkpoint written next to it, and
//! falls back to a fresh model whenever the checkpoint cannot be used.

pub mod checkpoint;
pub mod factory;
pub mod runner;

pub use checkpoint::{CheckpointBundle, CheckpointManifest, CheckpointStore, LoadResult};
pub use factory::{ExperimentComponents, ModelFactory};
pub use runner::{
    load_experiments, parse_experiments, ExperimentRunner, ExperimentEntry, RunSummary,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Configuration;
use crate::data::{FeatureStream, FeatureStreamFactory};
use crate::device::DeviceConfiguration;
use crate::error::{Error, Result};
use crate::evaluation::{self, EvaluationReport, Evaluator};
use crate::logging::StatusLogger;
use crate::models::ConvolutionalVqVae;
use crate::training::{Trainer, TrainingHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentState {
    /// Configuration was just created from the global defaults and overrides
    New,
    /// Configuration was found on disk; a checkpoint may follow it
    Resuming,
    /// Model, trainer, evaluator and data stream are built
    Ready,
}

/// Components, data stream and the device they were built on.
type Built = (
    ExperimentComponents,
    Box<dyn FeatureStream>,
    DeviceConfiguration,
);

pub struct Experiment {
    name: String,
    experiments_path: PathBuf,
    results_path: PathBuf,
    configuration: Configuration,
    device_configuration: DeviceConfiguration,
    store: CheckpointStore,
    state: ExperimentState,
    components: Option<ExperimentComponents>,
    data_stream: Option<Box<dyn FeatureStream>>,
    stream_factory: Arc<dyn FeatureStreamFactory>,
    logger: Arc<dyn StatusLogger>,
}

impl Experiment {
    /// Prepare the directories and the configuration of experiment `name`.
    ///
    /// A new configuration takes `global` and replaces the values of keys it
    /// already has with those from `overrides`. An existing configuration is
    /// loaded as is and `global`/`overrides` are ignored.
    pub fn new(
        name: impl Into<String>,
        experiments_path: impl Into<PathBuf>,
        results_path: impl Into<PathBuf>,
        global: &Configuration,
        overrides: &Configuration,
        stream_factory: Arc<dyn FeatureStreamFactory>,
        logger: Arc<dyn StatusLogger>,
    ) -> Result<Self> {
        let name = name.into();
        let experiments_path = experiments_path.into();
        let results_path = results_path.into();

        ensure_directory(&results_path, "results", logger.as_ref())?;
        ensure_directory(&experiments_path, "experiments", logger.as_ref())?;

        let store = CheckpointStore::new(&experiments_path, &name);
        let configuration_path = store.configuration_path();
        let (configuration, state) = if configuration_path.is_file() {
            (Configuration::load(&configuration_path)?, ExperimentState::Resuming)
        } else {
            (Configuration::merged(global, overrides), ExperimentState::New)
        };
        // Checked before anything is persisted
        let device_configuration =
            DeviceConfiguration::load_from_configuration(&configuration.typed()?)?;
        if state == ExperimentState::New {
            configuration.save(&configuration_path)?;
        }

        Ok(Self {
            name,
            experiments_path,
            results_path,
            configuration,
            device_configuration,
            store,
            state,
            components: None,
            data_stream: None,
            stream_factory,
            logger,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn experiments_path(&self) -> &Path {
        &self.experiments_path
    }

    pub fn results_path(&self) -> &Path {
        &self.results_path
    }

    pub fn state(&self) -> ExperimentState {
        self.state
    }

    /// The configuration the components are (or will be) built from.
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn device_configuration(&self) -> &DeviceConfiguration {
        &self.device_configuration
    }

    pub fn model(&self) -> Option<&ConvolutionalVqVae> {
        self.components.as_ref().map(|c| &c.model)
    }

    pub fn trainer(&self) -> Option<&Trainer> {
        self.components.as_ref().map(|c| &c.trainer)
    }

    pub fn evaluator(&self) -> Option<&Evaluator> {
        self.components.as_ref().map(|c| &c.evaluator)
    }

    /// Build or restore the model, trainer, evaluator and data stream.
    /// Does nothing once the experiment is ready.
    pub fn init(&mut self) -> Result<()> {
        let (components, stream, device_configuration) = match self.state {
            ExperimentState::Ready => return Ok(()),
            ExperimentState::New => {
                self.create_from_scratch(&self.configuration, &self.device_configuration)?
            }
            ExperimentState::Resuming => {
                self.logger
                    .status("Configuration file already exists. Loading...");
                match self.resume() {
                    Ok(built) => built,
                    Err(e) => {
                        self.logger.error(&format!(
                            "Failed to load existing configuration ({e}). Building a new model..."
                        ));
                        self.create_from_scratch(&self.configuration, &self.device_configuration)?
                    }
                }
            }
        };

        if components.configuration != self.configuration {
            // A legacy checkpoint pointed at another configuration: adopt it so
            // the next checkpoint matches the file on disk.
            components
                .configuration
                .save(&self.store.configuration_path())?;
            self.configuration = components.configuration.clone();
        }
        self.device_configuration = device_configuration;
        self.components = Some(components);
        self.data_stream = Some(stream);
        self.state = ExperimentState::Ready;
        Ok(())
    }

    fn resume(&self) -> Result<Built> {
        let fingerprint = self.configuration.fingerprint()?;
        match self.store.load(&fingerprint)? {
            LoadResult::Full(bundle) => {
                self.logger.status(&format!(
                    "Restoring checkpoint at training step {}",
                    bundle.manifest.trainer.step
                ));
                let stream = self.open_stream(&self.configuration, &self.device_configuration)?;
                let components = self
                    .model_factory(&self.device_configuration)
                    .restore(&self.configuration, &bundle)?;
                Ok((components, stream, self.device_configuration.clone()))
            }
            LoadResult::LegacyConfigOnly(configuration_file) => {
                self.logger.status("Loading the configuration file");
                let configuration = Configuration::load(&self.store.resolve(&configuration_file))?;
                let device_configuration =
                    DeviceConfiguration::load_from_configuration(&configuration.typed()?)?;
                self.create_from_scratch(&configuration, &device_configuration)
            }
        }
    }

    fn create_from_scratch(
        &self,
        configuration: &Configuration,
        device_configuration: &DeviceConfiguration,
    ) -> Result<Built> {
        let stream = self.open_stream(configuration, device_configuration)?;
        let components = self
            .model_factory(device_configuration)
            .build(configuration)?;
        Ok((components, stream, device_configuration.clone()))
    }

    fn open_stream(
        &self,
        configuration: &Configuration,
        device_configuration: &DeviceConfiguration,
    ) -> Result<Box<dyn FeatureStream>> {
        self.logger.status("Loading data stream");
        self.stream_factory
            .open(&configuration.typed()?, &device_configuration.device)
    }

    fn model_factory(&self, device_configuration: &DeviceConfiguration) -> ModelFactory {
        ModelFactory::new(
            self.results_path.clone(),
            self.name.clone(),
            device_configuration.device.clone(),
            self.logger.clone(),
        )
    }

    fn ready(&mut self) -> Result<(&mut ExperimentComponents, &dyn FeatureStream)> {
        match (&mut self.components, &self.data_stream) {
            (Some(components), Some(stream)) => Ok((components, stream.as_ref())),
            _ => Err(Error::InvalidInput(format!(
                "Experiment '{}' is not initialised",
                self.name
            ))),
        }
    }

    pub fn training_history_path(&self) -> PathBuf {
        self.results_path
            .join(format!("{}_training-history.json", self.name))
    }

    pub fn loss_plot_path(&self) -> PathBuf {
        self.results_path
            .join(format!("{}_loss-plot.png", self.name))
    }

    pub fn evaluation_report_path(&self) -> PathBuf {
        self.results_path
            .join(format!("{}_evaluation-report.json", self.name))
    }

    /// Train up to `num_training_updates`, then checkpoint and write the
    /// training history and loss plot.
    pub fn train(&mut self) -> Result<TrainingHistory> {
        self.logger.status(&format!(
            "Running the experiment called '{}'",
            self.name
        ));
        self.init()?;

        self.logger.status("Begins to train the model");
        let (components, stream) = self.ready()?;
        let ExperimentComponents { model, trainer, .. } = components;
        let history = trainer.train(model, stream)?.clone();

        self.save_checkpoint()?;
        history.save(&self.training_history_path())?;
        evaluation::plot::save_loss_curve(&self.loss_plot_path(), &history)?;

        self.logger.success(&format!(
            "Succeeded in running the experiment called '{}'",
            self.name
        ));
        Ok(history)
    }

    /// Evaluate on the first validation batch and write the comparison plot.
    pub fn evaluate(&mut self) -> Result<EvaluationReport> {
        self.logger.status(&format!(
            "Running the experiment called '{}'",
            self.name
        ));
        self.init()?;

        self.logger.status("Begins to evaluate the model");
        let (components, stream) = self.ready()?;
        let ExperimentComponents {
            model, evaluator, ..
        } = components;
        let report = evaluator.evaluate(model, stream)?;
        evaluation::save_report(&report, &self.evaluation_report_path())?;
        // Keeps the evaluator state in the manifest current.
        self.save_checkpoint()?;

        self.logger.success(&format!(
            "Succeeded in running the experiment called '{}'",
            self.name
        ));
        Ok(report)
    }

    /// Codebook projection plot under the results directory.
    pub fn save_embedding_plot(&mut self) -> Result<PathBuf> {
        self.init()?;
        let (components, _) = self.ready()?;
        components.evaluator.save_embedding_plot(&components.model)
    }

    /// Write the model, optimizer state and manifest of the current components.
    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let components = self.components.as_ref().ok_or_else(|| {
            Error::InvalidInput(format!("Experiment '{}' is not initialised", self.name))
        })?;
        let fingerprint = components.configuration.fingerprint()?;
        self.store.save(
            &fingerprint,
            components.trainer.state(),
            components.evaluator.state(),
            |model_path, optimizer_path| {
                components.model.save(model_path)?;
                components.trainer.save_optimizer(optimizer_path)
            },
        )
    }
}

fn ensure_directory(path: &Path, label: &str, logger: &dyn StatusLogger) -> Result<()> {
    if path.is_dir() {
        logger.status(&format!(
            "{} directory already created at path: {}",
            capitalize(label),
            path.display()
        ));
    } else {
        logger.status(&format!(
            "Creating {label} directory at path: {}",
            path.display()
        ));
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VqVaeConfig;
    use crate::data::testing::random_stream;
    use crate::logging::testing::{Level, RecordingLogger};

    fn tiny_config() -> VqVaeConfig {
        VqVaeConfig {
            features_filters: 4,
            num_hiddens: 8,
            num_residual_hiddens: 4,
            num_residual_layers: 1,
            embedding_dim: 2,
            num_embeddings: 4,
            batch_size: 2,
            num_training_updates: 2,
            log_every: 1,
            ..Default::default()
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        global: Configuration,
        factory: Arc<dyn FeatureStreamFactory>,
    }

    impl Fixture {
        fn new() -> Self {
            let config = tiny_config();
            Self {
                dir: tempfile::tempdir().unwrap(),
                global: config.to_configuration().unwrap(),
                factory: Arc::new(random_stream(&config, 3, 2, 12)),
            }
        }

        fn experiments(&self) -> PathBuf {
            self.dir.path().join("experiments")
        }

        fn results(&self) -> PathBuf {
            self.dir.path().join("results")
        }

        fn open(
            &self,
            name: &str,
            overrides: &Configuration,
        ) -> (Experiment, Arc<RecordingLogger>) {
            let logger = Arc::new(RecordingLogger::default());
            let experiment = Experiment::new(
                name,
                self.experiments(),
                self.results(),
                &self.global,
                overrides,
                self.factory.clone(),
                logger.clone(),
            )
            .unwrap();
            (experiment, logger)
        }
    }

    #[test]
    fn test_new_experiment_persists_merged_configuration() {
        let fixture = Fixture::new();
        let overrides =
            Configuration::from_yaml_str("num_embeddings: 8\nnot_a_hyperparameter: 1\n").unwrap();
        let (experiment, logger) = fixture.open("baseline", &overrides);

        assert_eq!(experiment.state(), ExperimentState::New);
        let persisted = Configuration::load(
            &fixture.experiments().join("baseline_configuration.yaml"),
        )
        .unwrap();
        assert_eq!(&persisted, experiment.configuration());
        assert_eq!(persisted.typed().unwrap().num_embeddings, 8);
        assert!(!persisted.contains_key("not_a_hyperparameter"));

        let statuses = logger.messages(Level::Status);
        assert!(statuses
            .iter()
            .any(|m| m.starts_with("Creating results directory")));
        assert!(statuses
            .iter()
            .any(|m| m.starts_with("Creating experiments directory")));
    }

    #[test]
    fn test_existing_configuration_wins_over_overrides() {
        let fixture = Fixture::new();
        let (first, _) = fixture.open("exp", &Configuration::new());
        let persisted = first.configuration().clone();

        let overrides = Configuration::from_yaml_str("num_embeddings: 16\n").unwrap();
        let (second, logger) = fixture.open("exp", &overrides);
        assert_eq!(second.state(), ExperimentState::Resuming);
        assert_eq!(second.configuration(), &persisted);
        assert!(logger
            .messages(Level::Status)
            .iter()
            .any(|m| m.starts_with("Results directory already created")));
    }

    #[test]
    fn test_resume_without_checkpoint_rebuilds() {
        let fixture = Fixture::new();
        let (first, _) = fixture.open("exp", &Configuration::new());
        let persisted = first.configuration().clone();

        let (mut experiment, logger) = fixture.open("exp", &Configuration::new());
        experiment.init().unwrap();

        assert_eq!(experiment.state(), ExperimentState::Ready);
        assert_eq!(experiment.configuration(), &persisted);
        assert_eq!(experiment.trainer().unwrap().step(), 0);
        let errors = logger.messages(Level::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].ends_with("Building a new model..."));
    }

    #[test]
    fn test_corrupted_checkpoint_falls_back_to_fresh_model() {
        let fixture = Fixture::new();
        let (first, _) = fixture.open("exp", &Configuration::new());
        let persisted = first.configuration().clone();
        std::fs::write(
            fixture.experiments().join("exp_checkpoint.json"),
            b"\x00\x01 definitely not json",
        )
        .unwrap();

        let (mut experiment, logger) = fixture.open("exp", &Configuration::new());
        experiment.init().unwrap();

        assert_eq!(experiment.state(), ExperimentState::Ready);
        assert_eq!(experiment.configuration(), &persisted);
        assert_eq!(logger.messages(Level::Error).len(), 1);
    }

    #[test]
    fn test_train_then_resume_restores_step() {
        let fixture = Fixture::new();
        let (mut experiment, logger) = fixture.open("exp", &Configuration::new());
        let history = experiment.train().unwrap();
        assert_eq!(history.len(), 2);
        assert!(experiment.training_history_path().is_file());
        assert!(experiment.loss_plot_path().is_file());
        assert_eq!(logger.messages(Level::Success).len(), 1);
        let codebook = experiment
            .model()
            .unwrap()
            .quantizer()
            .codebook()
            .to_vec2::<f32>()
            .unwrap();

        let (mut resumed, logger) = fixture.open("exp", &Configuration::new());
        resumed.init().unwrap();
        assert!(logger.messages(Level::Error).is_empty());
        assert_eq!(resumed.trainer().unwrap().step(), 2);
        assert_eq!(resumed.trainer().unwrap().history().len(), 2);
        assert_eq!(
            resumed
                .model()
                .unwrap()
                .quantizer()
                .codebook()
                .to_vec2::<f32>()
                .unwrap(),
            codebook
        );

        // nothing left to train
        assert_eq!(resumed.train().unwrap().len(), 2);
    }

    #[test]
    fn test_legacy_manifest_rebuilds_from_referenced_configuration() {
        let fixture = Fixture::new();
        let (first, _) = fixture.open("exp", &Configuration::new());
        let mut legacy = first.configuration().clone();
        legacy.insert("num_embeddings", 6);
        legacy
            .save(&fixture.experiments().join("legacy_configuration.yaml"))
            .unwrap();
        std::fs::write(
            fixture.experiments().join("exp_checkpoint.json"),
            r#"{"configuration_file": "legacy_configuration.yaml"}"#,
        )
        .unwrap();

        let (mut experiment, logger) = fixture.open("exp", &Configuration::new());
        experiment.init().unwrap();

        assert!(logger.messages(Level::Error).is_empty());
        assert_eq!(experiment.configuration(), &legacy);
        assert_eq!(
            experiment.model().unwrap().quantizer().num_embeddings(),
            6
        );
        let persisted =
            Configuration::load(&fixture.experiments().join("exp_configuration.yaml")).unwrap();
        assert_eq!(persisted, legacy);
    }

    #[test]
    fn test_legacy_configuration_drives_device_selection() {
        let fixture = Fixture::new();
        let (first, _) = fixture.open("exp", &Configuration::new());
        assert!(first.device_configuration().gpu_ids.is_empty());

        let mut legacy = first.configuration().clone();
        legacy.insert("use_cuda", true);
        legacy.insert("gpu_ids", vec![1u64]);
        legacy
            .save(&fixture.experiments().join("legacy_configuration.yaml"))
            .unwrap();
        std::fs::write(
            fixture.experiments().join("exp_checkpoint.json"),
            r#"{"configuration_file": "legacy_configuration.yaml"}"#,
        )
        .unwrap();

        let (mut experiment, _) = fixture.open("exp", &Configuration::new());
        experiment.init().unwrap();
        assert_eq!(experiment.device_configuration().gpu_ids, vec![1]);
    }

    #[test]
    fn test_unreadable_legacy_configuration_falls_back() {
        let fixture = Fixture::new();
        let (first, _) = fixture.open("exp", &Configuration::new());
        let persisted = first.configuration().clone();
        std::fs::write(
            fixture.experiments().join("exp_checkpoint.json"),
            r#"{"configuration_file": "missing.yaml"}"#,
        )
        .unwrap();

        let (mut experiment, logger) = fixture.open("exp", &Configuration::new());
        experiment.init().unwrap();
        assert_eq!(logger.messages(Level::Error).len(), 1);
        assert_eq!(experiment.configuration(), &persisted);
    }

    #[test]
    fn test_evaluate_writes_plot_and_report() {
        let fixture = Fixture::new();
        let (mut experiment, _) = fixture.open("exp", &Configuration::new());
        let report = experiment.evaluate().unwrap();

        assert_eq!(
            report.plot_path,
            fixture.results().join("exp_evaluation-comparaison-plot.png")
        );
        assert!(report.plot_path.is_file());
        assert!(experiment.evaluation_report_path().is_file());
    }

    #[test]
    fn test_evaluation_state_survives_resume() {
        let fixture = Fixture::new();
        let (mut experiment, _) = fixture.open("exp", &Configuration::new());
        experiment.train().unwrap();
        let report = experiment.evaluate().unwrap();

        let (mut resumed, logger) = fixture.open("exp", &Configuration::new());
        resumed.init().unwrap();
        assert!(logger.messages(Level::Error).is_empty());
        assert_eq!(resumed.trainer().unwrap().step(), 2);
        assert_eq!(
            resumed.evaluator().unwrap().state().last_report.as_ref(),
            Some(&report)
        );
    }

    #[test]
    fn test_init_is_idempotent() {
        let fixture = Fixture::new();
        let (mut experiment, logger) = fixture.open("exp", &Configuration::new());
        experiment.init().unwrap();
        let loads = logger.messages(Level::Status).len();
        experiment.init().unwrap();
        assert_eq!(logger.messages(Level::Status).len(), loads);
        assert_eq!(experiment.state(), ExperimentState::Ready);
    }

    #[test]
    fn test_rejected_overrides_are_not_persisted() {
        let fixture = Fixture::new();
        let invalid = Configuration::from_yaml_str("num_embeddings: 0\n").unwrap();
        let result = Experiment::new(
            "exp",
            fixture.experiments(),
            fixture.results(),
            &fixture.global,
            &invalid,
            fixture.factory.clone(),
            Arc::new(RecordingLogger::default()),
        );
        assert!(matches!(result, Err(Error::ConfigError(_))));
        assert!(!fixture
            .experiments()
            .join("exp_configuration.yaml")
            .exists());

        let (experiment, _) = fixture.open("exp", &Configuration::new());
        assert_eq!(experiment.state(), ExperimentState::New);
        assert_eq!(
            experiment.configuration().typed().unwrap().num_embeddings,
            4
        );
    }

    #[test]
    fn test_invalid_persisted_configuration_is_fatal() {
        let fixture = Fixture::new();
        std::fs::create_dir_all(fixture.experiments()).unwrap();
        std::fs::write(
            fixture.experiments().join("exp_configuration.yaml"),
            "num_hiddens: [unterminated\n",
        )
        .unwrap();

        let result = Experiment::new(
            "exp",
            fixture.experiments(),
            fixture.results(),
            &fixture.global,
            &Configuration::new(),
            fixture.factory.clone(),
            Arc::new(RecordingLogger::default()),
        );
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }
}
