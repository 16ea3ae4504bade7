//! Sequential execution of a list of named experiments.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_yaml::Value;
use tracing::info;

use super::Experiment;
use crate::config::Configuration;
use crate::data::FeatureStreamFactory;
use crate::error::{Error, Result};
use crate::evaluation::EvaluationReport;
use crate::logging::{StatusLogger, TracingLogger};
use crate::training::TrainingHistory;

/// One entry of an experiments file.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentEntry {
    pub name: String,
    pub overrides: Configuration,
}

/// What a run produced for one experiment.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub name: String,
    pub history: TrainingHistory,
    pub report: Option<EvaluationReport>,
}

/// Parse a YAML mapping of experiment names to override mappings, keeping file order.
///
/// ```yaml
/// baseline: {}
/// ema:
///   decay: 0.99
/// ```
pub fn parse_experiments(source: &str) -> Result<Vec<ExperimentEntry>> {
    let document: Value = serde_yaml::from_str(source)
        .map_err(|e| Error::ConfigError(format!("Malformed experiments file: {e}")))?;
    let mapping = match document {
        Value::Mapping(mapping) => mapping,
        Value::Null => return Ok(Vec::new()),
        _ => {
            return Err(Error::ConfigError(
                "Experiments file must map experiment names to overrides".to_string(),
            ))
        }
    };

    mapping
        .into_iter()
        .map(|(name, overrides)| {
            let name = match name {
                Value::String(name) => name,
                other => {
                    return Err(Error::ConfigError(format!(
                        "Experiment names must be strings, found {other:?}"
                    )))
                }
            };
            Ok(ExperimentEntry {
                name,
                overrides: Configuration::from_value(overrides)?,
            })
        })
        .collect()
}

pub fn load_experiments(path: &Path) -> Result<Vec<ExperimentEntry>> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to read experiments file {}: {e}",
            path.display()
        ))
    })?;
    parse_experiments(&source)
}

type LoggerFactory = Box<dyn Fn(&str) -> Arc<dyn StatusLogger> + Send + Sync>;

/// Runs experiments one after the other against shared paths and defaults.
pub struct ExperimentRunner {
    experiments_path: PathBuf,
    results_path: PathBuf,
    global: Configuration,
    stream_factory: Arc<dyn FeatureStreamFactory>,
    evaluate: bool,
    make_logger: LoggerFactory,
}

impl ExperimentRunner {
    pub fn new(
        experiments_path: impl Into<PathBuf>,
        results_path: impl Into<PathBuf>,
        global: Configuration,
        stream_factory: Arc<dyn FeatureStreamFactory>,
    ) -> Self {
        Self {
            experiments_path: experiments_path.into(),
            results_path: results_path.into(),
            global,
            stream_factory,
            evaluate: false,
            make_logger: Box::new(|name: &str| -> Arc<dyn StatusLogger> {
                Arc::new(TracingLogger::new(name))
            }),
        }
    }

    /// Evaluate each experiment after training it.
    pub fn with_evaluation(mut self, evaluate: bool) -> Self {
        self.evaluate = evaluate;
        self
    }

    pub fn with_logger_factory<F>(mut self, make_logger: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn StatusLogger> + Send + Sync + 'static,
    {
        self.make_logger = Box::new(make_logger);
        self
    }

    pub fn experiment(&self, entry: &ExperimentEntry) -> Result<Experiment> {
        Experiment::new(
            entry.name.clone(),
            self.experiments_path.clone(),
            self.results_path.clone(),
            &self.global,
            &entry.overrides,
            self.stream_factory.clone(),
            (self.make_logger)(&entry.name),
        )
    }

    /// Train (and optionally evaluate) every experiment in order. Stops at the
    /// first failure.
    pub fn run(&self, entries: &[ExperimentEntry]) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            info!("Experiment {}/{}: {}", index + 1, entries.len(), entry.name);
            let mut experiment = self.experiment(entry)?;
            let history = experiment.train()?;
            let report = if self.evaluate {
                Some(experiment.evaluate()?)
            } else {
                None
            };
            summaries.push(RunSummary {
                name: entry.name.clone(),
                history,
                report,
            });
        }
        Ok(summaries)
    }
}
