//! vqspeech Core - VQ-VAE for speech feature frames
//!
//! This crate trains and evaluates a convolutional VQ-VAE that compresses
//! acoustic feature frames (log filterbanks, MFCCs) into sequences of discrete
//! codebook indices and reconstructs them, on CPU or CUDA devices via candle.
//!
//! # Architecture
//!
//! - [`models`]: encoder, vector quantizer (gradient or EMA codebook), decoder
//! - [`data`]: batched feature streams over in-memory or on-disk shards
//! - [`training`]: Adam/AMSGrad optimisation loop with history tracking
//! - [`evaluation`]: reconstruction metrics and comparison plots
//! - [`experiment`]: named, resumable experiments with checkpoint fallback
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vqspeech_core::{Configuration, Experiment, FeaturesDirectoryFactory, TracingLogger};
//!
//! let global = Configuration::defaults()?;
//! let overrides = Configuration::from_yaml_str("num_hiddens: 128\n")?;
//! let mut experiment = Experiment::new(
//!     "baseline",
//!     "experiments",
//!     "results",
//!     &global,
//!     &overrides,
//!     Arc::new(FeaturesDirectoryFactory),
//!     Arc::new(TracingLogger::new("baseline")),
//! )?;
//! experiment.train()?;
//! let report = experiment.evaluate()?;
//! ```

pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod evaluation;
pub mod experiment;
pub mod logging;
pub mod models;
pub mod training;

pub use config::{Configuration, VqVaeConfig};
pub use error::{Error, Result};
pub use logging::{StatusLogger, TracingLogger};

pub use data::{
    FeatureBatch, FeatureStream, FeatureStreamFactory, FeaturesDirectoryFactory,
    FeaturesDirectoryStream, InMemoryFeatureStream,
};
pub use device::{DeviceConfiguration, DeviceKind};
pub use evaluation::{EvaluationReport, Evaluator};
pub use experiment::{
    CheckpointStore, Experiment, ExperimentRunner, ExperimentEntry, ExperimentState, LoadResult,
};
pub use models::{ConvolutionalVqVae, ModelOutput, VqOutput};
pub use training::{Trainer, TrainingHistory};
