//! Optimisation of the VQ-VAE parameters.

pub mod optimizer;
pub mod trainer;

pub use optimizer::{Adam, AdamConfig};
pub use trainer::{reconstruction_error, StepRecord, Trainer, TrainerState, TrainingHistory};
