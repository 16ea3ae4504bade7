//! Adam optimizer for candle `Var`s, with optional AMSGrad.
//!
//! Moment estimates are kept per named parameter so they can be written next
//! to the model weights and restored when an experiment resumes.

use std::collections::HashMap;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};

use crate::config::VqVaeConfig;
use crate::error::{Error, Result};

const STEP_KEY: &str = "__step__";

/// Adam hyperparameters.
#[derive(Debug, Clone)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Normalise by the running maximum of the second moment
    pub amsgrad: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            amsgrad: false,
        }
    }
}

impl AdamConfig {
    pub fn from_config(config: &VqVaeConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            amsgrad: config.use_amsgrad,
            ..Default::default()
        }
    }
}

struct TrackedParam {
    name: String,
    var: Var,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
    max_exp_avg_sq: Option<Tensor>,
}

pub struct Adam {
    config: AdamConfig,
    params: Vec<TrackedParam>,
    step: usize,
}

impl Adam {
    pub fn new(config: AdamConfig, vars: Vec<(String, Var)>) -> Result<Self> {
        let params = vars
            .into_iter()
            .map(|(name, var)| {
                let zeros = var.as_tensor().zeros_like()?;
                Ok(TrackedParam {
                    name,
                    exp_avg: zeros.clone(),
                    max_exp_avg_sq: config.amsgrad.then(|| zeros.clone()),
                    exp_avg_sq: zeros,
                    var,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn global_step(&self) -> usize {
        self.step
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// Apply one update from `grads`. Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;
        let t = self.step as i32;
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            ..
        } = self.config;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);
        let step_size = learning_rate / bias_correction1;

        for param in &mut self.params {
            let Some(grad) = grads.get(param.var.as_tensor()) else {
                continue;
            };

            param.exp_avg = (param.exp_avg.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?
                .detach();
            param.exp_avg_sq = (param.exp_avg_sq.affine(beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - beta2, 0.0)?)?
            .detach();

            let second_moment = match &mut param.max_exp_avg_sq {
                Some(max) => {
                    *max = max.maximum(&param.exp_avg_sq)?.detach();
                    max.clone()
                }
                None => param.exp_avg_sq.clone(),
            };

            let denom = second_moment
                .sqrt()?
                .affine(1.0 / bias_correction2.sqrt(), epsilon)?;
            let update = (&param.exp_avg / denom)?.affine(step_size, 0.0)?;
            let next = (param.var.as_tensor() - update)?.detach();
            param.var.set(&next)?;
        }
        Ok(())
    }

    /// Moment estimates keyed `<param>.exp_avg`, `<param>.exp_avg_sq` and,
    /// with AMSGrad, `<param>.max_exp_avg_sq`.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for param in &self.params {
            state.insert(format!("{}.exp_avg", param.name), param.exp_avg.clone());
            state.insert(format!("{}.exp_avg_sq", param.name), param.exp_avg_sq.clone());
            if let Some(max) = &param.max_exp_avg_sq {
                state.insert(format!("{}.max_exp_avg_sq", param.name), max.clone());
            }
        }
        let device = self
            .params
            .first()
            .map(|p| p.var.device().clone())
            .unwrap_or(Device::Cpu);
        state.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step as u32], &device)?,
        );
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        candle_core::safetensors::save(&self.state_tensors()?, path)?;
        Ok(())
    }

    /// Restore moments saved by [`Adam::save`] for the same parameter set.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let device = self
            .params
            .first()
            .map(|p| p.var.device().clone())
            .unwrap_or(Device::Cpu);
        let mut state = candle_core::safetensors::load(path, &device).map_err(|e| {
            Error::CheckpointError(format!(
                "Failed to read optimizer state {}: {e}",
                path.display()
            ))
        })?;

        for param in &mut self.params {
            let mut take = |suffix: &str| -> Result<Tensor> {
                let key = format!("{}.{suffix}", param.name);
                let tensor = state.remove(&key).ok_or_else(|| {
                    Error::CheckpointError(format!("Optimizer state is missing `{key}`"))
                })?;
                if tensor.dims() != param.var.dims() {
                    return Err(Error::CheckpointError(format!(
                        "Optimizer state `{key}` has shape {:?}, parameter has {:?}",
                        tensor.dims(),
                        param.var.dims()
                    )));
                }
                Ok(tensor.to_dtype(param.var.dtype())?)
            };
            param.exp_avg = take("exp_avg")?;
            param.exp_avg_sq = take("exp_avg_sq")?;
            if param.max_exp_avg_sq.is_some() {
                // Saved without AMSGrad: restart the running maximum from the second moment.
                param.max_exp_avg_sq =
                    Some(take("max_exp_avg_sq").unwrap_or_else(|_| param.exp_avg_sq.clone()));
            }
        }

        self.step = match state.remove(STEP_KEY) {
            Some(step) => step
                .to_dtype(DType::U32)?
                .flatten_all()?
                .to_vec1::<u32>()?
                .first()
                .copied()
                .unwrap_or(0) as usize,
            None => 0,
        };
        Ok(())
    }
}
