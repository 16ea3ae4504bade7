//! Configuration types for vqspeech experiments.
//!
//! A [`Configuration`] is the free-form key/value document persisted next to
//! every experiment. [`VqVaeConfig`] is the typed view the model, trainer and
//! data stream read from it.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Flat hyperparameter document, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    entries: BTreeMap<String, Value>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in global defaults, i.e. `VqVaeConfig::default()` as a document.
    pub fn defaults() -> Result<Self> {
        VqVaeConfig::default().to_configuration()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge experiment overrides into the global defaults.
    ///
    /// An override replaces the default value only when the key already exists
    /// in `global`; unknown override keys are dropped.
    pub fn merged(global: &Configuration, overrides: &Configuration) -> Configuration {
        let mut merged = global.clone();
        for (key, value) in &overrides.entries {
            if let Some(slot) = merged.entries.get_mut(key) {
                *slot = value.clone();
            }
        }
        merged
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(source)
            .map_err(|e| Error::ConfigError(format!("Malformed configuration document: {e}")))?;
        Self::from_value(value)
    }

    /// Build from an already-parsed YAML value; only string-keyed mappings are accepted.
    pub fn from_value(value: Value) -> Result<Self> {
        let mapping = match value {
            Value::Mapping(mapping) => mapping,
            Value::Null => Mapping::new(),
            other => {
                return Err(Error::ConfigError(format!(
                    "Configuration must be a mapping, found {}",
                    value_kind(&other)
                )))
            }
        };

        let mut entries = BTreeMap::new();
        for (key, value) in mapping {
            let key = match key {
                Value::String(key) => key,
                other => {
                    return Err(Error::ConfigError(format!(
                        "Configuration keys must be strings, found {}",
                        value_kind(&other)
                    )))
                }
            };
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to read configuration {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&source)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.entries)?)
    }

    /// SHA-256 of the canonical YAML rendering, hex encoded.
    pub fn fingerprint(&self) -> Result<String> {
        let digest = Sha256::digest(self.to_yaml_string()?.as_bytes());
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Typed view; missing keys fall back to their defaults, unknown keys are ignored.
    pub fn typed(&self) -> Result<VqVaeConfig> {
        let mapping: Mapping = self
            .entries
            .iter()
            .map(|(k, v)| (Value::String(k.clone()), v.clone()))
            .collect();
        let config: VqVaeConfig = serde_yaml::from_value(Value::Mapping(mapping))
            .map_err(|e| Error::ConfigError(format!("Invalid hyperparameter value: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Hyperparameters of a VQ-VAE speech experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VqVaeConfig {
    /// Number of filters per input feature frame
    #[serde(default = "default_features_filters")]
    pub features_filters: usize,

    /// Targets carry deltas and delta-deltas (3x the filters)
    #[serde(default)]
    pub augment_output_features: bool,

    #[serde(default = "default_num_hiddens")]
    pub num_hiddens: usize,

    #[serde(default = "default_num_residual_layers")]
    pub num_residual_layers: usize,

    #[serde(default = "default_num_residual_hiddens")]
    pub num_residual_hiddens: usize,

    /// Codebook vector dimension (D)
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Codebook size (K)
    #[serde(default = "default_num_embeddings")]
    pub num_embeddings: usize,

    #[serde(default = "default_commitment_cost")]
    pub commitment_cost: f64,

    /// EMA decay for codebook updates; 0 selects the gradient-trained codebook
    #[serde(default)]
    pub decay: f64,

    #[serde(default = "default_use_kaiming_normal")]
    pub use_kaiming_normal: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_num_training_updates")]
    pub num_training_updates: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_use_amsgrad")]
    pub use_amsgrad: bool,

    /// Report training progress every N updates
    #[serde(default = "default_log_every")]
    pub log_every: usize,

    #[serde(default = "default_shuffle_dataset")]
    pub shuffle_dataset: bool,

    /// Root of the feature shards (`train/` and `val/` below it)
    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,

    #[serde(default)]
    pub use_cuda: bool,

    #[serde(default = "default_gpu_ids")]
    pub gpu_ids: Vec<usize>,

    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,

    #[serde(default = "default_input_features_type")]
    pub input_features_type: String,
}

fn default_features_filters() -> usize {
    80
}
fn default_num_hiddens() -> usize {
    768
}
fn default_num_residual_layers() -> usize {
    2
}
fn default_num_residual_hiddens() -> usize {
    32
}
fn default_embedding_dim() -> usize {
    64
}
fn default_num_embeddings() -> usize {
    512
}
fn default_commitment_cost() -> f64 {
    0.25
}
fn default_use_kaiming_normal() -> bool {
    true
}
fn default_batch_size() -> usize {
    32
}
fn default_num_training_updates() -> usize {
    25000
}
fn default_learning_rate() -> f64 {
    4e-4
}
fn default_use_amsgrad() -> bool {
    true
}
fn default_log_every() -> usize {
    100
}
fn default_shuffle_dataset() -> bool {
    true
}
fn default_dataset_path() -> PathBuf {
    PathBuf::from("../data/vctk")
}
fn default_gpu_ids() -> Vec<usize> {
    vec![0]
}
fn default_sampling_rate() -> u32 {
    16000
}
fn default_input_features_type() -> String {
    "log_filterbank".to_string()
}

impl Default for VqVaeConfig {
    fn default() -> Self {
        Self {
            features_filters: default_features_filters(),
            augment_output_features: false,
            num_hiddens: default_num_hiddens(),
            num_residual_layers: default_num_residual_layers(),
            num_residual_hiddens: default_num_residual_hiddens(),
            embedding_dim: default_embedding_dim(),
            num_embeddings: default_num_embeddings(),
            commitment_cost: default_commitment_cost(),
            decay: 0.0,
            use_kaiming_normal: default_use_kaiming_normal(),
            batch_size: default_batch_size(),
            num_training_updates: default_num_training_updates(),
            learning_rate: default_learning_rate(),
            use_amsgrad: default_use_amsgrad(),
            log_every: default_log_every(),
            shuffle_dataset: default_shuffle_dataset(),
            dataset_path: default_dataset_path(),
            use_cuda: false,
            gpu_ids: default_gpu_ids(),
            sampling_rate: default_sampling_rate(),
            input_features_type: default_input_features_type(),
        }
    }
}

impl VqVaeConfig {
    /// Filter count of the decoder output and of the target features
    pub fn output_filters(&self) -> usize {
        if self.augment_output_features {
            self.features_filters * 3
        } else {
            self.features_filters
        }
    }

    /// Whether the codebook is maintained by exponential moving averages
    pub fn uses_ema(&self) -> bool {
        self.decay > 0.0
    }

    pub fn to_configuration(&self) -> Result<Configuration> {
        Configuration::from_value(serde_yaml::to_value(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("features_filters", self.features_filters),
            ("num_hiddens", self.num_hiddens),
            ("num_residual_hiddens", self.num_residual_hiddens),
            ("embedding_dim", self.embedding_dim),
            ("num_embeddings", self.num_embeddings),
            ("batch_size", self.batch_size),
            ("log_every", self.log_every),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::ConfigError(format!("`{name}` must be positive")));
            }
        }
        if self.commitment_cost < 0.0 {
            return Err(Error::ConfigError(
                "`commitment_cost` must be non-negative".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.decay) {
            return Err(Error::ConfigError(format!(
                "`decay` must lie in [0, 1), got {}",
                self.decay
            )));
        }
        if self.learning_rate <= 0.0 {
            return Err(Error::ConfigError(
                "`learning_rate` must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
