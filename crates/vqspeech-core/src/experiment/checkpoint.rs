//! Checkpoint bundles: a JSON manifest next to model and optimizer weights.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::evaluation::EvaluatorState;
use crate::training::TrainerState;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Manifest written by the current format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub format_version: u32,
    /// Configuration file name, relative to the experiments directory
    pub configuration_file: String,
    /// SHA-256 of the configuration the weights were trained with
    pub configuration_fingerprint: String,
    pub model_file: String,
    pub optimizer_file: String,
    pub trainer: TrainerState,
    pub evaluator: EvaluatorState,
}

/// Older manifests only point at their configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LegacyManifest {
    configuration_file: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestDocument {
    Current(CheckpointManifest),
    Legacy(LegacyManifest),
}

/// Everything needed to restore a model, trainer and evaluator.
#[derive(Debug, Clone)]
pub struct CheckpointBundle {
    pub manifest: CheckpointManifest,
    pub model_path: PathBuf,
    pub optimizer_path: PathBuf,
}

/// What a checkpoint on disk turned out to contain.
#[derive(Debug, Clone)]
pub enum LoadResult {
    Full(Box<CheckpointBundle>),
    /// Only the name of a configuration file to rebuild from
    LegacyConfigOnly(String),
}

/// File layout of one experiment's checkpoint under the experiments directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    experiments_path: PathBuf,
    name: String,
}

impl CheckpointStore {
    pub fn new(experiments_path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            experiments_path: experiments_path.into(),
            name: name.into(),
        }
    }

    pub fn configuration_file(&self) -> String {
        format!("{}_configuration.yaml", self.name)
    }

    pub fn configuration_path(&self) -> PathBuf {
        self.experiments_path.join(self.configuration_file())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.experiments_path
            .join(format!("{}_checkpoint.json", self.name))
    }

    fn model_file(&self) -> String {
        format!("{}_model.safetensors", self.name)
    }

    fn optimizer_file(&self) -> String {
        format!("{}_optimizer.safetensors", self.name)
    }

    /// Resolve a file named in a manifest against the experiments directory.
    pub fn resolve(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.experiments_path.join(path)
        }
    }

    /// Write the manifest for weights produced by `write_weights`.
    ///
    /// `write_weights` receives the model and optimizer paths. The manifest is
    /// written last, through a temporary file, so a crash leaves either the
    /// previous manifest or none.
    pub fn save<F>(
        &self,
        configuration_fingerprint: &str,
        trainer: &TrainerState,
        evaluator: &EvaluatorState,
        write_weights: F,
    ) -> Result<PathBuf>
    where
        F: FnOnce(&Path, &Path) -> Result<()>,
    {
        let manifest = CheckpointManifest {
            format_version: CHECKPOINT_FORMAT_VERSION,
            configuration_file: self.configuration_file(),
            configuration_fingerprint: configuration_fingerprint.to_string(),
            model_file: self.model_file(),
            optimizer_file: self.optimizer_file(),
            trainer: trainer.clone(),
            evaluator: evaluator.clone(),
        };
        write_weights(
            &self.resolve(&manifest.model_file),
            &self.resolve(&manifest.optimizer_file),
        )?;

        let path = self.manifest_path();
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, serde_json::to_vec_pretty(&manifest)?)?;
        std::fs::rename(&staging, &path)?;
        info!("Saved checkpoint at step {} to {}", trainer.step, path.display());
        Ok(path)
    }

    /// Read the manifest; a current manifest must match `expected_fingerprint`
    /// and its weight files must exist.
    pub fn load(&self, expected_fingerprint: &str) -> Result<LoadResult> {
        let path = self.manifest_path();
        let bytes = std::fs::read(&path).map_err(|e| {
            Error::CheckpointError(format!("Cannot read {}: {e}", path.display()))
        })?;
        let document: ManifestDocument = serde_json::from_slice(&bytes).map_err(|e| {
            Error::CheckpointError(format!("Corrupt manifest {}: {e}", path.display()))
        })?;

        let manifest = match document {
            ManifestDocument::Legacy(legacy) => {
                debug!("Legacy manifest at {}", path.display());
                return Ok(LoadResult::LegacyConfigOnly(legacy.configuration_file));
            }
            ManifestDocument::Current(manifest) => manifest,
        };

        if manifest.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(Error::CheckpointError(format!(
                "Unsupported checkpoint format version {}",
                manifest.format_version
            )));
        }
        if manifest.configuration_fingerprint != expected_fingerprint {
            return Err(Error::CheckpointError(
                "Checkpoint was written for a different configuration".to_string(),
            ));
        }

        let model_path = self.resolve(&manifest.model_file);
        let optimizer_path = self.resolve(&manifest.optimizer_file);
        for weights in [&model_path, &optimizer_path] {
            if !weights.is_file() {
                return Err(Error::CheckpointError(format!(
                    "Missing checkpoint file {}",
                    weights.display()
                )));
            }
        }

        Ok(LoadResult::Full(Box::new(CheckpointBundle {
            manifest,
            model_path,
            optimizer_path,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch_weights(model: &Path, optimizer: &Path) -> Result<()> {
        std::fs::write(model, b"model")?;
        std::fs::write(optimizer, b"optimizer")?;
        Ok(())
    }

    #[test]
    fn test_save_then_load_full_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "baseline");
        let trainer = TrainerState {
            step: 42,
            ..Default::default()
        };
        store
            .save("abc", &trainer, &EvaluatorState::default(), touch_weights)
            .unwrap();

        match store.load("abc").unwrap() {
            LoadResult::Full(bundle) => {
                assert_eq!(bundle.manifest.trainer.step, 42);
                assert_eq!(bundle.model_path, dir.path().join("baseline_model.safetensors"));
                assert_eq!(bundle.manifest.configuration_file, "baseline_configuration.yaml");
            }
            other => panic!("expected a full bundle, got {other:?}"),
        }
        assert!(!dir.path().join("baseline_checkpoint.json.tmp").exists());
    }

    #[test]
    fn test_legacy_manifest_names_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "old");
        std::fs::write(
            store.manifest_path(),
            r#"{"configuration_file": "old_configuration.yaml"}"#,
        )
        .unwrap();

        match store.load("ignored").unwrap() {
            LoadResult::LegacyConfigOnly(file) => assert_eq!(file, "old_configuration.yaml"),
            other => panic!("expected a legacy manifest, got {other:?}"),
        }
    }

    #[test]
    fn test_unreadable_checkpoints_are_checkpoint_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "broken");

        // absent
        assert!(matches!(store.load("x"), Err(Error::CheckpointError(_))));

        // corrupt JSON
        std::fs::write(store.manifest_path(), b"{\"format_version\": 1, ").unwrap();
        assert!(matches!(store.load("x"), Err(Error::CheckpointError(_))));

        // truncated manifest is not mistaken for a legacy one
        std::fs::write(
            store.manifest_path(),
            r#"{"format_version": 1, "configuration_file": "broken_configuration.yaml"}"#,
        )
        .unwrap();
        assert!(matches!(store.load("x"), Err(Error::CheckpointError(_))));
    }

    #[test]
    fn test_fingerprint_mismatch_and_missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "exp");
        store
            .save(
                "abc",
                &TrainerState::default(),
                &EvaluatorState::default(),
                touch_weights,
            )
            .unwrap();

        assert!(matches!(store.load("def"), Err(Error::CheckpointError(_))));

        std::fs::remove_file(dir.path().join("exp_optimizer.safetensors")).unwrap();
        assert!(matches!(store.load("abc"), Err(Error::CheckpointError(_))));
    }
}
