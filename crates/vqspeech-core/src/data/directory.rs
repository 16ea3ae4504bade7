//! Feature shards on disk: one safetensors file per utterance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use tracing::{debug, info};

use super::{batched, epoch_order, BatchIter, FeatureExample, FeatureStream, FeatureStreamFactory};
use crate::config::VqVaeConfig;
use crate::error::{Error, Result};

const INPUT_FEATURES: &str = "input_features";
const OUTPUT_FEATURES: &str = "output_features";
const AUX_FEATURES: &str = "aux_features";
const SPEAKER_ID: &str = "speaker_id";
const WAV_FILENAME: &str = "wav_filename";

/// Reads `<root>/train/*.safetensors` and `<root>/val/*.safetensors`.
///
/// Shards are listed up front and loaded one batch at a time.
pub struct FeaturesDirectoryStream {
    training: Vec<PathBuf>,
    validation: Vec<PathBuf>,
    batch_size: usize,
    shuffle: bool,
    device: Device,
}

impl FeaturesDirectoryStream {
    pub fn open(root: &Path, batch_size: usize, shuffle: bool, device: &Device) -> Result<Self> {
        let training = list_shards(&root.join("train"))?;
        let validation = list_shards(&root.join("val"))?;
        info!(
            "Feature shards under {}: {} training, {} validation",
            root.display(),
            training.len(),
            validation.len()
        );
        Ok(Self {
            training,
            validation,
            batch_size,
            shuffle,
            device: device.clone(),
        })
    }

    fn loader<'a>(&'a self, shards: &'a [PathBuf], shuffle: bool) -> BatchIter<'a> {
        let order = epoch_order(shards.len(), shuffle);
        batched(order, self.batch_size, move |index| {
            read_shard(&shards[index], &self.device)
        })
    }
}

impl FeatureStream for FeaturesDirectoryStream {
    fn training_loader(&self) -> Result<BatchIter<'_>> {
        Ok(self.loader(&self.training, self.shuffle))
    }

    fn validation_loader(&self) -> Result<BatchIter<'_>> {
        Ok(self.loader(&self.validation, false))
    }
}

/// Opens a [`FeaturesDirectoryStream`] at the configured `dataset_path`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeaturesDirectoryFactory;

impl FeatureStreamFactory for FeaturesDirectoryFactory {
    fn open(&self, config: &VqVaeConfig, device: &Device) -> Result<Box<dyn FeatureStream>> {
        let stream = FeaturesDirectoryStream::open(
            &config.dataset_path,
            config.batch_size,
            config.shuffle_dataset,
            device,
        )?;
        Ok(Box::new(stream))
    }
}

fn list_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::DataError(format!(
            "Feature directory not found: {}",
            dir.display()
        )));
    }
    let mut shards = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("safetensors") {
            shards.push(path);
        }
    }
    shards.sort();
    Ok(shards)
}

/// Load one utterance shard.
pub fn read_shard(path: &Path, device: &Device) -> Result<FeatureExample> {
    let bytes = std::fs::read(path)?;
    let (_, metadata) = SafeTensors::read_metadata(&bytes).map_err(|e| {
        Error::DataError(format!("Invalid feature shard {}: {e}", path.display()))
    })?;
    let wav_filename = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(WAV_FILENAME).cloned())
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

    let mut tensors = candle_core::safetensors::load_buffer(&bytes, device)?;
    let mut take = |name: &str| -> Result<Tensor> {
        let tensor = tensors.remove(name).ok_or_else(|| {
            Error::DataError(format!("{} has no `{name}` tensor", path.display()))
        })?;
        Ok(tensor.to_dtype(DType::F32)?)
    };
    let input_features = take(INPUT_FEATURES)?;
    let output_features = take(OUTPUT_FEATURES)?;
    // Optional, but a present tensor must convert.
    let aux_features = tensors
        .remove(AUX_FEATURES)
        .map(|aux| aux.to_dtype(DType::F32))
        .transpose()?;
    let speaker_id = match tensors.remove(SPEAKER_ID) {
        Some(id) => id
            .to_dtype(DType::U32)?
            .flatten_all()?
            .to_vec1::<u32>()?
            .first()
            .copied()
            .unwrap_or(0),
        None => 0,
    };

    debug!("Loaded {} ({:?})", wav_filename, input_features.dims());
    Ok(FeatureExample {
        input_features,
        output_features,
        aux_features,
        speaker_id,
        wav_filename,
    })
}

/// Write one utterance shard in the layout [`read_shard`] expects.
pub fn write_shard(path: &Path, example: &FeatureExample) -> Result<()> {
    let speaker_id = Tensor::new(&[example.speaker_id], example.input_features.device())?;
    let mut tensors: Vec<(&str, &Tensor)> = vec![
        (INPUT_FEATURES, &example.input_features),
        (OUTPUT_FEATURES, &example.output_features),
        (SPEAKER_ID, &speaker_id),
    ];
    if let Some(aux) = &example.aux_features {
        tensors.push((AUX_FEATURES, aux));
    }
    let metadata = HashMap::from([(WAV_FILENAME.to_string(), example.wav_filename.clone())]);
    safetensors::tensor::serialize_to_file(tensors, &Some(metadata), path).map_err(|e| {
        Error::DataError(format!("Failed to write shard {}: {e}", path.display()))
    })
}
