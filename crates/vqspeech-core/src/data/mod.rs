//! Feature batches and the streams that produce them.
//!
//! A stream hands out batches of `(batch, time, filters)` feature tensors for a
//! training and a validation split. Every batch is cropped to the shortest
//! utterance it contains.

mod directory;
mod memory;

pub use directory::{write_shard, FeaturesDirectoryFactory, FeaturesDirectoryStream};
pub use memory::InMemoryFeatureStream;

#[cfg(test)]
pub(crate) use memory::testing;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;

use crate::config::VqVaeConfig;
use crate::error::{Error, Result};

/// Fallible iterator over the batches of one split.
pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<FeatureBatch>> + 'a>;

/// One utterance before batching.
#[derive(Debug, Clone)]
pub struct FeatureExample {
    /// `(time, features_filters)`
    pub input_features: Tensor,
    /// `(time, output_filters)`
    pub output_features: Tensor,
    /// Optional per-frame side information, `(time, n)`
    pub aux_features: Option<Tensor>,
    pub speaker_id: u32,
    pub wav_filename: String,
}

impl FeatureExample {
    pub fn num_frames(&self) -> Result<usize> {
        Ok(self.input_features.dims2()?.0)
    }
}

/// A collated batch.
#[derive(Debug, Clone)]
pub struct FeatureBatch {
    /// `(batch, time, features_filters)`
    pub input_features: Tensor,
    /// `(batch,)` u32
    pub speaker_ids: Tensor,
    /// `(batch, time, n)` when every utterance carries side features
    pub aux_features: Option<Tensor>,
    /// `(batch, time, output_filters)`
    pub target_features: Tensor,
    pub wav_filenames: Vec<String>,
}

impl FeatureBatch {
    /// `(original_features, speaker_ids, aux_features, target_features, wav_filenames)`
    pub fn into_parts(self) -> (Tensor, Tensor, Option<Tensor>, Tensor, Vec<String>) {
        (
            self.input_features,
            self.speaker_ids,
            self.aux_features,
            self.target_features,
            self.wav_filenames,
        )
    }

    pub fn len(&self) -> usize {
        self.wav_filenames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wav_filenames.is_empty()
    }
}

/// Source of training and validation batches.
pub trait FeatureStream {
    fn training_loader(&self) -> Result<BatchIter<'_>>;
    fn validation_loader(&self) -> Result<BatchIter<'_>>;
}

/// Opens the data stream an experiment trains and evaluates on.
pub trait FeatureStreamFactory: Send + Sync {
    fn open(&self, config: &VqVaeConfig, device: &Device) -> Result<Box<dyn FeatureStream>>;
}

/// Stack utterances into a batch, cropping every tensor to the shortest one.
pub fn collate(examples: &[FeatureExample]) -> Result<FeatureBatch> {
    let first = examples
        .first()
        .ok_or_else(|| Error::DataError("Cannot collate an empty batch".to_string()))?;
    let (_, input_filters) = first.input_features.dims2()?;
    let (_, output_filters) = first.output_features.dims2()?;

    let mut frames = usize::MAX;
    for example in examples {
        let (t_in, f_in) = example.input_features.dims2()?;
        let (t_out, f_out) = example.output_features.dims2()?;
        if f_in != input_filters || f_out != output_filters {
            return Err(Error::DataError(format!(
                "Utterance {} has ({f_in}, {f_out}) filters, batch expects ({input_filters}, {output_filters})",
                example.wav_filename
            )));
        }
        frames = frames.min(t_in).min(t_out);
        if let Some(aux) = &example.aux_features {
            frames = frames.min(aux.dims2()?.0);
        }
    }

    let crop = |t: &Tensor| t.narrow(0, 0, frames);
    let inputs = examples
        .iter()
        .map(|e| crop(&e.input_features))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let targets = examples
        .iter()
        .map(|e| crop(&e.output_features))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let aux_features = examples
        .iter()
        .map(|e| e.aux_features.as_ref().map(crop))
        .collect::<Option<candle_core::Result<Vec<_>>>>()
        .transpose()?
        .map(|aux| Tensor::stack(&aux, 0))
        .transpose()?;

    let speaker_ids: Vec<u32> = examples.iter().map(|e| e.speaker_id).collect();
    let device = first.input_features.device();

    Ok(FeatureBatch {
        input_features: Tensor::stack(&inputs, 0)?,
        speaker_ids: Tensor::new(speaker_ids.as_slice(), device)?,
        aux_features,
        target_features: Tensor::stack(&targets, 0)?,
        wav_filenames: examples.iter().map(|e| e.wav_filename.clone()).collect(),
    })
}

/// Visit order for one pass over `len` utterances.
fn epoch_order(len: usize, shuffle: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if shuffle {
        order.shuffle(&mut rand::thread_rng());
    }
    order
}

/// Lazily load and collate `order` in chunks of `batch_size`.
fn batched<'a, F>(order: Vec<usize>, batch_size: usize, load: F) -> BatchIter<'a>
where
    F: Fn(usize) -> Result<FeatureExample> + 'a,
{
    let chunks: Vec<Vec<usize>> = order
        .chunks(batch_size.max(1))
        .map(<[usize]>::to_vec)
        .collect();
    Box::new(chunks.into_iter().map(move |chunk| {
        let examples = chunk
            .iter()
            .map(|&index| load(index))
            .collect::<Result<Vec<_>>>()?;
        collate(&examples)
    }))
}
