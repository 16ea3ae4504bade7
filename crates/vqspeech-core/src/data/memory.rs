use candle_core::Device;

use super::{batched, epoch_order, BatchIter, FeatureExample, FeatureStream, FeatureStreamFactory};
use crate::config::VqVaeConfig;
use crate::error::Result;

/// Utterances held in memory. Also acts as its own factory.
#[derive(Debug, Clone)]
pub struct InMemoryFeatureStream {
    training: Vec<FeatureExample>,
    validation: Vec<FeatureExample>,
    batch_size: usize,
    shuffle: bool,
}

impl InMemoryFeatureStream {
    pub fn new(
        training: Vec<FeatureExample>,
        validation: Vec<FeatureExample>,
        batch_size: usize,
        shuffle: bool,
    ) -> Self {
        Self {
            training,
            validation,
            batch_size,
            shuffle,
        }
    }

    fn loader<'a>(&self, examples: &'a [FeatureExample], shuffle: bool) -> BatchIter<'a> {
        let order = epoch_order(examples.len(), shuffle);
        batched(order, self.batch_size, move |index| Ok(examples[index].clone()))
    }
}

impl FeatureStream for InMemoryFeatureStream {
    fn training_loader(&self) -> Result<BatchIter<'_>> {
        Ok(self.loader(&self.training, self.shuffle))
    }

    fn validation_loader(&self) -> Result<BatchIter<'_>> {
        Ok(self.loader(&self.validation, false))
    }
}

impl FeatureStreamFactory for InMemoryFeatureStream {
    fn open(&self, _config: &VqVaeConfig, _device: &Device) -> Result<Box<dyn FeatureStream>> {
        Ok(Box::new(self.clone()))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::random_stream;
    use super::*;

    #[test]
    fn test_in_memory_stream_covers_every_utterance_once() {
        let config = VqVaeConfig {
            features_filters: 3,
            batch_size: 4,
            ..Default::default()
        };
        let stream = random_stream(&config, 10, 3, 6);

        let mut names: Vec<String> = stream
            .training_loader()
            .unwrap()
            .flat_map(|batch| batch.unwrap().wav_filenames)
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 10);

        let batches: Vec<_> = stream.validation_loader().unwrap().collect();
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn test_factory_hands_out_copies() {
        let config = VqVaeConfig {
            features_filters: 2,
            batch_size: 2,
            ..Default::default()
        };
        let opened = random_stream(&config, 2, 2, 4)
            .open(&config, &Device::Cpu)
            .unwrap();
        let batch = opened.validation_loader().unwrap().next().unwrap().unwrap();
        assert_eq!(batch.input_features.dims(), &[2, 4, 2]);
    }
}
