//! Convolutional speech decoder: quantized codes back to feature frames.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::conv::{Conv1dBuilder, PaddedConv1d, Upsample1d, Upsample1dBuilder};
use super::residual::ResidualStack;
use crate::config::VqVaeConfig;
use crate::error::{Error, Result};

/// Mirror of [`super::SpeechEncoder`]: residual stack, a stride-2 upsampling
/// convolution that doubles the time axis, two residual convolutions and a
/// projection to the output filters.
#[derive(Debug, Clone)]
pub struct SpeechDecoder {
    conv_1: PaddedConv1d,
    residual_stack: ResidualStack,
    upsample: Upsample1d,
    conv_4: PaddedConv1d,
    conv_5: PaddedConv1d,
    projection: PaddedConv1d,
    embedding_dim: usize,
}

impl SpeechDecoder {
    pub fn new(config: &VqVaeConfig, vb: VarBuilder) -> Result<Self> {
        let hiddens = config.num_hiddens;
        let kaiming = config.use_kaiming_normal;
        let full_rate = |in_channels: usize, out_channels: usize, name: &str| {
            Conv1dBuilder::new(in_channels, out_channels, 3)
                .padding(1)
                .kaiming_normal(kaiming)
                .build(vb.pp(name))
        };

        let conv_1 = full_rate(config.embedding_dim, hiddens, "conv_1")?;
        let residual_stack = ResidualStack::new(
            hiddens,
            config.num_residual_layers,
            config.num_residual_hiddens,
            kaiming,
            vb.pp("residual_stack"),
        )?;
        // (t - 1) * 2 - 2 * 1 + 4 = 2t
        let upsample = Upsample1dBuilder::new(hiddens, hiddens, 4)
            .stride(2)
            .padding(1)
            .kaiming_normal(kaiming)
            .build(vb.pp("upsample"))?;
        let conv_4 = full_rate(hiddens, hiddens, "conv_4")?;
        let conv_5 = full_rate(hiddens, hiddens, "conv_5")?;
        let projection = full_rate(hiddens, config.output_filters(), "projection")?;

        Ok(Self {
            conv_1,
            residual_stack,
            upsample,
            conv_4,
            conv_5,
            projection,
            embedding_dim: config.embedding_dim,
        })
    }

    /// `quantized`: `(batch, embedding_dim, time)`
    /// Returns: `(batch, 2 * time, output_filters)`
    pub fn forward(&self, quantized: &Tensor) -> Result<Tensor> {
        let (_batch, channels, _time) = quantized.dims3().map_err(|_| {
            Error::ShapeMismatch(format!(
                "Decoder expects (batch, {}, time) codes, got {:?}",
                self.embedding_dim,
                quantized.dims()
            ))
        })?;
        if channels != self.embedding_dim {
            return Err(Error::ShapeMismatch(format!(
                "Decoder input has {channels} channels, expected {}",
                self.embedding_dim
            )));
        }

        let x = self.conv_1.forward(quantized)?;
        let x = (self.residual_stack.forward(&x)? + &x)?;

        let x = self.upsample.forward(&x)?.relu()?;
        let x = (self.conv_4.forward(&x)?.relu()? + &x)?;
        let x = (self.conv_5.forward(&x)?.relu()? + &x)?;

        let x = self.projection.forward(&x)?;
        // Back to frame-major: (batch, time, filters)
        Ok(x.transpose(1, 2)?.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_decoder_doubles_time_and_projects_filters() -> Result<()> {
        let config = VqVaeConfig {
            features_filters: 10,
            augment_output_features: true,
            num_hiddens: 16,
            num_residual_hiddens: 8,
            embedding_dim: 4,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let decoder = SpeechDecoder::new(&config, vb)?;

        let codes = Tensor::randn(0f32, 1.0, (2, 4, 7), &Device::Cpu)?;
        assert_eq!(decoder.forward(&codes)?.dims(), &[2, 14, 30]);

        let single = Tensor::randn(0f32, 1.0, (2, 4, 1), &Device::Cpu)?;
        assert_eq!(decoder.forward(&single)?.dims(), &[2, 2, 30]);
        Ok(())
    }

    #[test]
    fn test_decoder_rejects_wrong_code_dimension() -> Result<()> {
        let config = VqVaeConfig {
            features_filters: 10,
            num_hiddens: 16,
            num_residual_hiddens: 8,
            embedding_dim: 4,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let decoder = SpeechDecoder::new(&config, vb)?;

        let codes = Tensor::randn(0f32, 1.0, (2, 5, 7), &Device::Cpu)?;
        assert!(matches!(decoder.forward(&codes), Err(Error::ShapeMismatch(_))));
        Ok(())
    }
}
