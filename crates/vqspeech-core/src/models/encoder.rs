//! Convolutional speech encoder: feature frames to a half-rate latent sequence.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::conv::{Conv1dBuilder, PaddedConv1d};
use super::residual::ResidualStack;
use crate::config::VqVaeConfig;
use crate::error::{Error, Result};

/// Encoder topology:
/// - two full-rate convolutions (k3) with a residual connection,
/// - one strided convolution (k4, stride 2) that halves the time axis,
/// - two more full-rate convolutions with residual connections,
/// - a residual stack added back onto its input.
#[derive(Debug, Clone)]
pub struct SpeechEncoder {
    conv_1: PaddedConv1d,
    conv_2: PaddedConv1d,
    conv_3: PaddedConv1d,
    conv_4: PaddedConv1d,
    conv_5: PaddedConv1d,
    residual_stack: ResidualStack,
    features_filters: usize,
}

impl SpeechEncoder {
    pub fn new(config: &VqVaeConfig, vb: VarBuilder) -> Result<Self> {
        let hiddens = config.num_hiddens;
        let kaiming = config.use_kaiming_normal;
        let full_rate = |in_channels: usize, name: &str| {
            Conv1dBuilder::new(in_channels, hiddens, 3)
                .padding(1)
                .kaiming_normal(kaiming)
                .build(vb.pp(name))
        };

        let conv_1 = full_rate(config.features_filters, "conv_1")?;
        let conv_2 = full_rate(hiddens, "conv_2")?;
        let conv_3 = Conv1dBuilder::new(hiddens, hiddens, 4)
            .stride(2)
            .padding(1)
            .kaiming_normal(kaiming)
            .build(vb.pp("conv_3"))?;
        let conv_4 = full_rate(hiddens, "conv_4")?;
        let conv_5 = full_rate(hiddens, "conv_5")?;
        let residual_stack = ResidualStack::new(
            hiddens,
            config.num_residual_layers,
            config.num_residual_hiddens,
            kaiming,
            vb.pp("residual_stack"),
        )?;

        Ok(Self {
            conv_1,
            conv_2,
            conv_3,
            conv_4,
            conv_5,
            residual_stack,
            features_filters: config.features_filters,
        })
    }

    /// `features`: `(batch, time, features_filters)`
    /// Returns: `(batch, num_hiddens, floor((time - 2) / 2) + 1)`
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let (_batch, time, filters) = features.dims3().map_err(|_| {
            Error::InvalidInput(format!(
                "Expected (batch, time, filters) features, got shape {:?}",
                features.dims()
            ))
        })?;
        if filters != self.features_filters {
            return Err(Error::InvalidInput(format!(
                "Feature frames have {filters} filters, encoder is configured for {}",
                self.features_filters
            )));
        }
        if time < 2 {
            return Err(Error::InvalidInput(format!(
                "Need at least 2 frames to downsample, got {time}"
            )));
        }

        // Channel-major for the convolutions: (batch, filters, time)
        let x = features.transpose(1, 2)?.contiguous()?;

        let x_conv_1 = self.conv_1.forward(&x)?.relu()?;
        let x = (self.conv_2.forward(&x_conv_1)?.relu()? + &x_conv_1)?;

        let x_conv_3 = self.conv_3.forward(&x)?.relu()?;
        let x_conv_4 = (self.conv_4.forward(&x_conv_3)?.relu()? + &x_conv_3)?;
        let x_conv_5 = (self.conv_5.forward(&x_conv_4)?.relu()? + &x_conv_4)?;

        Ok((self.residual_stack.forward(&x_conv_5)? + &x_conv_5)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> VqVaeConfig {
        VqVaeConfig {
            features_filters: 10,
            num_hiddens: 16,
            num_residual_hiddens: 8,
            num_residual_layers: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_encoder_halves_time_axis() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = SpeechEncoder::new(&small_config(), vb)?;

        let x = Tensor::randn(0f32, 1.0, (3, 20, 10), &Device::Cpu)?;
        assert_eq!(encoder.forward(&x)?.dims(), &[3, 16, 10]);

        let odd = Tensor::randn(0f32, 1.0, (3, 21, 10), &Device::Cpu)?;
        assert_eq!(encoder.forward(&odd)?.dims(), &[3, 16, 10]);
        Ok(())
    }

    #[test]
    fn test_encoder_rejects_wrong_filter_count() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = SpeechEncoder::new(&small_config(), vb)?;

        let x = Tensor::randn(0f32, 1.0, (3, 20, 12), &Device::Cpu)?;
        assert!(matches!(encoder.forward(&x), Err(Error::InvalidInput(_))));

        let flat = Tensor::randn(0f32, 1.0, (20, 10), &Device::Cpu)?;
        assert!(matches!(encoder.forward(&flat), Err(Error::InvalidInput(_))));
        Ok(())
    }
}
