//! Residual units and stacks shared by the encoder and decoder.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::conv::{Conv1dBuilder, PaddedConv1d};

/// `y = x + conv1x1(relu(conv3(relu(x))))`
#[derive(Debug, Clone)]
pub struct Residual {
    conv_3: PaddedConv1d,
    conv_1: PaddedConv1d,
}

impl Residual {
    pub fn new(
        num_hiddens: usize,
        num_residual_hiddens: usize,
        use_kaiming_normal: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv_3 = Conv1dBuilder::new(num_hiddens, num_residual_hiddens, 3)
            .padding(1)
            .bias(false)
            .kaiming_normal(use_kaiming_normal)
            .build(vb.pp("conv_3"))?;
        let conv_1 = Conv1dBuilder::new(num_residual_hiddens, num_hiddens, 1)
            .bias(false)
            .kaiming_normal(use_kaiming_normal)
            .build(vb.pp("conv_1"))?;
        Ok(Self { conv_3, conv_1 })
    }
}

impl Module for Residual {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.conv_3.forward(&xs.relu()?)?;
        let h = self.conv_1.forward(&h.relu()?)?;
        // Plain add: a channel or length mismatch must error, never broadcast.
        xs + h
    }
}

/// `num_residual_layers` residual units followed by a ReLU. Shape preserving.
#[derive(Debug, Clone)]
pub struct ResidualStack {
    layers: Vec<Residual>,
}

impl ResidualStack {
    pub fn new(
        num_hiddens: usize,
        num_residual_layers: usize,
        num_residual_hiddens: usize,
        use_kaiming_normal: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layers = (0..num_residual_layers)
            .map(|i| {
                Residual::new(
                    num_hiddens,
                    num_residual_hiddens,
                    use_kaiming_normal,
                    vb.pp(format!("layers.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl Module for ResidualStack {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut x = xs.clone();
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        x.relu()
    }
}
