//! The full VQ-VAE: encoder, pre-quantization projection, quantizer, decoder.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::debug;

use super::conv::{Conv1dBuilder, PaddedConv1d};
use super::decoder::SpeechDecoder;
use super::encoder::SpeechEncoder;
use super::quantizer::{Quantizer, VectorQuantizer, VectorQuantizerEma, VqOutput};
use crate::config::VqVaeConfig;
use crate::error::{Error, Result};

/// Output of one pass through the model.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `(batch, 2 * reduced_time, output_filters)`
    pub reconstruction: Tensor,
    /// Projected encoder output fed to the quantizer, `(batch, D, reduced_time)`
    pub latent: Tensor,
    pub vq: VqOutput,
}

/// VQ-VAE over speech feature frames. Owns every parameter in one [`VarMap`].
pub struct ConvolutionalVqVae {
    encoder: SpeechEncoder,
    pre_vq_conv: PaddedConv1d,
    quantizer: Quantizer,
    decoder: SpeechDecoder,
    varmap: VarMap,
    config: VqVaeConfig,
    device: Device,
}

impl ConvolutionalVqVae {
    /// Freshly initialised model on `device`.
    pub fn new(config: &VqVaeConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let encoder = SpeechEncoder::new(config, vb.pp("encoder"))?;
        let pre_vq_conv = Conv1dBuilder::new(config.num_hiddens, config.embedding_dim, 1)
            .kaiming_normal(config.use_kaiming_normal)
            .build(vb.pp("pre_vq_conv"))?;
        let quantizer = if config.uses_ema() {
            Quantizer::Ema(VectorQuantizerEma::new(
                config.num_embeddings,
                config.embedding_dim,
                config.commitment_cost,
                config.decay,
                vb.pp("vq"),
            )?)
        } else {
            Quantizer::Gradient(VectorQuantizer::new(
                config.num_embeddings,
                config.embedding_dim,
                config.commitment_cost,
                vb.pp("vq"),
            )?)
        };
        let decoder = SpeechDecoder::new(config, vb.pp("decoder"))?;

        debug!(
            "Built VQ-VAE: {} hiddens, K={} D={}, {} quantizer",
            config.num_hiddens,
            config.num_embeddings,
            config.embedding_dim,
            if config.uses_ema() { "EMA" } else { "gradient" }
        );

        Ok(Self {
            encoder,
            pre_vq_conv,
            quantizer,
            decoder,
            varmap,
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Build the topology for `config` and overwrite its parameters from a safetensors file.
    pub fn load(config: &VqVaeConfig, device: &Device, weights: &Path) -> Result<Self> {
        let mut model = Self::new(config, device)?;
        model.load_weights(weights)?;
        Ok(model)
    }

    pub fn config(&self) -> &VqVaeConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn quantizer(&self) -> &Quantizer {
        &self.quantizer
    }

    /// `(batch, time, filters)` to the projected latent `(batch, D, reduced_time)`
    pub fn encode(&self, features: &Tensor) -> Result<Tensor> {
        let hidden = self.encoder.forward(features)?;
        Ok(self.pre_vq_conv.forward(&hidden)?)
    }

    pub fn quantize(&self, latent: &Tensor, train: bool) -> Result<VqOutput> {
        self.quantizer.forward_t(latent, train)
    }

    pub fn decode(&self, quantized: &Tensor) -> Result<Tensor> {
        self.decoder.forward(quantized)
    }

    /// `train` enables codebook EMA updates; the gradient codebook ignores it.
    pub fn forward_t(&self, features: &Tensor, train: bool) -> Result<ModelOutput> {
        let latent = self.encode(features)?;
        let vq = self.quantize(&latent, train)?;
        let reconstruction = self.decode(&vq.quantized)?;
        Ok(ModelOutput {
            reconstruction,
            latent,
            vq,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Every parameter with its path, sorted by name.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::ModelLoadError("Parameter map mutex poisoned".to_string()))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.elem_count())
            .sum()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(Error::ModelLoadError(format!(
                "Missing model weights: {}",
                path.display()
            )));
        }
        self.varmap.load(path).map_err(|e| {
            Error::ModelLoadError(format!("Failed to load weights {}: {e}", path.display()))
        })
    }
}
