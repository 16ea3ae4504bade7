//! VQ-VAE building blocks and the assembled model.

pub mod conv;
pub mod decoder;
pub mod encoder;
pub mod quantizer;
pub mod residual;
pub mod vq_vae;

pub use conv::{Conv1dBuilder, PaddedConv1d, Upsample1d, Upsample1dBuilder};
pub use decoder::SpeechDecoder;
pub use encoder::SpeechEncoder;
pub use quantizer::{Quantizer, VectorQuantizer, VectorQuantizerEma, VqOutput};
pub use residual::{Residual, ResidualStack};
pub use vq_vae::{ConvolutionalVqVae, ModelOutput};
