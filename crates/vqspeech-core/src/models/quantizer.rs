//! Vector quantization bottleneck.
//!
//! Two codebook flavours share one assignment path:
//! - [`VectorQuantizer`]: the codebook is a trainable parameter pulled towards
//!   the encoder outputs by the codebook loss.
//! - [`VectorQuantizerEma`]: the codebook follows exponential moving averages
//!   of the vectors assigned to each code and receives no gradient.
//!
//! Latents are channel-major `(batch, D, time)` throughout.

use candle_core::{DType, Tensor, Var, D};
use candle_nn::{Init, VarBuilder};

use crate::error::{Error, Result};

const PERPLEXITY_EPSILON: f64 = 1e-10;
const EMA_EPSILON: f64 = 1e-5;

/// Everything the quantizer produces for one batch.
#[derive(Debug, Clone)]
pub struct VqOutput {
    /// Codebook + commitment loss (scalar)
    pub loss: Tensor,
    /// `(batch, D, time)`: codebook vectors in the forward pass, identity gradient to the latent
    pub quantized: Tensor,
    /// Effective number of codes used by the batch (scalar)
    pub perplexity: Tensor,
    /// `(batch * time, K)` one-hot assignments
    pub encodings: Tensor,
    /// `(batch * time, K)` squared Euclidean distances
    pub distances: Tensor,
    /// `(batch * time,)` chosen code per latent vector
    pub encoding_indices: Tensor,
}

/// Forward value of `quantized`, gradient of `latent`.
///
/// Assignment is an argmin and has no gradient; the decoder's gradient is
/// routed unchanged to the encoder output instead. Computed as
/// `latent + detach(quantized - latent)`, so only the `latent` term is on the
/// backward path.
pub fn straight_through(latent: &Tensor, quantized: &Tensor) -> Result<Tensor> {
    let residual = (quantized - latent)?.detach();
    Ok((latent + residual)?)
}

/// Squared Euclidean distances `||z||² + ||e||² - 2 z·e`.
///
/// `flat`: `(N, D)`, `codebook`: `(K, D)`. Returns `(N, K)`.
pub fn squared_distances(flat: &Tensor, codebook: &Tensor) -> Result<Tensor> {
    let z2 = flat.sqr()?.sum_keepdim(1)?; // (N, 1)
    let e2 = codebook.sqr()?.sum_keepdim(1)?.t()?; // (1, K)
    let dot = flat.matmul(&codebook.t()?)?; // (N, K)
    Ok(z2.broadcast_add(&e2)?.broadcast_sub(&dot.affine(2.0, 0.0)?)?)
}

/// `exp(-Σ p log(p + ε))` over the mean one-hot usage of the batch.
pub fn perplexity(encodings: &Tensor) -> Result<Tensor> {
    let avg_probs = encodings.mean(0)?;
    let entropy = (&avg_probs * avg_probs.affine(1.0, PERPLEXITY_EPSILON)?.log()?)?
        .sum_all()?
        .neg()?;
    Ok(entropy.exp()?)
}

/// Nearest-code assignment shared by both quantizer flavours.
struct Assignment {
    flat_input: Tensor,
    distances: Tensor,
    indices: Tensor,
    encodings: Tensor,
    /// `(batch, time, D)` layout of the latent
    nested_shape: (usize, usize, usize),
}

fn assign(latent: &Tensor, codebook: &Tensor) -> Result<Assignment> {
    let (num_embeddings, embedding_dim) = codebook.dims2()?;
    let (batch, channels, time) = latent.dims3().map_err(|_| {
        Error::ShapeMismatch(format!(
            "Quantizer expects (batch, {embedding_dim}, time) latents, got {:?}",
            latent.dims()
        ))
    })?;
    if channels != embedding_dim {
        return Err(Error::ShapeMismatch(format!(
            "Latent has {channels} channels but codebook vectors have dimension {embedding_dim}"
        )));
    }

    // (batch, D, time) -> (batch * time, D)
    let flat_input = latent
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch * time, embedding_dim))?;

    let distances = squared_distances(&flat_input, codebook)?;
    // argmin keeps the first minimum on ties
    let indices = distances.argmin(D::Minus1)?;

    let codes = Tensor::arange(0u32, num_embeddings as u32, latent.device())?.unsqueeze(0)?;
    let encodings = indices
        .unsqueeze(1)?
        .broadcast_eq(&codes)?
        .to_dtype(latent.dtype())?;

    Ok(Assignment {
        flat_input,
        distances,
        indices,
        encodings,
        nested_shape: (batch, time, embedding_dim),
    })
}

/// `(batch * time, D)` quantized rows back to `(batch, D, time)` with the straight-through wiring.
fn restore_layout(assignment: &Assignment, quantized_rows: &Tensor, latent: &Tensor) -> Result<Tensor> {
    let quantized = quantized_rows
        .reshape(assignment.nested_shape)?
        .transpose(1, 2)?
        .contiguous()?;
    straight_through(latent, &quantized)
}

/// Vector quantizer whose codebook is trained by gradient descent.
#[derive(Debug, Clone)]
pub struct VectorQuantizer {
    embedding: Tensor,
    commitment_cost: f64,
}

impl VectorQuantizer {
    /// Codebook initialised uniformly in `[-1/K, 1/K]`.
    pub fn new(
        num_embeddings: usize,
        embedding_dim: usize,
        commitment_cost: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bound = 1.0 / num_embeddings as f64;
        let embedding = vb.get_with_hints(
            (num_embeddings, embedding_dim),
            "embedding",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Self::from_codebook(embedding, commitment_cost)
    }

    /// Wrap an existing `(K, D)` codebook.
    pub fn from_codebook(embedding: Tensor, commitment_cost: f64) -> Result<Self> {
        if embedding.rank() != 2 {
            return Err(Error::ShapeMismatch(format!(
                "Codebook must be (num_embeddings, embedding_dim), got {:?}",
                embedding.dims()
            )));
        }
        Ok(Self {
            embedding,
            commitment_cost,
        })
    }

    pub fn codebook(&self) -> &Tensor {
        &self.embedding
    }

    pub fn num_embeddings(&self) -> usize {
        self.embedding.dims()[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding.dims()[1]
    }

    pub fn forward(&self, latent: &Tensor) -> Result<VqOutput> {
        let assignment = assign(latent, &self.embedding)?;
        let quantized_rows = assignment.encodings.matmul(&self.embedding)?;

        let flat_input = &assignment.flat_input;
        let codebook_loss = candle_nn::loss::mse(&quantized_rows, &flat_input.detach())?;
        let commitment_loss = candle_nn::loss::mse(&quantized_rows.detach(), flat_input)?;
        let loss = (codebook_loss + commitment_loss.affine(self.commitment_cost, 0.0)?)?;

        let quantized = restore_layout(&assignment, &quantized_rows, latent)?;
        let perplexity = perplexity(&assignment.encodings)?;

        Ok(VqOutput {
            loss,
            quantized,
            perplexity,
            encodings: assignment.encodings,
            distances: assignment.distances,
            encoding_indices: assignment.indices,
        })
    }
}

/// Vector quantizer with an exponential-moving-average codebook.
#[derive(Debug, Clone)]
pub struct VectorQuantizerEma {
    embedding: Var,
    ema_cluster_size: Var,
    ema_w: Var,
    commitment_cost: f64,
    decay: f64,
}

impl VectorQuantizerEma {
    /// Codebook initialised from a standard normal; EMA sums start at the codebook.
    pub fn new(
        num_embeddings: usize,
        embedding_dim: usize,
        commitment_cost: f64,
        decay: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let shape = (num_embeddings, embedding_dim);
        let normal = Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };
        // Variables created through a VarMap come back as variables, so the
        // Var handles below share storage with the map and follow VarMap::load.
        let embedding = Var::from_tensor(&vb.get_with_hints(shape, "embedding", normal)?)?;
        let ema_cluster_size = Var::from_tensor(&vb.get_with_hints(
            num_embeddings,
            "ema_cluster_size",
            Init::Const(0.0),
        )?)?;
        let ema_w = Var::from_tensor(&vb.get_with_hints(shape, "ema_w", Init::Const(0.0))?)?;
        ema_w.set(embedding.as_tensor())?;

        Ok(Self {
            embedding,
            ema_cluster_size,
            ema_w,
            commitment_cost,
            decay,
        })
    }

    pub fn codebook(&self) -> &Tensor {
        self.embedding.as_tensor()
    }

    pub fn num_embeddings(&self) -> usize {
        self.embedding.dims()[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding.dims()[1]
    }

    /// In training mode the codebook is moved towards the mean of its assigned vectors.
    pub fn forward_t(&self, latent: &Tensor, train: bool) -> Result<VqOutput> {
        let codebook = self.embedding.as_tensor().detach();
        let assignment = assign(latent, &codebook)?;

        if train {
            self.update_codebook(&assignment)?;
        }

        let quantized_rows = assignment
            .encodings
            .matmul(&self.embedding.as_tensor().detach())?;
        let commitment_loss =
            candle_nn::loss::mse(&quantized_rows.detach(), &assignment.flat_input)?;
        let loss = commitment_loss.affine(self.commitment_cost, 0.0)?;

        let quantized = restore_layout(&assignment, &quantized_rows, latent)?;
        let perplexity = perplexity(&assignment.encodings)?;

        Ok(VqOutput {
            loss,
            quantized,
            perplexity,
            encodings: assignment.encodings,
            distances: assignment.distances,
            encoding_indices: assignment.indices,
        })
    }

    fn update_codebook(&self, assignment: &Assignment) -> Result<()> {
        let decay = self.decay;
        let encodings = &assignment.encodings;
        let num_embeddings = self.num_embeddings() as f64;

        let counts = encodings.sum(0)?;
        let cluster_size = (self.ema_cluster_size.as_tensor().affine(decay, 0.0)?
            + counts.affine(1.0 - decay, 0.0)?)?;

        // Laplace smoothing keeps empty clusters from dividing by zero.
        let n = cluster_size.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        let scale = n / (n + num_embeddings * EMA_EPSILON);
        let cluster_size = cluster_size.affine(scale, EMA_EPSILON * scale)?;

        let dw = encodings.t()?.matmul(&assignment.flat_input.detach())?;
        let ema_w =
            (self.ema_w.as_tensor().affine(decay, 0.0)? + dw.affine(1.0 - decay, 0.0)?)?;

        let embedding = ema_w.broadcast_div(&cluster_size.unsqueeze(1)?)?;

        self.ema_cluster_size.set(&cluster_size.detach())?;
        self.ema_w.set(&ema_w.detach())?;
        self.embedding.set(&embedding.detach())?;
        Ok(())
    }
}

/// The configured quantizer flavour.
#[derive(Debug, Clone)]
pub enum Quantizer {
    Gradient(VectorQuantizer),
    Ema(VectorQuantizerEma),
}

impl Quantizer {
    pub fn forward_t(&self, latent: &Tensor, train: bool) -> Result<VqOutput> {
        match self {
            Quantizer::Gradient(vq) => vq.forward(latent),
            Quantizer::Ema(vq) => vq.forward_t(latent, train),
        }
    }

    pub fn codebook(&self) -> &Tensor {
        match self {
            Quantizer::Gradient(vq) => vq.codebook(),
            Quantizer::Ema(vq) => vq.codebook(),
        }
    }

    pub fn num_embeddings(&self) -> usize {
        match self {
            Quantizer::Gradient(vq) => vq.num_embeddings(),
            Quantizer::Ema(vq) => vq.num_embeddings(),
        }
    }

    pub fn embedding_dim(&self) -> usize {
        match self {
            Quantizer::Gradient(vq) => vq.embedding_dim(),
            Quantizer::Ema(vq) => vq.embedding_dim(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn dev() -> Device {
        Device::Cpu
    }

    /// `(1, D, rows)` latent whose time steps are the given vectors.
    fn latent_from_rows(rows: &[[f32; 2]]) -> Result<Tensor> {
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Ok(Tensor::from_vec(flat, (1, rows.len(), 2), &dev())?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn scalar(t: &Tensor) -> Result<f32> {
        Ok(t.to_scalar::<f32>()?)
    }

    #[test]
    fn test_two_entry_codebook_assigns_each_vector_to_itself() -> Result<()> {
        let codebook = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &dev())?;
        let vq = VectorQuantizer::from_codebook(codebook, 0.25)?;

        let latent = latent_from_rows(&[[1.0, 0.0], [0.0, 1.0]])?;
        let out = vq.forward(&latent)?;

        assert_eq!(out.encoding_indices.to_vec1::<u32>()?, vec![0, 1]);
        let distances = out.distances.to_vec2::<f32>()?;
        assert_eq!(distances[0][0], 0.0);
        assert!(distances[0][1] > 0.0);
        assert_eq!(distances[1][1], 0.0);
        assert!(distances[1][0] > 0.0);
        Ok(())
    }

    #[test]
    fn test_quantizing_codebook_rows_is_idempotent() -> Result<()> {
        let codebook = Tensor::new(&[[1f32, 2.0], [-3.0, 0.5], [0.0, 4.0]], &dev())?;
        let vq = VectorQuantizer::from_codebook(codebook, 0.25)?;

        let latent = latent_from_rows(&[[-3.0, 0.5], [-3.0, 0.5], [-3.0, 0.5], [1.0, 2.0]])?;
        let out = vq.forward(&latent)?;

        let diff = (&out.quantized - &latent)?.abs()?.sum_all()?;
        assert_eq!(scalar(&diff)?, 0.0);
        assert_eq!(scalar(&out.loss)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_ties_pick_first_code() -> Result<()> {
        let codebook = Tensor::new(&[[1f32, 0.0], [-1.0, 0.0]], &dev())?;
        let vq = VectorQuantizer::from_codebook(codebook, 0.25)?;

        let latent = latent_from_rows(&[[0.0, 1.0]])?;
        let out = vq.forward(&latent)?;
        assert_eq!(out.encoding_indices.to_vec1::<u32>()?, vec![0]);
        Ok(())
    }

    #[test]
    fn test_nearest_code_and_loss_value() -> Result<()> {
        let codebook = Tensor::new(&[[0f32, 0.0], [2.0, 2.0]], &dev())?;
        let vq = VectorQuantizer::from_codebook(codebook, 0.25)?;

        let latent = latent_from_rows(&[[1.5, 1.5], [0.5, 0.0]])?;
        let out = vq.forward(&latent)?;

        assert_eq!(out.encoding_indices.to_vec1::<u32>()?, vec![1, 0]);
        // squared errors: (0.25 + 0.25) + 0.25 over 4 elements
        let mse = 0.75 / 4.0;
        assert_abs_diff_eq!(scalar(&out.loss)?, mse * 1.25, epsilon = 1e-6);
        let quantized = out.quantized.transpose(1, 2)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(quantized, vec![vec![2.0, 2.0], vec![0.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn test_perplexity_counts_uniformly_used_codes() -> Result<()> {
        let codebook = Tensor::new(
            &[[0f32, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0], [5.0, 5.0]],
            &dev(),
        )?;
        let vq = VectorQuantizer::from_codebook(codebook, 0.25)?;

        // three codes, twice each
        let latent = latent_from_rows(&[
            [0.0, 0.0],
            [1.0, 0.0],
            [0.0, 1.0],
            [0.0, 0.0],
            [1.0, 0.0],
            [0.0, 1.0],
        ])?;
        let out = vq.forward(&latent)?;
        assert_abs_diff_eq!(scalar(&out.perplexity)?, 3.0, epsilon = 1e-3);

        // a single code everywhere
        let latent = latent_from_rows(&[[5.0, 5.0], [5.0, 5.0]])?;
        let out = vq.forward(&latent)?;
        assert_abs_diff_eq!(scalar(&out.perplexity)?, 1.0, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn test_perplexity_stays_within_codebook_bounds() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev());
        let vq = VectorQuantizer::new(32, 4, 0.25, vb)?;

        let latent = Tensor::randn(0f32, 0.05, (4, 4, 16), &dev())?;
        let out = vq.forward(&latent)?;
        let p = scalar(&out.perplexity)?;
        assert!((1.0 - 1e-4..=32.0 + 1e-4).contains(&p));
        Ok(())
    }

    #[test]
    fn test_straight_through_gradient_is_identity() -> Result<()> {
        let codebook = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &dev())?;
        let vq = VectorQuantizer::from_codebook(codebook, 0.25)?;

        let latent = Var::from_tensor(&latent_from_rows(&[[0.9, 0.2], [0.1, 0.7], [0.4, 0.3]])?)?;
        let out = vq.forward(latent.as_tensor())?;

        let weights = Tensor::new(&[[[1f32, 2.0, 3.0], [4.0, 5.0, 6.0]]], &dev())?;
        let grads = (&out.quantized * &weights)?.sum_all()?.backward()?;
        let grad = grads
            .get(latent.as_tensor())
            .expect("latent receives a gradient");

        let diff = (grad - &weights)?.abs()?.sum_all()?;
        assert_abs_diff_eq!(scalar(&diff)?, 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_codebook_receives_gradient_from_loss() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev());
        let vq = VectorQuantizer::new(8, 2, 0.25, vb)?;

        let latent = Tensor::randn(0f32, 1.0, (2, 2, 5), &dev())?;
        let out = vq.forward(&latent)?;
        let grads = out.loss.backward()?;
        assert!(grads.get(vq.codebook()).is_some());
        Ok(())
    }

    #[test]
    fn test_dimension_mismatch_fails_loudly() -> Result<()> {
        let codebook = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &dev())?;
        let vq = VectorQuantizer::from_codebook(codebook, 0.25)?;

        let latent = Tensor::zeros((1, 3, 4), DType::F32, &dev())?;
        assert!(matches!(vq.forward(&latent), Err(Error::ShapeMismatch(_))));

        let bad_codebook = Tensor::zeros(4, DType::F32, &dev())?;
        assert!(matches!(
            VectorQuantizer::from_codebook(bad_codebook, 0.25),
            Err(Error::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_ema_moves_codebook_towards_assignments_in_training_only() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev());
        let vq = VectorQuantizerEma::new(4, 2, 0.25, 0.9, vb)?;
        let before = vq.codebook().to_vec2::<f32>()?;

        let latent = Tensor::randn(0f32, 1.0, (2, 2, 8), &dev())?;
        vq.forward_t(&latent, false)?;
        assert_eq!(vq.codebook().to_vec2::<f32>()?, before);

        let out = vq.forward_t(&latent, true)?;
        assert_ne!(vq.codebook().to_vec2::<f32>()?, before);
        assert_eq!(out.quantized.dims(), &[2, 2, 8]);
        assert!(scalar(&out.loss)? >= 0.0);
        Ok(())
    }

    #[test]
    fn test_ema_codebook_converges_to_cluster_mean() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev());
        let vq = VectorQuantizerEma::new(1, 2, 0.25, 0.5, vb)?;

        let latent = latent_from_rows(&[[2.0, -2.0], [2.0, -2.0]])?;
        for _ in 0..60 {
            vq.forward_t(&latent, true)?;
        }
        let codebook = vq.codebook().to_vec2::<f32>()?;
        assert_abs_diff_eq!(codebook[0][0], 2.0, epsilon = 1e-3);
        assert_abs_diff_eq!(codebook[0][1], -2.0, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn test_ema_loss_has_no_codebook_gradient() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev());
        let vq = VectorQuantizerEma::new(4, 2, 0.25, 0.99, vb)?;

        let latent = Var::from_tensor(&Tensor::randn(0f32, 1.0, (1, 2, 6), &dev())?)?;
        let out = vq.forward_t(latent.as_tensor(), true)?;
        let total = (out.loss + out.quantized.sum_all()?)?;
        let grads = total.backward()?;
        assert!(grads.get(vq.codebook()).is_none());
        assert!(grads.get(latent.as_tensor()).is_some());
        Ok(())
    }
}
