//! 1-D convolution builders with selectable weight initialisation.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{init::DEFAULT_KAIMING_NORMAL, Conv1d, Conv1dConfig, Init, VarBuilder};

/// Builder for [`PaddedConv1d`] layers.
///
/// Weights use Kaiming-normal (fan-in, ReLU gain) when `kaiming_normal` is set
/// and the fan-in uniform scheme `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`
/// otherwise. Biases always use the fan-in uniform scheme.
#[derive(Debug, Clone, Copy)]
pub struct Conv1dBuilder {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    bias: bool,
    kaiming_normal: bool,
}

impl Conv1dBuilder {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: 1,
            padding: 0,
            bias: true,
            kaiming_normal: false,
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn kaiming_normal(mut self, kaiming_normal: bool) -> Self {
        self.kaiming_normal = kaiming_normal;
        self
    }

    pub fn build(self, vb: VarBuilder) -> Result<PaddedConv1d> {
        let fan_in = self.in_channels * self.kernel_size;
        let weight = vb.get_with_hints(
            (self.out_channels, self.in_channels, self.kernel_size),
            "weight",
            weight_init(self.kaiming_normal, fan_in),
        )?;
        let bias = if self.bias {
            Some(vb.get_with_hints(self.out_channels, "bias", fan_in_uniform(fan_in))?)
        } else {
            None
        };

        let config = Conv1dConfig {
            padding: 0,
            stride: self.stride,
            dilation: 1,
            groups: 1,
            ..Default::default()
        };
        Ok(PaddedConv1d {
            conv: Conv1d::new(weight, bias, config),
            padding: self.padding,
        })
    }
}

/// [`Conv1d`] with zero padding applied to the input before the convolution.
///
/// candle's conv1d backward pass underflows when `(l_out - 1) * stride` is
/// smaller than `2 * padding`, so the kernel itself always runs unpadded.
#[derive(Debug, Clone)]
pub struct PaddedConv1d {
    conv: Conv1d,
    padding: usize,
}

impl PaddedConv1d {
    pub fn weight(&self) -> &Tensor {
        self.conv.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.conv.bias()
    }
}

impl Module for PaddedConv1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        if self.padding == 0 {
            return self.conv.forward(xs);
        }
        self.conv
            .forward(&xs.pad_with_zeros(2, self.padding, self.padding)?)
    }
}

/// Builder for [`Upsample1d`], a stride-`s` upsampling convolution with the
/// output length of a transposed convolution: `(t - 1) * s - 2 * p + k`.
///
/// Frames are interleaved with `s - 1` zeros and passed through a plain
/// [`PaddedConv1d`] padded by `k - 1 - p`, so every step stays differentiable.
/// Initialisation follows [`Conv1dBuilder`].
#[derive(Debug, Clone, Copy)]
pub struct Upsample1dBuilder {
    conv: Conv1dBuilder,
    kernel_size: usize,
    stride: usize,
    padding: usize,
}

impl Upsample1dBuilder {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            conv: Conv1dBuilder::new(in_channels, out_channels, kernel_size),
            kernel_size,
            stride: 1,
            padding: 0,
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn kaiming_normal(mut self, kaiming_normal: bool) -> Self {
        self.conv = self.conv.kaiming_normal(kaiming_normal);
        self
    }

    pub fn build(self, vb: VarBuilder) -> Result<Upsample1d> {
        if self.stride == 0 {
            bail!("upsampling stride must be positive");
        }
        if 2 * self.padding >= self.kernel_size {
            bail!(
                "upsampling padding {} too large for kernel {}",
                self.padding,
                self.kernel_size
            );
        }
        let conv = self
            .conv
            .padding(self.kernel_size - 1 - self.padding)
            .build(vb)?;
        Ok(Upsample1d {
            conv,
            kernel_size: self.kernel_size,
            stride: self.stride,
            padding: self.padding,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Upsample1d {
    conv: PaddedConv1d,
    kernel_size: usize,
    stride: usize,
    padding: usize,
}

impl Upsample1d {
    pub fn output_len(&self, len: usize) -> usize {
        // build() guarantees kernel_size > 2 * padding
        len.saturating_sub(1) * self.stride + self.kernel_size - 2 * self.padding
    }

    pub fn conv(&self) -> &PaddedConv1d {
        &self.conv
    }
}

impl Module for Upsample1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, channels, len) = xs.dims3()?;
        if len == 0 {
            bail!("cannot upsample an empty sequence");
        }
        let stuffed = if self.stride == 1 {
            xs.clone()
        } else {
            let mut frames = Vec::with_capacity(self.stride);
            frames.push(xs.clone());
            let zeros = xs.zeros_like()?;
            frames.extend(std::iter::repeat(zeros).take(self.stride - 1));
            // (b, c, t, s) -> (b, c, t * s): x0, 0, x1, 0, ...
            Tensor::stack(&frames, 3)?.reshape((batch, channels, len * self.stride))?
        };
        // The trailing zeros add s - 1 surplus frames at the end.
        self.conv
            .forward(&stuffed)?
            .narrow(2, 0, self.output_len(len))
    }
}

fn weight_init(kaiming_normal: bool, fan_in: usize) -> Init {
    if kaiming_normal {
        DEFAULT_KAIMING_NORMAL
    } else {
        fan_in_uniform(fan_in)
    }
}

fn fan_in_uniform(fan_in: usize) -> Init {
    let bound = 1.0 / (fan_in.max(1) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}
