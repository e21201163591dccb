// Building blocks shared by the generator, discriminator and encoders:
// parameter-free norms, spectrally normalized convolutions and conv+norm pairs

use crate::config::{LayerNormConfig, ParamFreeNormKind, PlainNormKind};
use crate::error::Result;
use candle_core::{Module, Tensor, Var};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Init,
    ModuleT, VarBuilder,
};

const NORM_EPS: f64 = 1e-5;

/// Per-sample, per-channel normalization over the spatial axes (no affine)
pub fn instance_norm(x: &Tensor, eps: f64) -> candle_core::Result<Tensor> {
    let mean = x.mean_keepdim((2, 3))?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim((2, 3))?;
    centered.broadcast_div(&(var + eps)?.sqrt()?)
}

/// Nearest-neighbor resize of a `(B, C, H, W)` tensor, skipped when already at size
pub fn resize_nearest(x: &Tensor, height: usize, width: usize) -> candle_core::Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if h == height && w == width {
        Ok(x.clone())
    } else {
        x.upsample_nearest2d(height, width)
    }
}

/// `(dst, src)` linear interpolation weights with half-pixel centers
fn bilinear_weights(src: usize, dst: usize) -> Vec<f32> {
    let scale = src as f64 / dst as f64;
    let mut weights = vec![0f32; dst * src];
    for d in 0..dst {
        let pos = ((d as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (pos.floor() as usize).min(src - 1);
        let i1 = (i0 + 1).min(src - 1);
        let frac = (pos - i0 as f64) as f32;
        weights[d * src + i0] += 1.0 - frac;
        weights[d * src + i1] += frac;
    }
    weights
}

/// Bilinear resize of a `(B, C, H, W)` tensor (half-pixel centers, no antialiasing)
pub fn resize_bilinear(x: &Tensor, height: usize, width: usize) -> candle_core::Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if h == height && w == width {
        return Ok(x.clone());
    }
    let rows = Tensor::from_vec(bilinear_weights(h, height), (height, h), x.device())?
        .to_dtype(x.dtype())?;
    let cols = Tensor::from_vec(bilinear_weights(w, width), (width, w), x.device())?
        .to_dtype(x.dtype())?
        .t()?
        .contiguous()?;
    rows.broadcast_matmul(&x.contiguous()?.broadcast_matmul(&cols)?)
}

/// Leaky rectifier used between normalization and convolution
pub fn leaky_relu(x: &Tensor, negative_slope: f64) -> candle_core::Result<Tensor> {
    candle_nn::ops::leaky_relu(x, negative_slope)
}

fn l2_normalize(x: &Tensor) -> candle_core::Result<Tensor> {
    let norm = (x.sqr()?.sum_all()?.sqrt()? + 1e-12)?;
    x.broadcast_div(&norm)
}

/// Normalization without learned scale/bias, applied before conditional modulation
pub enum ParamFreeNorm {
    Instance,
    /// Batch statistics in training, running statistics otherwise
    Batch(BatchNorm),
}

impl ParamFreeNorm {
    pub fn new(kind: ParamFreeNormKind, channels: usize, vb: VarBuilder) -> Result<Self> {
        match kind {
            ParamFreeNormKind::Instance => Ok(ParamFreeNorm::Instance),
            ParamFreeNormKind::Batch | ParamFreeNormKind::SyncBatch => {
                let config = BatchNormConfig {
                    eps: NORM_EPS,
                    remove_mean: true,
                    affine: false,
                    momentum: 0.1,
                };
                Ok(ParamFreeNorm::Batch(batch_norm(channels, config, vb)?))
            }
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        match self {
            ParamFreeNorm::Instance => instance_norm(x, NORM_EPS),
            ParamFreeNorm::Batch(bn) => bn.forward_t(x, train),
        }
    }
}

/// Convolution whose weight is divided by its largest singular value
///
/// The singular value is estimated by power iteration starting from the
/// persisted `weight_u` buffer. Training forwards write the refined `u` back,
/// so even a single iteration per call converges over successive steps.
/// Evaluation forwards leave the buffer untouched.
pub struct SpectralConv2d {
    weight: Tensor,
    bias: Option<Tensor>,
    u: Var,
    config: Conv2dConfig,
    out_channels: usize,
    power_iterations: usize,
}

impl SpectralConv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv2dConfig,
        with_bias: bool,
        power_iterations: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels / config.groups, kernel_size, kernel_size),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if with_bias {
            let bound = 1.0 / ((in_channels * kernel_size * kernel_size) as f64).sqrt();
            Some(vb.get_with_hints(
                out_channels,
                "bias",
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                },
            )?)
        } else {
            None
        };
        // Shares storage with the var map entry, so updates are saved with checkpoints
        let u = Var::from_tensor(&vb.get_with_hints(
            out_channels,
            "weight_u",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?)?;

        Ok(Self {
            weight,
            bias,
            u,
            config,
            out_channels,
            power_iterations: power_iterations.max(1),
        })
    }

    /// Refined `(u, v)` singular vector estimates, both detached
    fn power_iteration(&self) -> candle_core::Result<(Tensor, Tensor)> {
        let w = self.weight.flatten_from(1)?.detach();
        let w_t = w.t()?.contiguous()?;

        let mut u = l2_normalize(&self.u.as_tensor().detach())?;
        let mut v = Tensor::zeros(w.dim(1)?, w.dtype(), w.device())?;
        for _ in 0..self.power_iterations {
            v = l2_normalize(&w_t.matmul(&u.unsqueeze(1)?)?.squeeze(1)?)?;
            u = l2_normalize(&w.matmul(&v.unsqueeze(1)?)?.squeeze(1)?)?;
        }
        Ok((u, v))
    }

    fn sigma_with(&self, u: &Tensor, v: &Tensor) -> candle_core::Result<Tensor> {
        // Gradient flows through W only
        let w = self.weight.flatten_from(1)?;
        u.unsqueeze(0)?
            .matmul(&w.matmul(&v.unsqueeze(1)?)?)?
            .reshape(())
    }

    /// Largest-singular-value estimate from the stored `u`, without updating it
    pub fn sigma(&self) -> candle_core::Result<Tensor> {
        let (u, v) = self.power_iteration()?;
        self.sigma_with(&u, &v)
    }

    /// Normalized weight as used by the convolution
    pub fn normalized_weight(&self) -> candle_core::Result<Tensor> {
        self.weight.broadcast_div(&self.sigma()?)
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let (u, v) = self.power_iteration()?;
        if train {
            self.u.set(&u)?;
        }
        let weight = self.weight.broadcast_div(&self.sigma_with(&u, &v)?)?;
        let out = x.conv2d(
            &weight,
            self.config.padding,
            self.config.stride,
            self.config.dilation,
            self.config.groups,
        )?;
        match &self.bias {
            Some(bias) => out.broadcast_add(&bias.reshape((1, self.out_channels, 1, 1))?),
            None => Ok(out),
        }
    }
}

/// A convolution that may or may not be spectrally normalized
pub enum Conv2dLayer {
    Plain(Conv2d),
    Spectral(SpectralConv2d),
}

impl Conv2dLayer {
    /// `spectral` carries the power-iteration count when spectral norm is enabled
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv2dConfig,
        with_bias: bool,
        spectral: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(match spectral {
            Some(iterations) => Conv2dLayer::Spectral(SpectralConv2d::new(
                in_channels,
                out_channels,
                kernel_size,
                config,
                with_bias,
                iterations,
                vb,
            )?),
            None if with_bias => {
                Conv2dLayer::Plain(conv2d(in_channels, out_channels, kernel_size, config, vb)?)
            }
            None => Conv2dLayer::Plain(conv2d_no_bias(
                in_channels,
                out_channels,
                kernel_size,
                config,
                vb,
            )?),
        })
    }

    /// `train` lets spectral layers refresh their power-iteration state
    pub fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        match self {
            Conv2dLayer::Plain(conv) => conv.forward(x),
            Conv2dLayer::Spectral(conv) => conv.forward_t(x, train),
        }
    }
}

enum PlainNorm {
    Instance,
    Batch(BatchNorm),
}

/// Convolution followed by an optional unconditioned norm
///
/// Used by the discriminator and the encoders. When a norm follows, the
/// convolution has no bias since the norm would cancel it.
pub struct NormedConv2d {
    conv: Conv2dLayer,
    norm: Option<PlainNorm>,
}

impl NormedConv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: Conv2dConfig,
        norm: &LayerNormConfig,
        power_iterations: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let spectral = norm.spectral.then_some(power_iterations);
        let conv = Conv2dLayer::new(
            in_channels,
            out_channels,
            kernel_size,
            config,
            norm.kind.is_none(),
            spectral,
            vb.pp("conv"),
        )?;
        let norm = match norm.kind {
            None => None,
            Some(PlainNormKind::Instance) => Some(PlainNorm::Instance),
            Some(PlainNormKind::Batch) | Some(PlainNormKind::SyncBatch) => Some(PlainNorm::Batch(
                batch_norm(out_channels, NORM_EPS, vb.pp("norm"))?,
            )),
        };
        Ok(Self { conv, norm })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let x = self.conv.forward_t(x, train)?;
        match &self.norm {
            None => Ok(x),
            Some(PlainNorm::Instance) => instance_norm(&x, NORM_EPS),
            Some(PlainNorm::Batch(bn)) => bn.forward_t(&x, train),
        }
    }
}
