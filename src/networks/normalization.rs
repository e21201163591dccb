// Conditional normalization layers
// SPADE modulates normalized features per pixel from the semantic map;
// ILADE additionally modulates them per instance from projected noise

use super::layers::{resize_nearest, ParamFreeNorm};
use crate::config::{ModelConfig, NormMode, ParamFreeNormKind, SpadeNormConfig};
use crate::error::{Result, SynthesisError};
use candle_core::{Module, Tensor};
use candle_nn::{conv2d, conv2d_no_bias, linear, Conv2d, Conv2dConfig, Init, Linear, VarBuilder};

/// Conditioning signals handed to every conditional normalization layer
#[derive(Clone, Copy)]
pub struct Conditioning<'a> {
    /// Semantic map `(B, K, H, W)`, possibly with a trailing edge channel
    pub segmap: &'a Tensor,
    /// Instance one-hot map `(B, Ninst, H, W)`
    pub instances: Option<&'a Tensor>,
    /// Per-instance noise `(B, Ninst, 2, Dnoise)`; index 0 on axis 2 feeds the scale path
    pub noise: Option<&'a Tensor>,
    /// Sketch map `(B, 1, H, W)`
    pub sketch: Option<&'a Tensor>,
}

impl<'a> Conditioning<'a> {
    pub fn semantic(segmap: &'a Tensor) -> Self {
        Self {
            segmap,
            instances: None,
            noise: None,
            sketch: None,
        }
    }

    pub fn with_instances(mut self, instances: &'a Tensor, noise: &'a Tensor) -> Self {
        self.instances = Some(instances);
        self.noise = Some(noise);
        self
    }

    pub fn with_sketch(mut self, sketch: Option<&'a Tensor>) -> Self {
        self.sketch = sketch;
        self
    }
}

/// The single capability shared by SPADE and ILADE
pub trait ConditionalNormalization {
    /// Normalize `x` and modulate it with the conditioning; output has the shape of `x`
    fn apply(&self, x: &Tensor, cond: &Conditioning<'_>, train: bool) -> Result<Tensor>;
}

/// Everything needed to build a conditional norm, resolved from the model config
#[derive(Debug, Clone, Copy)]
pub struct ConditionalNormConfig {
    pub mode: NormMode,
    pub norm: SpadeNormConfig,
    /// Channels of the semantic map given to SPADE
    pub semantic_nc: usize,
    /// Class channels used by ILADE (edge channel excluded)
    pub class_nc: usize,
    pub noise_nc: usize,
    pub add_sketch: bool,
    pub hidden_dim: usize,
}

impl ConditionalNormConfig {
    pub fn from_model(config: &ModelConfig, norm: SpadeNormConfig) -> Self {
        Self {
            mode: config.norm_mode,
            norm,
            semantic_nc: config.semantic_nc(),
            class_nc: config.class_nc(),
            noise_nc: config.noise_nc,
            add_sketch: config.add_sketch,
            hidden_dim: config.hidden_dim,
        }
    }
}

/// SPADE normalization layer
/// Uses the semantic map to predict a per-pixel scale and bias
pub struct SpadeNorm {
    param_free: ParamFreeNorm,
    /// Shared embedding of the semantic map
    shared_conv: Conv2d,
    /// Convolutions for computing scale (gamma) and bias (beta)
    scale_conv: Conv2d,
    bias_conv: Conv2d,
}

impl SpadeNorm {
    /// Create a new SPADE normalization layer
    ///
    /// # Arguments
    /// * `vb` - Variable builder
    /// * `norm_channels` - Number of channels to normalize
    /// * `label_channels` - Number of channels in the semantic map
    /// * `hidden_dim` - Width of the embedding space
    /// * `param_free` - Normalization applied before modulation
    /// * `kernel_size` - Kernel size of the embedding convolutions
    pub fn new(
        vb: VarBuilder,
        norm_channels: usize,
        label_channels: usize,
        hidden_dim: usize,
        param_free: ParamFreeNormKind,
        kernel_size: usize,
    ) -> Result<Self> {
        let conv_config = Conv2dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };

        let param_free = ParamFreeNorm::new(param_free, norm_channels, vb.pp("param_free_norm"))?;
        let shared_conv = conv2d(
            label_channels,
            hidden_dim,
            kernel_size,
            conv_config,
            vb.pp("mlp_shared"),
        )?;
        let scale_conv = conv2d(
            hidden_dim,
            norm_channels,
            kernel_size,
            conv_config,
            vb.pp("mlp_gamma"),
        )?;
        let bias_conv = conv2d(
            hidden_dim,
            norm_channels,
            kernel_size,
            conv_config,
            vb.pp("mlp_beta"),
        )?;

        Ok(Self {
            param_free,
            shared_conv,
            scale_conv,
            bias_conv,
        })
    }

    /// Forward pass through SPADE normalization
    ///
    /// # Arguments
    /// * `x` - Features to normalize (B, C, H, W)
    /// * `segmap` - Semantic map (B, K, H', W'), resized to (H, W)
    pub fn forward(&self, x: &Tensor, segmap: &Tensor, train: bool) -> Result<Tensor> {
        let normalized = self.param_free.forward_t(x, train)?;

        let (_, _, h, w) = x.dims4()?;
        let segmap = resize_nearest(segmap, h, w)?;

        let actv = self.shared_conv.forward(&segmap)?.relu()?;
        let gamma = self.scale_conv.forward(&actv)?;
        let beta = self.bias_conv.forward(&actv)?;

        Ok(((normalized * (gamma + 1.0)?)? + beta)?)
    }
}

impl ConditionalNormalization for SpadeNorm {
    fn apply(&self, x: &Tensor, cond: &Conditioning<'_>, train: bool) -> Result<Tensor> {
        self.forward(x, cond.segmap, train)
    }
}

struct SketchFusion {
    sketch_conv: Conv2d,
    merge_conv: Conv2d,
}

/// Instance-adaptive normalization layer
///
/// Scale and bias fields are `w_k * n_i + b_k` where `k` is the semantic class
/// of a pixel and `n_i` the projected noise of the instance covering it, so two
/// instances of one class can receive independent appearance.
pub struct IladeNorm {
    norm_channels: usize,
    class_channels: usize,
    param_free: ParamFreeNorm,
    /// Per-class affine weight, `(classes, norm_channels, 2)`
    weight: Tensor,
    /// Per-class affine bias, `(classes, norm_channels, 2)`
    bias: Tensor,
    fc_noise: Linear,
    sketch: Option<SketchFusion>,
}

impl IladeNorm {
    pub fn new(
        vb: VarBuilder,
        norm_channels: usize,
        class_channels: usize,
        noise_channels: usize,
        param_free: ParamFreeNormKind,
        add_sketch: bool,
    ) -> Result<Self> {
        let param_free = ParamFreeNorm::new(param_free, norm_channels, vb.pp("param_free_norm"))?;
        let weight = vb.get_with_hints(
            (class_channels, norm_channels, 2),
            "weight",
            Init::Uniform { lo: 0.0, up: 1.0 },
        )?;
        let bias = vb.get_with_hints((class_channels, norm_channels, 2), "bias", Init::Const(0.0))?;
        let fc_noise = linear(noise_channels, norm_channels, vb.pp("fc_noise"))?;

        let sketch = if add_sketch {
            let sketch_conv = conv2d(
                1,
                norm_channels,
                3,
                Conv2dConfig {
                    padding: 1,
                    ..Default::default()
                },
                vb.pp("sketch_conv"),
            )?;
            let merge_conv = conv2d_no_bias(
                2 * norm_channels,
                norm_channels,
                1,
                Conv2dConfig::default(),
                vb.pp("merge_conv"),
            )?;
            Some(SketchFusion {
                sketch_conv,
                merge_conv,
            })
        } else {
            None
        };

        Ok(Self {
            norm_channels,
            class_channels,
            param_free,
            weight,
            bias,
            fc_noise,
            sketch,
        })
    }

    pub fn forward(&self, x: &Tensor, cond: &Conditioning<'_>, train: bool) -> Result<Tensor> {
        let instances = cond.instances.ok_or(SynthesisError::MissingInstances)?;
        let noise = cond.noise.ok_or(SynthesisError::MissingNoise)?;
        if self.sketch.is_some() && cond.sketch.is_none() {
            return Err(SynthesisError::MissingSketch);
        }

        let normalized = self.param_free.forward_t(x, train)?;

        let (_, _, h, w) = x.dims4()?;
        let segmap = resize_nearest(cond.segmap, h, w)?;
        let instances = resize_nearest(instances, h, w)?;

        let seg_channels = segmap.dim(1)?;
        if seg_channels < self.class_channels {
            return Err(SynthesisError::ShapeMismatch(format!(
                "semantic map has {seg_channels} channels, expected at least {}",
                self.class_channels
            )));
        }
        // Trailing channels (the instance edge map) do not take part in modulation
        let classes = segmap.narrow(1, 0, self.class_channels)?;

        let (b, n_inst, paths, noise_nc) = noise.dims4()?;
        if paths != 2 || instances.dim(1)? != n_inst {
            return Err(SynthesisError::ShapeMismatch(format!(
                "noise {:?} does not match instance map {:?}",
                noise.dims(),
                instances.dims()
            )));
        }
        let projected = self
            .fc_noise
            .forward(&noise.reshape((b * n_inst * 2, noise_nc))?)?
            .reshape((b, n_inst, 2, self.norm_channels))?;

        let scale = self.modulation(&classes, &instances, &projected, 0)?;
        let shift = self.modulation(&classes, &instances, &projected, 1)?;
        let out = ((scale * normalized)? + shift)?;

        match (&self.sketch, cond.sketch) {
            (Some(fusion), Some(sketch)) => {
                let sketch = resize_nearest(sketch, h, w)?;
                let sketch = fusion.sketch_conv.forward(&sketch)?;
                Ok(fusion
                    .merge_conv
                    .forward(&Tensor::cat(&[&out, &sketch], 1)?)?)
            }
            _ => Ok(out),
        }
    }

    /// Per-pixel field `class_weight * instance_noise + class_bias` for one path
    fn modulation(
        &self,
        classes: &Tensor,
        instances: &Tensor,
        projected: &Tensor,
        path: usize,
    ) -> Result<Tensor> {
        let class_weight = class_affine(&self.weight.narrow(2, path, 1)?.squeeze(2)?, classes)?;
        let class_bias = class_affine(&self.bias.narrow(2, path, 1)?.squeeze(2)?, classes)?;
        let instance_noise =
            instance_projection(&projected.narrow(2, path, 1)?.squeeze(2)?, instances)?;
        Ok(((class_weight * instance_noise)? + class_bias)?)
    }
}

impl ConditionalNormalization for IladeNorm {
    fn apply(&self, x: &Tensor, cond: &Conditioning<'_>, train: bool) -> Result<Tensor> {
        self.forward(x, cond, train)
    }
}

/// Contract `(K, C)` per-class parameters against a `(B, K, H, W)` one-hot map into `(B, C, H, W)`
pub fn class_affine(params: &Tensor, classes: &Tensor) -> candle_core::Result<Tensor> {
    let (b, k, h, w) = classes.dims4()?;
    let c = params.dim(1)?;
    let flat = classes.reshape((b, k, h * w))?;
    params
        .t()?
        .contiguous()?
        .broadcast_matmul(&flat)?
        .reshape((b, c, h, w))
}

/// Contract `(B, N, C)` per-instance vectors against a `(B, N, H, W)` one-hot map into `(B, C, H, W)`
pub fn instance_projection(noise: &Tensor, instances: &Tensor) -> candle_core::Result<Tensor> {
    let (b, n, h, w) = instances.dims4()?;
    let c = noise.dim(2)?;
    let flat = instances.reshape((b, n, h * w))?;
    noise
        .transpose(1, 2)?
        .contiguous()?
        .broadcast_matmul(&flat)?
        .reshape((b, c, h, w))
}

/// Conditional normalization chosen once, at construction
pub enum ConditionalNorm {
    Spade(SpadeNorm),
    Ilade(IladeNorm),
}

impl ConditionalNorm {
    pub fn new(vb: VarBuilder, norm_channels: usize, config: &ConditionalNormConfig) -> Result<Self> {
        Ok(match config.mode {
            NormMode::Spade => ConditionalNorm::Spade(SpadeNorm::new(
                vb,
                norm_channels,
                config.semantic_nc,
                config.hidden_dim,
                config.norm.param_free,
                config.norm.kernel_size,
            )?),
            NormMode::Inade => ConditionalNorm::Ilade(IladeNorm::new(
                vb,
                norm_channels,
                config.class_nc,
                config.noise_nc,
                config.norm.param_free,
                config.add_sketch,
            )?),
        })
    }
}

impl ConditionalNormalization for ConditionalNorm {
    fn apply(&self, x: &Tensor, cond: &Conditioning<'_>, train: bool) -> Result<Tensor> {
        match self {
            ConditionalNorm::Spade(norm) => norm.apply(x, cond, train),
            ConditionalNorm::Ilade(norm) => norm.apply(x, cond, train),
        }
    }
}
