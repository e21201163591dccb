// Variational encoders
// ConvEncoder maps an image to one Gaussian; InstanceConvEncoder maps it to one
// Gaussian per instance and modulation path

use super::latent::InstanceLatentParams;
use super::layers::{leaky_relu, resize_bilinear, resize_nearest, NormedConv2d};
use super::{ImageEncoder, InstanceEncoder};
use crate::config::{LayerNormConfig, ModelConfig};
use crate::error::{Result, SynthesisError};
use candle_core::{Module, Tensor};
use candle_nn::{linear, Conv2dConfig, Linear, VarBuilder};

const SLOPE: f64 = 0.2;
const INSTANCE_TRUNK_DEPTH: usize = 4;

/// Stride-2 3x3 convolutions with widths ndf, 2, 4, 8, 8, 8 x ndf
struct EncoderTrunk {
    layers: Vec<NormedConv2d>,
    input_size: usize,
    out_channels: usize,
}

impl EncoderTrunk {
    fn new(
        vb: VarBuilder,
        ndf: usize,
        depth: usize,
        input_size: usize,
        norm: &LayerNormConfig,
        power_iterations: usize,
    ) -> Result<Self> {
        let widths = [1, 2, 4, 8, 8, 8];
        let config = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let mut layers = Vec::with_capacity(depth);
        let mut in_channels = 3;
        for (i, mult) in widths.iter().take(depth).enumerate() {
            let out = ndf * mult;
            layers.push(NormedConv2d::new(
                in_channels,
                out,
                3,
                config,
                norm,
                power_iterations,
                vb.pp(format!("layer{}", i + 1)),
            )?);
            in_channels = out;
        }
        Ok(Self {
            layers,
            input_size,
            out_channels: in_channels,
        })
    }

    /// Side of the output feature map for the configured input size
    fn output_size(&self) -> usize {
        (0..self.layers.len()).fold(self.input_size, |s, _| s.div_ceil(2))
    }

    fn forward_t(&self, image: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = resize_bilinear(image, self.input_size, self.input_size)?;
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 {
                x = leaky_relu(&x, SLOPE)?;
            }
            x = layer.forward_t(&x, train)?;
        }
        Ok(leaky_relu(&x, SLOPE)?)
    }
}

/// Image-level encoder producing `(mu, logvar)` of width `z_dim`
pub struct ConvEncoder {
    trunk: EncoderTrunk,
    fc_mu: Linear,
    fc_var: Linear,
}

impl ConvEncoder {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let depth = if config.encoder_input_size >= 256 { 6 } else { 5 };
        let trunk = EncoderTrunk::new(
            vb.clone(),
            config.ndf,
            depth,
            config.encoder_input_size,
            &config.encoder_norm()?,
            config.spectral_power_iterations,
        )?;
        let s0 = trunk.output_size();
        let flat = trunk.out_channels * s0 * s0;
        let fc_mu = linear(flat, config.z_dim, vb.pp("fc_mu"))?;
        let fc_var = linear(flat, config.z_dim, vb.pp("fc_var"))?;
        Ok(Self {
            trunk,
            fc_mu,
            fc_var,
        })
    }
}

impl ImageEncoder for ConvEncoder {
    fn encode(&self, image: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let x = self.trunk.forward_t(image, train)?.flatten_from(1)?;
        Ok((self.fc_mu.forward(&x)?, self.fc_var.forward(&x)?))
    }
}

/// Average features under each instance mask: `(B, C, h, w)` x `(B, N, h, w)` -> `(B, N, C)`
///
/// Instances absent at the feature resolution pool to zeros.
pub fn instance_average(features: &Tensor, instances: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = features.dims4()?;
    let instances = resize_nearest(instances, h, w)?;
    let n = instances.dim(1)?;
    if instances.dim(0)? != b {
        return Err(SynthesisError::ShapeMismatch(format!(
            "instance map batch {} does not match image batch {b}",
            instances.dim(0)?
        )));
    }
    let masks = instances.reshape((b, n, h * w))?;
    let feats = features.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()?;
    let sums = masks.matmul(&feats)?;
    let counts = (masks.sum_keepdim(2)? + 1e-6)?;
    Ok(sums.broadcast_div(&counts)?)
}

/// Instance-level encoder producing scale and bias Gaussians per instance
pub struct InstanceConvEncoder {
    trunk: EncoderTrunk,
    fc_scale_mu: Linear,
    fc_scale_var: Linear,
    fc_bias_mu: Linear,
    fc_bias_var: Linear,
}

impl InstanceConvEncoder {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let trunk = EncoderTrunk::new(
            vb.clone(),
            config.ndf,
            INSTANCE_TRUNK_DEPTH,
            config.encoder_input_size,
            &config.encoder_norm()?,
            config.spectral_power_iterations,
        )?;
        let c = trunk.out_channels;
        let head = |name: &str| linear(c, config.noise_nc, vb.pp(name));
        Ok(Self {
            fc_scale_mu: head("fc_s_mu")?,
            fc_scale_var: head("fc_s_var")?,
            fc_bias_mu: head("fc_b_mu")?,
            fc_bias_var: head("fc_b_var")?,
            trunk,
        })
    }
}

impl InstanceEncoder for InstanceConvEncoder {
    fn encode_instances(
        &self,
        image: &Tensor,
        instances: &Tensor,
        train: bool,
    ) -> Result<InstanceLatentParams> {
        let features = self.trunk.forward_t(image, train)?;
        let pooled = instance_average(&features, instances)?;
        Ok(InstanceLatentParams {
            scale_mu: self.fc_scale_mu.forward(&pooled)?,
            scale_logvar: self.fc_scale_var.forward(&pooled)?,
            bias_mu: self.fc_bias_mu.forward(&pooled)?,
            bias_logvar: self.fc_bias_var.forward(&pooled)?,
        })
    }
}
