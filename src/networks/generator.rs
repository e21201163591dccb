// SPADE generator
// Upsamples a coarse feature grid through conditionally normalized residual blocks

use super::architecture::SpadeResnetBlock;
use super::latent::{InstanceLatent, LatentCode};
use super::layers::{leaky_relu, resize_nearest};
use super::normalization::{ConditionalNormConfig, Conditioning};
use super::ImageGenerator;
use crate::config::{ModelConfig, NormMode};
use crate::error::{Result, SynthesisError};
use candle_core::{Module, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};
use tracing::debug;

/// Inputs of one generator call
#[derive(Clone, Copy)]
pub struct GeneratorInput<'a> {
    /// Semantic map `(B, semantic_nc, H, W)`
    pub semantics: &'a Tensor,
    pub latent: Option<&'a LatentCode>,
    /// Instance one-hot map `(B, Ninst, H, W)`
    pub instances: Option<&'a Tensor>,
    pub sketch: Option<&'a Tensor>,
    /// Standard-normal draw `(B, Ninst, 2, noise_nc)` reused instead of fresh noise
    pub fixed_noise: Option<&'a Tensor>,
}

impl<'a> GeneratorInput<'a> {
    pub fn new(semantics: &'a Tensor) -> Self {
        Self {
            semantics,
            latent: None,
            instances: None,
            sketch: None,
            fixed_noise: None,
        }
    }
}

enum GeneratorHead {
    /// Projects `z` to the first feature grid
    Latent(Linear),
    /// Embeds the downsampled semantic map
    Semantic(Conv2d),
}

pub struct SpadeGenerator {
    mode: NormMode,
    z_dim: usize,
    noise_nc: usize,
    width: usize,
    grid: (usize, usize),
    head: GeneratorHead,
    head_0: SpadeResnetBlock,
    g_middle_0: SpadeResnetBlock,
    g_middle_1: SpadeResnetBlock,
    /// up_0 .. up_3, plus up_4 with the `most` setting
    up_blocks: Vec<SpadeResnetBlock>,
    /// Extra upsample between the middle blocks for `more` and `most`
    middle_upsample: bool,
    conv_img: Conv2d,
    leaky_slope: f64,
}

impl SpadeGenerator {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let norm = ConditionalNormConfig::from_model(config, config.generator_norm()?);
        let nf = config.ngf;
        let grid = config.latent_grid();
        let num_up = config.num_upsampling_layers.count();
        let slope = config.leaky_slope;
        let iters = config.spectral_power_iterations;

        let head = if config.use_vae && config.norm_mode == NormMode::Spade {
            GeneratorHead::Latent(linear(config.z_dim, 16 * nf * grid.0 * grid.1, vb.pp("fc"))?)
        } else {
            GeneratorHead::Semantic(conv2d(
                config.semantic_nc(),
                16 * nf,
                3,
                Conv2dConfig {
                    padding: 1,
                    ..Default::default()
                },
                vb.pp("fc"),
            )?)
        };

        let block = |name: &str, fin: usize, fout: usize| {
            SpadeResnetBlock::new(vb.pp(name), fin, fout, &norm, slope, iters)
        };
        let head_0 = block("head_0", 16 * nf, 16 * nf)?;
        let g_middle_0 = block("G_middle_0", 16 * nf, 16 * nf)?;
        let g_middle_1 = block("G_middle_1", 16 * nf, 16 * nf)?;

        let mut up_blocks = vec![
            block("up_0", 16 * nf, 8 * nf)?,
            block("up_1", 8 * nf, 4 * nf)?,
            block("up_2", 4 * nf, 2 * nf)?,
            block("up_3", 2 * nf, nf)?,
        ];
        let mut final_nc = nf;
        if num_up == 7 {
            up_blocks.push(block("up_4", nf, nf / 2)?);
            final_nc = nf / 2;
        }

        let conv_img = conv2d(
            final_nc,
            3,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv_img"),
        )?;

        debug!(
            mode = %config.norm_mode,
            ngf = nf,
            grid_h = grid.0,
            grid_w = grid.1,
            num_up,
            "Built generator"
        );

        Ok(Self {
            mode: config.norm_mode,
            z_dim: config.z_dim,
            noise_nc: config.noise_nc,
            width: nf,
            grid,
            head,
            head_0,
            g_middle_0,
            g_middle_1,
            up_blocks,
            middle_upsample: num_up > 5,
            conv_img,
            leaky_slope: slope,
        })
    }

    fn initial_features(&self, input: &GeneratorInput<'_>) -> Result<Tensor> {
        let (sh, sw) = self.grid;
        let batch = input.semantics.dim(0)?;
        match &self.head {
            GeneratorHead::Latent(fc) => {
                let z = match input.latent {
                    Some(LatentCode::Image(z)) => z.clone(),
                    Some(LatentCode::Instance(_)) => {
                        return Err(SynthesisError::ShapeMismatch(
                            "instance latent given to an image-latent generator".to_string(),
                        ))
                    }
                    None => Tensor::randn(0f32, 1.0, (batch, self.z_dim), input.semantics.device())?,
                };
                Ok(fc.forward(&z)?.reshape((batch, 16 * self.width, sh, sw))?)
            }
            GeneratorHead::Semantic(fc) => {
                let seg = resize_nearest(input.semantics, sh, sw)?;
                Ok(fc.forward(&seg)?)
            }
        }
    }

    fn instance_noise(&self, input: &GeneratorInput<'_>) -> Result<Option<Tensor>> {
        if self.mode != NormMode::Inade {
            return Ok(None);
        }
        let instances = input.instances.ok_or(SynthesisError::MissingInstances)?;
        let (batch, count, _, _) = instances.dims4()?;
        let noise = match input.latent {
            Some(LatentCode::Instance(latent)) => latent.sample_noise(input.fixed_noise)?,
            Some(LatentCode::Image(_)) => {
                return Err(SynthesisError::ShapeMismatch(
                    "image latent given to an instance-adaptive generator".to_string(),
                ))
            }
            None => InstanceLatent::standard(batch, count, self.noise_nc, instances.device())?
                .sample_noise(input.fixed_noise)?,
        };
        Ok(Some(noise))
    }
}

impl ImageGenerator for SpadeGenerator {
    fn generate(&self, input: &GeneratorInput<'_>, train: bool) -> Result<Tensor> {
        let noise = self.instance_noise(input)?;
        let mut cond = Conditioning::semantic(input.semantics).with_sketch(input.sketch);
        if let (Some(instances), Some(noise)) = (input.instances, noise.as_ref()) {
            cond = cond.with_instances(instances, noise);
        }

        let upsample = |x: &Tensor| -> Result<Tensor> {
            let (_, _, h, w) = x.dims4()?;
            Ok(x.upsample_nearest2d(2 * h, 2 * w)?)
        };

        let mut x = self.initial_features(input)?;
        x = self.head_0.forward(&x, &cond, train)?;
        x = upsample(&x)?;
        x = self.g_middle_0.forward(&x, &cond, train)?;
        if self.middle_upsample {
            x = upsample(&x)?;
        }
        x = self.g_middle_1.forward(&x, &cond, train)?;
        for block in &self.up_blocks {
            x = upsample(&x)?;
            x = block.forward(&x, &cond, train)?;
        }

        let x = self.conv_img.forward(&leaky_relu(&x, self.leaky_slope)?)?;
        Ok(x.tanh()?)
    }
}
