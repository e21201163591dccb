// Model orchestrator
// Owns the generator, discriminator and encoders and exposes one entry point
// per operating mode

use super::checkpoint::ParameterGroups;
use super::preprocess::{instance_one_hot, Batch, PreparedInputs, Preprocessor};
use crate::config::{ModelConfig, NormMode, ParamFreeNormKind, Validatable};
use crate::device::resolve_device;
use crate::error::{Result, SynthesisError};
use crate::networks::{
    feature_matching_loss, kld_loss, reparameterize, ConvEncoder, Discriminator,
    DiscriminatorOutput, GanLoss, GeneratorInput, ImageEncoder, ImageGenerator,
    InstanceConvEncoder, InstanceEncoder, InstanceLatent, LatentCode, MultiscaleDiscriminator,
    PerceptualExtractor, SpadeGenerator, Vgg19, VggLoss,
};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, enabled, info, warn, Level};

/// First discriminator layer used for feature matching on the instance-noise path
///
/// The image-level path matches every intermediate layer. The cutoff has no
/// documented derivation and is kept as found.
pub const INSTANCE_FEATURE_FIRST_LAYER: usize = 3;

/// Operating modes, for callers that select the mode by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    Generator,
    Discriminator,
    EncodeOnly,
    Inference,
    Demo,
}

impl FromStr for ModelMode {
    type Err = SynthesisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "generator" => Ok(ModelMode::Generator),
            "discriminator" => Ok(ModelMode::Discriminator),
            "encode_only" => Ok(ModelMode::EncodeOnly),
            "inference" => Ok(ModelMode::Inference),
            "demo" => Ok(ModelMode::Demo),
            _ => Err(SynthesisError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for ModelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelMode::Generator => "generator",
            ModelMode::Discriminator => "discriminator",
            ModelMode::EncodeOnly => "encode_only",
            ModelMode::Inference => "inference",
            ModelMode::Demo => "demo",
        };
        write!(f, "{name}")
    }
}

/// Networks the orchestrator drives
pub struct ModelComponents {
    pub generator: Box<dyn ImageGenerator>,
    pub discriminator: Option<Box<dyn Discriminator>>,
    pub image_encoder: Option<Box<dyn ImageEncoder>>,
    pub instance_encoder: Option<Box<dyn InstanceEncoder>>,
    pub perceptual: Option<Box<dyn PerceptualExtractor>>,
}

/// Loss terms of a generator step, already weighted
#[derive(Debug, Clone)]
pub struct GeneratorLosses {
    pub gan: Tensor,
    pub gan_feat: Option<Tensor>,
    pub vgg: Option<Tensor>,
    pub kld: Option<Tensor>,
}

impl GeneratorLosses {
    /// Terms by name: `GAN`, `GAN_Feat`, `VGG`, `KLD`
    pub fn named(&self) -> Vec<(&'static str, &Tensor)> {
        let mut terms = vec![("GAN", &self.gan)];
        if let Some(t) = &self.gan_feat {
            terms.push(("GAN_Feat", t));
        }
        if let Some(t) = &self.vgg {
            terms.push(("VGG", t));
        }
        if let Some(t) = &self.kld {
            terms.push(("KLD", t));
        }
        terms
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.named()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t)
    }

    pub fn total(&self) -> Result<Tensor> {
        let mut total = self.gan.clone();
        for (_, term) in self.named().into_iter().skip(1) {
            total = (total + term)?;
        }
        Ok(total)
    }
}

/// Discriminator loss on fakes and on reals
#[derive(Debug, Clone)]
pub struct DiscriminatorLosses {
    pub fake: Tensor,
    pub real: Tensor,
}

impl DiscriminatorLosses {
    /// Terms by name: `D_Fake`, `D_real`
    pub fn named(&self) -> Vec<(&'static str, &Tensor)> {
        vec![("D_Fake", &self.fake), ("D_real", &self.real)]
    }

    pub fn total(&self) -> Result<Tensor> {
        Ok((&self.fake + &self.real)?)
    }
}

/// Reference image and its instance ids for reference-guided generation
#[derive(Debug, Clone)]
pub struct ReferenceBatch {
    /// `(1, 3, H, W)`
    pub image: Tensor,
    /// `(1, 1, H, W)` instance ids
    pub instance: Tensor,
}

/// Which target instance receives which reference instance's appearance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceTransfer {
    pub target: usize,
    /// `None` keeps the standard-normal latent for every instance
    pub reference: Option<usize>,
}

/// Result of a call through [`Pix2PixModel::run`]
#[derive(Debug, Clone)]
pub enum ModelOutput {
    Generator {
        losses: GeneratorLosses,
        generated: Tensor,
    },
    Discriminator(DiscriminatorLosses),
    Latent {
        mu: Tensor,
        logvar: Tensor,
    },
    Image(Tensor),
}

/// Conditional GAN orchestrator
///
/// # Example
///
/// ```rust,no_run
/// use inade::config::{ModelConfig, NormMode};
/// use inade::model::{Batch, Pix2PixModel};
/// use candle_core::{DType, Device, Tensor};
///
/// let config = ModelConfig::default()
///     .with_norm_mode(NormMode::Inade)
///     .with_vgg_loss(false);
/// let model = Pix2PixModel::new(config).unwrap();
///
/// let label = Tensor::zeros((1, 1, 256, 256), DType::U32, &Device::Cpu).unwrap();
/// let instance = Tensor::zeros((1, 1, 256, 256), DType::U32, &Device::Cpu).unwrap();
/// let image = Tensor::zeros((1, 3, 256, 256), DType::F32, &Device::Cpu).unwrap();
/// let batch = Batch::new(label, image).with_instance(instance);
///
/// let (losses, _fake) = model.generator_loss(&batch).unwrap();
/// let _ = losses.total().unwrap();
/// ```
pub struct Pix2PixModel {
    config: ModelConfig,
    device: Device,
    preprocessor: Preprocessor,
    generator: Box<dyn ImageGenerator>,
    discriminator: Option<Box<dyn Discriminator>>,
    image_encoder: Option<Box<dyn ImageEncoder>>,
    instance_encoder: Option<Box<dyn InstanceEncoder>>,
    gan_loss: GanLoss,
    vgg_loss: Option<VggLoss>,
    groups: ParameterGroups,
}

impl Pix2PixModel {
    /// Build every network from the configuration
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let device = resolve_device(config.device)?;
        let groups = ParameterGroups::default();

        let vb = |map: &VarMap| VarBuilder::from_varmap(map, DType::F32, &device);
        let generator: Box<dyn ImageGenerator> =
            Box::new(SpadeGenerator::new(vb(&groups.generator), &config)?);

        let discriminator: Option<Box<dyn Discriminator>> = if config.is_train {
            Some(Box::new(MultiscaleDiscriminator::new(
                vb(&groups.discriminator),
                &config,
            )?))
        } else {
            None
        };

        let (image_encoder, instance_encoder): (
            Option<Box<dyn ImageEncoder>>,
            Option<Box<dyn InstanceEncoder>>,
        ) = match (config.use_vae, config.norm_mode) {
            (false, _) => (None, None),
            (true, NormMode::Spade) => (
                Some(Box::new(ConvEncoder::new(vb(&groups.encoder), &config)?) as Box<dyn ImageEncoder>),
                None,
            ),
            (true, NormMode::Inade) => (
                None,
                Some(Box::new(InstanceConvEncoder::new(vb(&groups.encoder), &config)?)
                    as Box<dyn InstanceEncoder>),
            ),
        };

        let perceptual: Option<Box<dyn PerceptualExtractor>> =
            if config.is_train && !config.no_vgg_loss {
                let path = config
                    .vgg_weights
                    .as_ref()
                    .ok_or(SynthesisError::MissingPerceptualWeights)?;
                Some(Box::new(Vgg19::from_safetensors(path, &device)?))
            } else {
                None
            };

        let components = ModelComponents {
            generator,
            discriminator,
            image_encoder,
            instance_encoder,
            perceptual,
        };
        Self::assemble(config, device, components, groups)
    }

    /// Drive caller-supplied networks; `groups` holds whatever parameters they registered
    pub fn with_components(
        config: ModelConfig,
        components: ModelComponents,
        groups: ParameterGroups,
    ) -> Result<Self> {
        config.validate()?;
        let device = resolve_device(config.device)?;
        Self::assemble(config, device, components, groups)
    }

    fn assemble(
        config: ModelConfig,
        device: Device,
        components: ModelComponents,
        groups: ParameterGroups,
    ) -> Result<Self> {
        let vgg_loss = if config.is_train && !config.no_vgg_loss {
            let extractor = components
                .perceptual
                .ok_or(SynthesisError::MissingPerceptualWeights)?;
            Some(VggLoss::new(extractor))
        } else {
            None
        };

        if config.use_amp {
            warn!("use_amp has no effect; computing in f32");
        }
        if config.generator_norm()?.param_free == ParamFreeNormKind::SyncBatch {
            debug!("syncbatch runs as single-process batch normalization");
        }

        let preprocessor = Preprocessor {
            class_nc: config.class_nc(),
            instance_edges: !config.no_instance,
            instance_one_hot: config.norm_mode == NormMode::Inade,
            device: device.clone(),
        };

        info!(
            norm_mode = %config.norm_mode,
            semantic_nc = config.semantic_nc(),
            use_vae = config.use_vae,
            is_train = config.is_train,
            gan_mode = ?config.gan_mode,
            "Model created"
        );

        Ok(Self {
            gan_loss: GanLoss::new(config.gan_mode),
            config,
            device,
            preprocessor,
            generator: components.generator,
            discriminator: components.discriminator,
            image_encoder: components.image_encoder,
            instance_encoder: components.instance_encoder,
            vgg_loss,
            groups,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn parameter_groups(&self) -> &ParameterGroups {
        &self.groups
    }

    /// Derive the network inputs of a batch
    pub fn prepare(&self, batch: &Batch) -> Result<PreparedInputs> {
        self.preprocessor.prepare(batch)
    }

    fn feature_first_layer(&self) -> usize {
        match self.config.norm_mode {
            NormMode::Spade => 0,
            NormMode::Inade => INSTANCE_FEATURE_FIRST_LAYER,
        }
    }

    fn encode_z(&self, image: &Tensor, train: bool) -> Result<(Tensor, Tensor, Tensor)> {
        let encoder = self
            .image_encoder
            .as_deref()
            .ok_or(SynthesisError::Unavailable("image encoder"))?;
        let (mu, logvar) = encoder.encode(image, train)?;
        let z = reparameterize(&mu, &logvar)?;
        Ok((z, mu, logvar))
    }

    fn generate_fake(
        &self,
        inputs: &PreparedInputs,
        compute_kld: bool,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        if compute_kld && !self.config.use_vae {
            return Err(SynthesisError::VaeDisabled);
        }

        let mut latent = None;
        let mut kld = None;
        if self.config.use_vae {
            match self.config.norm_mode {
                NormMode::Spade => {
                    let (z, mu, logvar) = self.encode_z(&inputs.image, train)?;
                    if compute_kld {
                        kld = Some((kld_loss(&mu, &logvar)? * self.config.lambda_kld)?);
                    }
                    latent = Some(LatentCode::Image(z));
                }
                NormMode::Inade => {
                    let encoder = self
                        .instance_encoder
                        .as_deref()
                        .ok_or(SynthesisError::Unavailable("instance encoder"))?;
                    let instances = inputs
                        .instances
                        .as_ref()
                        .ok_or(SynthesisError::MissingInstances)?;
                    let params = encoder.encode_instances(&inputs.image, instances, train)?;
                    if compute_kld {
                        let scale = kld_loss(&params.scale_mu, &params.scale_logvar)?;
                        let bias = kld_loss(&params.bias_mu, &params.bias_logvar)?;
                        kld = Some(((scale + bias)? * (self.config.lambda_kld / 2.0))?);
                    }
                    latent = Some(LatentCode::Instance(params.to_latent()?));
                }
            }
        }

        let input = GeneratorInput {
            semantics: &inputs.semantics,
            latent: latent.as_ref(),
            instances: inputs.instances.as_ref(),
            sketch: inputs.sketch.as_ref(),
            fixed_noise: None,
        };
        let fake = self.generator.generate(&input, train)?;
        Ok((fake, kld))
    }

    /// Run fake and real through the discriminator as one batch, then split
    fn discriminate(
        &self,
        semantics: &Tensor,
        fake: &Tensor,
        real: &Tensor,
        train: bool,
    ) -> Result<(DiscriminatorOutput, DiscriminatorOutput)> {
        let discriminator = self
            .discriminator
            .as_deref()
            .ok_or(SynthesisError::Unavailable("discriminator"))?;
        let fake_concat = Tensor::cat(&[semantics, fake], 1)?;
        let real_concat = Tensor::cat(&[semantics, real], 1)?;
        let fake_and_real = Tensor::cat(&[&fake_concat, &real_concat], 0)?;
        discriminator.discriminate(&fake_and_real, train)?.split_batch()
    }

    /// Weighted generator losses and the generated image
    pub fn generator_loss(&self, batch: &Batch) -> Result<(GeneratorLosses, Tensor)> {
        let train = self.config.is_train;
        let inputs = self.prepare(batch)?;
        let (fake, kld) = self.generate_fake(&inputs, self.config.use_vae, train)?;
        let (pred_fake, pred_real) = self.discriminate(&inputs.semantics, &fake, &inputs.image, train)?;

        let gan = self.gan_loss.generator(&pred_fake)?;
        let gan_feat = if self.config.no_gan_feat_loss {
            None
        } else {
            feature_matching_loss(
                &pred_fake,
                &pred_real,
                self.config.lambda_feat,
                self.feature_first_layer(),
            )?
        };
        let vgg = match &self.vgg_loss {
            Some(vgg) => Some((vgg.forward(&fake, &inputs.image)? * self.config.lambda_vgg)?),
            None => None,
        };

        let losses = GeneratorLosses {
            gan,
            gan_feat,
            vgg,
            kld,
        };
        if enabled!(Level::DEBUG) {
            for (name, value) in losses.named() {
                if let Ok(v) = value.to_scalar::<f32>() {
                    debug!(term = name, value = v, "Generator loss");
                }
            }
        }
        Ok((losses, fake))
    }

    /// Discriminator losses on a detached fake
    pub fn discriminator_loss(&self, batch: &Batch) -> Result<DiscriminatorLosses> {
        let train = self.config.is_train;
        let inputs = self.prepare(batch)?;
        let (fake, _) = self.generate_fake(&inputs, false, train)?;
        let fake = fake.detach();
        let (pred_fake, pred_real) = self.discriminate(&inputs.semantics, &fake, &inputs.image, train)?;

        let losses = DiscriminatorLosses {
            fake: self.gan_loss.discriminator(&pred_fake, false)?,
            real: self.gan_loss.discriminator(&pred_real, true)?,
        };
        if enabled!(Level::DEBUG) {
            for (name, value) in losses.named() {
                if let Ok(v) = value.to_scalar::<f32>() {
                    debug!(term = name, value = v, "Discriminator loss");
                }
            }
        }
        Ok(losses)
    }

    /// Image-level `(mu, logvar)`; SPADE mode with `use_vae` only
    pub fn encode_latent(&self, batch: &Batch) -> Result<(Tensor, Tensor)> {
        if self.config.norm_mode != NormMode::Spade {
            return Err(SynthesisError::Unavailable("latent encoding outside spade mode"));
        }
        let inputs = self.prepare(batch)?;
        let (_, mu, logvar) = self.encode_z(&inputs.image, self.config.is_train)?;
        Ok((mu, logvar))
    }

    /// Generated image only, detached from every parameter
    pub fn infer(&self, batch: &Batch) -> Result<Tensor> {
        let inputs = self.prepare(batch)?;
        let (fake, _) = self.generate_fake(&inputs, false, false)?;
        Ok(fake.detach())
    }

    /// Reference-guided generation
    ///
    /// Every target instance starts from a zero-mean, unit-deviation latent. If
    /// `transfer.reference` is set, the target instance takes the statistics the
    /// instance encoder assigns to that instance of the reference image.
    /// `fixed_noise` `(B, Ninst, 2, noise_nc)` replaces the fresh standard-normal draw.
    pub fn demo_generate(
        &self,
        batch: &Batch,
        reference: &ReferenceBatch,
        transfer: InstanceTransfer,
        fixed_noise: Option<&Tensor>,
    ) -> Result<Tensor> {
        if self.config.norm_mode != NormMode::Inade {
            return Err(SynthesisError::Unavailable("reference-guided generation outside inade mode"));
        }
        let encoder = self
            .instance_encoder
            .as_deref()
            .ok_or(SynthesisError::Unavailable("instance encoder"))?;

        let inputs = self.prepare(batch)?;
        let instances = inputs
            .instances
            .as_ref()
            .ok_or(SynthesisError::MissingInstances)?;
        let (b, count, _, _) = instances.dims4()?;
        if transfer.target >= count {
            return Err(SynthesisError::InstanceOutOfRange {
                index: transfer.target,
                count,
            });
        }

        let base = InstanceLatent::standard(b, count, self.config.noise_nc, &self.device)?;
        let latent = match transfer.reference {
            Some(reference_index) => {
                let ref_instances = instance_one_hot(&reference.instance.to_device(&self.device)?)?;
                let ref_image = reference.image.to_device(&self.device)?.to_dtype(DType::F32)?;
                let ref_latent = encoder
                    .encode_instances(&ref_image, &ref_instances, false)?
                    .to_latent()?;
                base.transfer_from(transfer.target, &ref_latent, reference_index)?
            }
            None => base,
        };
        info!(
            target = transfer.target,
            reference = ?transfer.reference,
            instances = count,
            "Reference-guided generation"
        );

        let latent = LatentCode::Instance(latent);
        let input = GeneratorInput {
            semantics: &inputs.semantics,
            latent: Some(&latent),
            instances: Some(instances),
            sketch: inputs.sketch.as_ref(),
            fixed_noise,
        };
        Ok(self.generator.generate(&input, false)?.detach())
    }

    /// KL term of the latent path for a batch
    pub fn kld_loss(&self, batch: &Batch) -> Result<Tensor> {
        if !self.config.use_vae {
            return Err(SynthesisError::VaeDisabled);
        }
        let inputs = self.prepare(batch)?;
        let (_, kld) = self.generate_fake(&inputs, true, self.config.is_train)?;
        kld.ok_or(SynthesisError::VaeDisabled)
    }

    /// Dispatch on a mode; `Demo` needs reference inputs and goes through [`Self::demo_generate`]
    pub fn run(&self, batch: &Batch, mode: ModelMode) -> Result<ModelOutput> {
        debug!(mode = %mode, "Dispatching");
        match mode {
            ModelMode::Generator => {
                let (losses, generated) = self.generator_loss(batch)?;
                Ok(ModelOutput::Generator { losses, generated })
            }
            ModelMode::Discriminator => Ok(ModelOutput::Discriminator(
                self.discriminator_loss(batch)?,
            )),
            ModelMode::EncodeOnly => {
                let (mu, logvar) = self.encode_latent(batch)?;
                Ok(ModelOutput::Latent { mu, logvar })
            }
            ModelMode::Inference => Ok(ModelOutput::Image(self.infer(batch)?)),
            ModelMode::Demo => Err(SynthesisError::Unavailable(
                "demo through run; use demo_generate",
            )),
        }
    }

    /// Parse a mode name and dispatch
    pub fn run_named(&self, batch: &Batch, mode: &str) -> Result<ModelOutput> {
        self.run(batch, mode.parse()?)
    }

    /// AdamW optimizers for the generator side (with the encoder under `use_vae`) and the discriminator
    ///
    /// Learning rates are `lr / 2` and `lr * 2` unless `no_ttur` is set.
    pub fn create_optimizers(&self) -> Result<(AdamW, AdamW)> {
        if self.discriminator.is_none() {
            return Err(SynthesisError::Unavailable("discriminator"));
        }
        let mut g_params = self.groups.generator.all_vars();
        if self.config.use_vae {
            g_params.extend(self.groups.encoder.all_vars());
        }
        let d_params = self.groups.discriminator.all_vars();

        let lr = self.config.lr;
        let (g_lr, d_lr) = if self.config.no_ttur {
            (lr, lr)
        } else {
            (lr / 2.0, lr * 2.0)
        };
        let params = |lr| ParamsAdamW {
            lr,
            beta1: self.config.beta1,
            beta2: self.config.beta2,
            eps: 1e-8,
            weight_decay: 0.0,
        };

        debug!(g_lr, d_lr, g_vars = g_params.len(), d_vars = d_params.len(), "Creating optimizers");
        Ok((
            AdamW::new(g_params, params(g_lr))?,
            AdamW::new(d_params, params(d_lr))?,
        ))
    }

    /// Write `<epoch>_net_<G|D|E>.safetensors` into `dir`
    pub fn save<P: AsRef<Path>>(&self, dir: P, epoch: &str) -> Result<()> {
        self.groups.save(dir, epoch)
    }

    /// Restore parameters written by [`Self::save`]
    pub fn load<P: AsRef<Path>>(&mut self, dir: P, epoch: &str) -> Result<()> {
        self.groups.load(dir, epoch)
    }
}
