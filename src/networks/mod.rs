//! Networks composed by the model orchestrator
//!
//! The orchestrator talks to its collaborators through the traits defined here,
//! so tests and callers can substitute their own generator, discriminator,
//! encoders or perceptual feature network.

pub mod architecture;
pub mod discriminator;
pub mod encoder;
pub mod generator;
pub mod latent;
pub mod layers;
pub mod loss;
pub mod normalization;

pub use architecture::{SpadeResnetBlock, Vgg19};
pub use discriminator::{DiscriminatorOutput, MultiscaleDiscriminator, NLayerDiscriminator};
pub use encoder::{ConvEncoder, InstanceConvEncoder};
pub use generator::{GeneratorInput, SpadeGenerator};
pub use latent::{reparameterize, InstanceLatent, InstanceLatentParams, LatentCode};
pub use loss::{feature_matching_loss, kld_loss, GanLoss, VggLoss};
pub use normalization::{
    ConditionalNorm, ConditionalNormConfig, ConditionalNormalization, Conditioning, IladeNorm,
    SpadeNorm,
};

use crate::error::Result;
use candle_core::Tensor;

/// Produces an image `(B, 3, H, W)` from semantics and optional latent/instance/sketch inputs
pub trait ImageGenerator {
    fn generate(&self, input: &GeneratorInput<'_>, train: bool) -> Result<Tensor>;
}

/// Classifies concatenated semantic+image tensors
pub trait Discriminator {
    fn discriminate(&self, input: &Tensor, train: bool) -> Result<DiscriminatorOutput>;
}

/// Maps an image to `(mu, logvar)`, each `(B, z_dim)`
pub trait ImageEncoder {
    fn encode(&self, image: &Tensor, train: bool) -> Result<(Tensor, Tensor)>;
}

/// Maps an image and its instance one-hot map to per-instance latent statistics
pub trait InstanceEncoder {
    fn encode_instances(
        &self,
        image: &Tensor,
        instances: &Tensor,
        train: bool,
    ) -> Result<InstanceLatentParams>;
}

/// Multi-depth feature network behind the perceptual loss
pub trait PerceptualExtractor {
    fn features(&self, x: &Tensor) -> Result<Vec<Tensor>>;
}
