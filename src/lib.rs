//! Semantic image synthesis with SPADE and instance-adaptive (ILADE) normalization
//!
//! Label and instance maps go in, images come out. The [`model::Pix2PixModel`]
//! orchestrator composes the generator, the multi-scale discriminator and the
//! optional variational encoders, and exposes one entry point per operating
//! mode: generator loss, discriminator loss, latent encoding, inference and
//! reference-guided generation.

pub mod config;
pub mod device;
pub mod error;
pub mod model;
pub mod networks;
pub mod tracing_config;

pub use config::{ModelConfig, NormMode, Validatable};
pub use device::DevicePreference;
pub use error::{Result, SynthesisError};
pub use model::{Batch, ModelMode, Pix2PixModel};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
