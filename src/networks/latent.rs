//! Latent codes consumed by the generator
//!
//! The image-level path carries a single `z` per image. The instance-level path
//! carries a Gaussian per instance and per modulation path (scale, bias), from
//! which the generator draws the noise fed to every ILADE layer.

use crate::error::{Result, SynthesisError};
use candle_core::{DType, Device, Tensor};

/// Draw `mu + exp(0.5 * logvar) * eps` with fresh standard-normal `eps`
pub fn reparameterize(mu: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    let std = (logvar * 0.5)?.exp()?;
    let eps = std.randn_like(0.0, 1.0)?;
    Ok(((eps * std)? + mu)?)
}

/// Encoder output for the instance path, each `(B, Ninst, noise_nc)`
#[derive(Debug, Clone)]
pub struct InstanceLatentParams {
    pub scale_mu: Tensor,
    pub scale_logvar: Tensor,
    pub bias_mu: Tensor,
    pub bias_logvar: Tensor,
}

impl InstanceLatentParams {
    /// Convert log-variances to standard deviations
    pub fn to_latent(&self) -> Result<InstanceLatent> {
        Ok(InstanceLatent {
            scale_mu: self.scale_mu.clone(),
            scale_std: (&self.scale_logvar * 0.5)?.exp()?,
            bias_mu: self.bias_mu.clone(),
            bias_std: (&self.bias_logvar * 0.5)?.exp()?,
        })
    }
}

/// Per-instance Gaussians for the scale and bias paths, each `(B, Ninst, noise_nc)`
#[derive(Debug, Clone)]
pub struct InstanceLatent {
    pub scale_mu: Tensor,
    pub scale_std: Tensor,
    pub bias_mu: Tensor,
    pub bias_std: Tensor,
}

impl InstanceLatent {
    /// Zero mean, unit deviation for every instance
    pub fn standard(batch: usize, instances: usize, noise_nc: usize, device: &Device) -> Result<Self> {
        let shape = (batch, instances, noise_nc);
        let mu = Tensor::zeros(shape, DType::F32, device)?;
        let std = Tensor::ones(shape, DType::F32, device)?;
        Ok(Self {
            scale_mu: mu.clone(),
            scale_std: std.clone(),
            bias_mu: mu,
            bias_std: std,
        })
    }

    pub fn instance_count(&self) -> Result<usize> {
        Ok(self.scale_mu.dim(1)?)
    }

    /// Copy the statistics of `reference` instance `reference_index` (batch
    /// element 0) onto instance `target` of every batch element
    pub fn transfer_from(
        &self,
        target: usize,
        reference: &InstanceLatent,
        reference_index: usize,
    ) -> Result<Self> {
        let count = self.instance_count()?;
        if target >= count {
            return Err(SynthesisError::InstanceOutOfRange {
                index: target,
                count,
            });
        }
        let reference_count = reference.instance_count()?;
        if reference_index >= reference_count {
            return Err(SynthesisError::InstanceOutOfRange {
                index: reference_index,
                count: reference_count,
            });
        }

        let splice = |dst: &Tensor, src: &Tensor| -> Result<Tensor> {
            let (batch, n, dim) = dst.dims3()?;
            let row = src
                .narrow(0, 0, 1)?
                .narrow(1, reference_index, 1)?
                .broadcast_as((batch, 1, dim))?
                .contiguous()?;
            let mut parts = Vec::with_capacity(3);
            if target > 0 {
                parts.push(dst.narrow(1, 0, target)?);
            }
            parts.push(row);
            if target + 1 < n {
                parts.push(dst.narrow(1, target + 1, n - target - 1)?);
            }
            Ok(Tensor::cat(&parts, 1)?)
        };

        Ok(Self {
            scale_mu: splice(&self.scale_mu, &reference.scale_mu)?,
            scale_std: splice(&self.scale_std, &reference.scale_std)?,
            bias_mu: splice(&self.bias_mu, &reference.bias_mu)?,
            bias_std: splice(&self.bias_std, &reference.bias_std)?,
        })
    }

    /// Noise `(B, Ninst, 2, noise_nc)` as `mu + std * eps`
    ///
    /// `eps` is drawn fresh unless supplied, in which case its shape must match.
    pub fn sample_noise(&self, eps: Option<&Tensor>) -> Result<Tensor> {
        let mu = Tensor::stack(&[&self.scale_mu, &self.bias_mu], 2)?;
        let std = Tensor::stack(&[&self.scale_std, &self.bias_std], 2)?;
        let eps = match eps {
            Some(eps) => {
                if eps.dims() != mu.dims() {
                    return Err(SynthesisError::ShapeMismatch(format!(
                        "noise {:?} does not match latent {:?}",
                        eps.dims(),
                        mu.dims()
                    )));
                }
                eps.to_dtype(mu.dtype())?
            }
            None => mu.randn_like(0.0, 1.0)?,
        };
        Ok(((std * eps)? + mu)?)
    }
}

/// Latent code handed to the generator
#[derive(Debug, Clone)]
pub enum LatentCode {
    /// `(B, z_dim)`
    Image(Tensor),
    Instance(InstanceLatent),
}
