// Training objectives: adversarial, feature matching, perceptual and KL terms

use super::discriminator::DiscriminatorOutput;
use super::PerceptualExtractor;
use crate::config::GanMode;
use crate::error::Result;
use candle_core::{DType, Device, Tensor};

/// Weights of relu1_1 .. relu5_1 in the perceptual loss
pub const VGG_LAYER_WEIGHTS: [f64; 5] = [1.0 / 32.0, 1.0 / 16.0, 1.0 / 8.0, 1.0 / 4.0, 1.0];

fn l1(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    (a - b)?.abs()?.mean_all()
}

/// Numerically stable binary cross-entropy on logits against a constant target
fn bce_with_logits(x: &Tensor, target: f64) -> candle_core::Result<Tensor> {
    let softplus = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    ((x.relu()? - (x * target)?)? + softplus)?.mean_all()
}

/// Adversarial loss in one of the supported variants
///
/// Multi-scale predictions use the last tensor of each scale; per-scale losses
/// are averaged.
#[derive(Debug, Clone, Copy)]
pub struct GanLoss {
    mode: GanMode,
}

impl GanLoss {
    pub fn new(mode: GanMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> GanMode {
        self.mode
    }

    /// Loss of a single prediction tensor
    pub fn loss_single(
        &self,
        pred: &Tensor,
        target_is_real: bool,
        for_discriminator: bool,
    ) -> Result<Tensor> {
        let target = if target_is_real { 1.0 } else { 0.0 };
        let loss = match self.mode {
            GanMode::Original => bce_with_logits(pred, target)?,
            GanMode::Ls => candle_nn::loss::mse(pred, &pred.ones_like()?.affine(target, 0.0)?)?,
            GanMode::Hinge if for_discriminator => {
                if target_is_real {
                    pred.affine(-1.0, 1.0)?.relu()?.mean_all()?
                } else {
                    pred.affine(1.0, 1.0)?.relu()?.mean_all()?
                }
            }
            // The generator's hinge loss only pushes fakes towards real
            GanMode::Hinge => pred.mean_all()?.neg()?,
            GanMode::W if target_is_real => pred.mean_all()?.neg()?,
            GanMode::W => pred.mean_all()?,
        };
        Ok(loss)
    }

    pub fn loss(
        &self,
        pred: &DiscriminatorOutput,
        target_is_real: bool,
        for_discriminator: bool,
    ) -> Result<Tensor> {
        let predictions = pred.predictions();
        let count = predictions.len().max(1) as f64;
        let mut total: Option<Tensor> = None;
        for p in predictions {
            let l = self.loss_single(p, target_is_real, for_discriminator)?;
            total = Some(match total {
                Some(t) => (t + l)?,
                None => l,
            });
        }
        match total {
            Some(t) => Ok((t / count)?),
            None => Ok(Tensor::zeros((), DType::F32, &Device::Cpu)?),
        }
    }

    /// Generator-side loss on predictions for fake images
    pub fn generator(&self, pred_fake: &DiscriminatorOutput) -> Result<Tensor> {
        self.loss(pred_fake, true, false)
    }

    /// Discriminator-side loss
    pub fn discriminator(&self, pred: &DiscriminatorOutput, target_is_real: bool) -> Result<Tensor> {
        self.loss(pred, target_is_real, true)
    }
}

/// KL divergence of `N(mu, exp(logvar))` from the standard normal, summed
pub fn kld_loss(mu: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    let inner = ((logvar.affine(1.0, 1.0)? - mu.sqr()?)? - logvar.exp()?)?;
    Ok((inner.sum_all()? * -0.5)?)
}

/// L1 distance of intermediate discriminator activations, fake against detached real
///
/// The prediction layer of every scale is excluded, as are layers with index
/// below `first_layer`. Each term is scaled by `lambda / num_scales`.
/// Returns `None` for single-tensor outputs, which carry no intermediate layers.
pub fn feature_matching_loss(
    pred_fake: &DiscriminatorOutput,
    pred_real: &DiscriminatorOutput,
    lambda: f64,
    first_layer: usize,
) -> Result<Option<Tensor>> {
    let (fake, real) = match (pred_fake, pred_real) {
        (DiscriminatorOutput::Scales(f), DiscriminatorOutput::Scales(r)) => (f, r),
        _ => return Ok(None),
    };
    let num_d = fake.len().max(1) as f64;
    let mut total: Option<Tensor> = None;
    for (fake_layers, real_layers) in fake.iter().zip(real) {
        let intermediate = fake_layers.len().saturating_sub(1);
        for j in first_layer..intermediate {
            let term = (l1(&fake_layers[j], &real_layers[j].detach())? * (lambda / num_d))?;
            total = Some(match total {
                Some(t) => (t + term)?,
                None => term,
            });
        }
    }
    match total {
        Some(t) => Ok(Some(t)),
        None => {
            let device = fake
                .first()
                .and_then(|layers| layers.first())
                .map(|t| t.device().clone())
                .unwrap_or(Device::Cpu);
            Ok(Some(Tensor::zeros((), DType::F32, &device)?))
        }
    }
}

/// Weighted L1 distance between feature-network activations
pub struct VggLoss {
    extractor: Box<dyn PerceptualExtractor>,
    weights: Vec<f64>,
}

impl VggLoss {
    pub fn new(extractor: Box<dyn PerceptualExtractor>) -> Self {
        Self {
            extractor,
            weights: VGG_LAYER_WEIGHTS.to_vec(),
        }
    }

    pub fn forward(&self, fake: &Tensor, real: &Tensor) -> Result<Tensor> {
        let fake_features = self.extractor.features(fake)?;
        let real_features = self.extractor.features(real)?;
        let mut total: Option<Tensor> = None;
        for ((f, r), w) in fake_features
            .iter()
            .zip(real_features.iter())
            .zip(self.weights.iter())
        {
            let term = (l1(f, &r.detach())? * *w)?;
            total = Some(match total {
                Some(t) => (t + term)?,
                None => term,
            });
        }
        match total {
            Some(t) => Ok(t),
            None => Ok(Tensor::zeros((), DType::F32, fake.device())?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_hinge_losses() {
        let device = Device::Cpu;
        let pred = DiscriminatorOutput::Final(Tensor::new(&[2f32, -0.5], &device).unwrap());
        let loss = GanLoss::new(GanMode::Hinge);
        // relu(1 - x): [0, 1.5]
        assert!((scalar(&loss.discriminator(&pred, true).unwrap()) - 0.75).abs() < 1e-6);
        // relu(1 + x): [3, 0.5]
        assert!((scalar(&loss.discriminator(&pred, false).unwrap()) - 1.75).abs() < 1e-6);
        assert!((scalar(&loss.generator(&pred).unwrap()) + 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_original_and_ls_losses() {
        let device = Device::Cpu;
        let pred = DiscriminatorOutput::Final(Tensor::new(&[0f32, 0.0], &device).unwrap());
        let bce = GanLoss::new(GanMode::Original).discriminator(&pred, true).unwrap();
        assert!((scalar(&bce) - std::f32::consts::LN_2).abs() < 1e-5);

        let ls = GanLoss::new(GanMode::Ls).discriminator(&pred, true).unwrap();
        assert!((scalar(&ls) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_multiscale_average() {
        let device = Device::Cpu;
        let scale = |v: f32| {
            vec![
                Tensor::new(&[100f32], &device).unwrap(),
                Tensor::new(&[v], &device).unwrap(),
            ]
        };
        let pred = DiscriminatorOutput::Scales(vec![scale(1.0), scale(3.0)]);
        let w = GanLoss::new(GanMode::W).discriminator(&pred, false).unwrap();
        assert!((scalar(&w) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_kld_standard_normal_is_zero() {
        let device = Device::Cpu;
        let mu = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        let logvar = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        assert!(scalar(&kld_loss(&mu, &logvar).unwrap()).abs() < 1e-6);

        let mu = Tensor::ones((1, 2), DType::F32, &device).unwrap();
        let logvar = Tensor::zeros((1, 2), DType::F32, &device).unwrap();
        // -0.5 * sum(1 + 0 - 1 - 1) over two entries
        assert!((scalar(&kld_loss(&mu, &logvar).unwrap()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_feature_matching_cutoff() {
        let device = Device::Cpu;
        let layers = |offset: f32| -> Vec<Tensor> {
            (0..5)
                .map(|j| Tensor::new(&[offset * j as f32], &device).unwrap())
                .collect()
        };
        let fake = DiscriminatorOutput::Scales(vec![layers(0.0), layers(0.0)]);
        let real = DiscriminatorOutput::Scales(vec![layers(1.0), layers(1.0)]);

        // all intermediate layers: 2 scales * (0 + 1 + 2 + 3) * 10 / 2
        let all = feature_matching_loss(&fake, &real, 10.0, 0).unwrap().unwrap();
        assert!((scalar(&all) - 60.0).abs() < 1e-4);

        // from layer 3 on only layer 3 remains: 2 * 3 * 10 / 2
        let late = feature_matching_loss(&fake, &real, 10.0, 3).unwrap().unwrap();
        assert!((scalar(&late) - 30.0).abs() < 1e-4);
    }
}
