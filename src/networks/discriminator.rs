// Multi-scale PatchGAN discriminator
// Each scale returns every intermediate activation so the generator can use
// them for feature matching

use super::layers::{leaky_relu, Conv2dLayer, NormedConv2d};
use super::Discriminator;
use crate::config::{LayerNormConfig, ModelConfig};
use crate::error::{Result, SynthesisError};
use candle_core::Tensor;
use candle_nn::{Conv2dConfig, VarBuilder};

const KERNEL_SIZE: usize = 4;
const PADDING: usize = 2;
const MAX_WIDTH: usize = 512;
const SLOPE: f64 = 0.2;

/// Discriminator predictions
#[derive(Debug, Clone)]
pub enum DiscriminatorOutput {
    /// Per scale, per layer activations; the last tensor of each scale is the prediction
    Scales(Vec<Vec<Tensor>>),
    /// A single prediction tensor
    Final(Tensor),
}

impl DiscriminatorOutput {
    /// Split a prediction over a `fake; real` batch into its two halves
    pub fn split_batch(&self) -> Result<(Self, Self)> {
        let halves = |t: &Tensor| -> Result<(Tensor, Tensor)> {
            let n = t.dim(0)?;
            if n % 2 != 0 {
                return Err(SynthesisError::ShapeMismatch(format!(
                    "cannot split odd batch of {n} into fake and real halves"
                )));
            }
            Ok((t.narrow(0, 0, n / 2)?, t.narrow(0, n / 2, n / 2)?))
        };

        match self {
            DiscriminatorOutput::Scales(scales) => {
                let mut fake = Vec::with_capacity(scales.len());
                let mut real = Vec::with_capacity(scales.len());
                for layers in scales {
                    let (f, r): (Vec<_>, Vec<_>) = layers
                        .iter()
                        .map(halves)
                        .collect::<Result<Vec<_>>>()?
                        .into_iter()
                        .unzip();
                    fake.push(f);
                    real.push(r);
                }
                Ok((
                    DiscriminatorOutput::Scales(fake),
                    DiscriminatorOutput::Scales(real),
                ))
            }
            DiscriminatorOutput::Final(t) => {
                let (f, r) = halves(t)?;
                Ok((DiscriminatorOutput::Final(f), DiscriminatorOutput::Final(r)))
            }
        }
    }

    /// Final prediction of every scale
    pub fn predictions(&self) -> Vec<&Tensor> {
        match self {
            DiscriminatorOutput::Scales(scales) => {
                scales.iter().filter_map(|layers| layers.last()).collect()
            }
            DiscriminatorOutput::Final(t) => vec![t],
        }
    }
}

/// PatchGAN with `n_layers` strided convolutions
pub struct NLayerDiscriminator {
    first: Conv2dLayer,
    middle: Vec<NormedConv2d>,
    last: Conv2dLayer,
}

impl NLayerDiscriminator {
    pub fn new(
        vb: VarBuilder,
        input_nc: usize,
        ndf: usize,
        n_layers: usize,
        norm: &LayerNormConfig,
        power_iterations: usize,
    ) -> Result<Self> {
        let strided = Conv2dConfig {
            padding: PADDING,
            stride: 2,
            ..Default::default()
        };
        let first = Conv2dLayer::new(
            input_nc,
            ndf,
            KERNEL_SIZE,
            strided,
            true,
            None,
            vb.pp("model0"),
        )?;

        let mut nf = ndf;
        let mut middle = Vec::with_capacity(n_layers.saturating_sub(1));
        for n in 1..n_layers {
            let nf_prev = nf;
            nf = (nf * 2).min(MAX_WIDTH);
            let stride = if n == n_layers - 1 { 1 } else { 2 };
            middle.push(NormedConv2d::new(
                nf_prev,
                nf,
                KERNEL_SIZE,
                Conv2dConfig {
                    padding: PADDING,
                    stride,
                    ..Default::default()
                },
                norm,
                power_iterations,
                vb.pp(format!("model{n}")),
            )?);
        }

        let last = Conv2dLayer::new(
            nf,
            1,
            KERNEL_SIZE,
            Conv2dConfig {
                padding: PADDING,
                ..Default::default()
            },
            true,
            None,
            vb.pp(format!("model{n_layers}")),
        )?;

        Ok(Self { first, middle, last })
    }

    /// All `n_layers + 1` activations, the last being the patch prediction
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let mut outputs = Vec::with_capacity(self.middle.len() + 2);
        let mut h = leaky_relu(&self.first.forward_t(x, train)?, SLOPE)?;
        outputs.push(h.clone());
        for layer in &self.middle {
            h = leaky_relu(&layer.forward_t(&h, train)?, SLOPE)?;
            outputs.push(h.clone());
        }
        outputs.push(self.last.forward_t(&h, train)?);
        Ok(outputs)
    }
}

/// 3x3 average pool with stride 2 and padding 1, not counting padded cells
pub fn downsample(x: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let padded = x.pad_with_zeros(2, 1, 1)?.pad_with_zeros(3, 1, 1)?;
    let ones = Tensor::ones((1, 1, h, w), x.dtype(), x.device())?
        .pad_with_zeros(2, 1, 1)?
        .pad_with_zeros(3, 1, 1)?;
    let sums = padded.avg_pool2d_with_stride((3, 3), (2, 2))?;
    let counts = ones.avg_pool2d_with_stride((3, 3), (2, 2))?;
    Ok(sums.broadcast_div(&counts)?)
}

/// `num_d` discriminators applied to successively halved inputs
pub struct MultiscaleDiscriminator {
    scales: Vec<NLayerDiscriminator>,
}

impl MultiscaleDiscriminator {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let norm = config.discriminator_norm()?;
        let input_nc = config.semantic_nc() + 3;
        let scales = (0..config.num_d)
            .map(|i| {
                NLayerDiscriminator::new(
                    vb.pp(format!("discriminator_{i}")),
                    input_nc,
                    config.ndf,
                    config.n_layers_d,
                    &norm,
                    config.spectral_power_iterations,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { scales })
    }
}

impl Discriminator for MultiscaleDiscriminator {
    fn discriminate(&self, input: &Tensor, train: bool) -> Result<DiscriminatorOutput> {
        let mut outputs = Vec::with_capacity(self.scales.len());
        let mut x = input.clone();
        for (i, scale) in self.scales.iter().enumerate() {
            outputs.push(scale.forward_t(&x, train)?);
            if i + 1 < self.scales.len() {
                x = downsample(&x)?;
            }
        }
        Ok(DiscriminatorOutput::Scales(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_downsample_excludes_padding() {
        let device = Device::Cpu;
        let x = Tensor::ones((1, 2, 5, 5), DType::F32, &device).unwrap();
        let y = downsample(&x).unwrap();
        assert_eq!(y.dims(), &[1, 2, 3, 3]);
        for v in y.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_multiscale_layer_counts() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ModelConfig::default()
            .with_label_nc(2)
            .with_dontcare_label(false)
            .with_widths(4, 4);
        let d = MultiscaleDiscriminator::new(vb, &config).unwrap();

        let x = Tensor::randn(0f32, 1.0, &[2, config.semantic_nc() + 3, 32, 32], &device).unwrap();
        let out = d.discriminate(&x, true).unwrap();
        match &out {
            DiscriminatorOutput::Scales(scales) => {
                assert_eq!(scales.len(), 2);
                for layers in scales {
                    assert_eq!(layers.len(), config.n_layers_d + 1);
                    assert_eq!(layers.last().unwrap().dim(1).unwrap(), 1);
                }
            }
            DiscriminatorOutput::Final(_) => panic!("expected multi-scale output"),
        }

        let (fake, real) = out.split_batch().unwrap();
        assert_eq!(fake.predictions()[0].dim(0).unwrap(), 1);
        assert_eq!(real.predictions()[1].dim(0).unwrap(), 1);
    }

    #[test]
    fn test_split_rejects_odd_batch() {
        let device = Device::Cpu;
        let out = DiscriminatorOutput::Final(Tensor::zeros((3, 1), DType::F32, &device).unwrap());
        assert!(out.split_batch().is_err());
    }
}
