// Residual block with conditional normalization, and the VGG19 feature
// extractor behind the perceptual loss

use super::layers::{leaky_relu, Conv2dLayer};
use super::normalization::{
    ConditionalNorm, ConditionalNormConfig, ConditionalNormalization, Conditioning,
};
use super::PerceptualExtractor;
use crate::error::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use std::path::Path;
use tracing::debug;

/// ResNet block driven by conditional normalization
///
/// Each stage runs normalize, activate, convolve. A learned 1x1 shortcut is
/// added when the input and output widths differ.
pub struct SpadeResnetBlock {
    conv_0: Conv2dLayer,
    conv_1: Conv2dLayer,
    conv_s: Option<Conv2dLayer>,
    norm_0: ConditionalNorm,
    norm_1: ConditionalNorm,
    norm_s: Option<ConditionalNorm>,
    leaky_slope: f64,
}

impl SpadeResnetBlock {
    pub fn new(
        vb: VarBuilder,
        fin: usize,
        fout: usize,
        norm: &ConditionalNormConfig,
        leaky_slope: f64,
        power_iterations: usize,
    ) -> Result<Self> {
        let learned_shortcut = fin != fout;
        let fmiddle = fin.min(fout);
        let spectral = norm.norm.spectral.then_some(power_iterations);
        let conv_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let conv_0 = Conv2dLayer::new(fin, fmiddle, 3, conv_config, true, spectral, vb.pp("conv_0"))?;
        let conv_1 = Conv2dLayer::new(fmiddle, fout, 3, conv_config, true, spectral, vb.pp("conv_1"))?;
        let norm_0 = ConditionalNorm::new(vb.pp("norm_0"), fin, norm)?;
        let norm_1 = ConditionalNorm::new(vb.pp("norm_1"), fmiddle, norm)?;

        let (conv_s, norm_s) = if learned_shortcut {
            (
                Some(Conv2dLayer::new(
                    fin,
                    fout,
                    1,
                    Conv2dConfig::default(),
                    false,
                    spectral,
                    vb.pp("conv_s"),
                )?),
                Some(ConditionalNorm::new(vb.pp("norm_s"), fin, norm)?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            conv_0,
            conv_1,
            conv_s,
            norm_0,
            norm_1,
            norm_s,
            leaky_slope,
        })
    }

    pub fn forward(&self, x: &Tensor, cond: &Conditioning<'_>, train: bool) -> Result<Tensor> {
        let x_s = match (&self.conv_s, &self.norm_s) {
            (Some(conv), Some(norm)) => conv.forward_t(&norm.apply(x, cond, train)?, train)?,
            _ => x.clone(),
        };

        let dx = self.norm_0.apply(x, cond, train)?;
        let dx = self.conv_0.forward_t(&leaky_relu(&dx, self.leaky_slope)?, train)?;
        let dx = self.norm_1.apply(&dx, cond, train)?;
        let dx = self.conv_1.forward_t(&leaky_relu(&dx, self.leaky_slope)?, train)?;

        Ok((x_s + dx)?)
    }

    pub fn has_learned_shortcut(&self) -> bool {
        self.conv_s.is_some()
    }
}

enum VggLayer {
    Conv(Conv2d),
    Relu,
    MaxPool,
}

// Channel plan of torchvision's vgg19().features up to relu5_1; `None` marks a max pool
const VGG19_PLAN: [Option<usize>; 17] = [
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
];

// Exclusive layer indices closing relu1_1, relu2_1, relu3_1, relu4_1, relu5_1
const VGG19_SLICES: [usize; 5] = [2, 7, 12, 21, 30];

/// VGG19 convolutional trunk returning relu1_1 through relu5_1
///
/// Parameters are stored under `features.<idx>.{weight,bias}` using the
/// torchvision layer indices, so converted ImageNet weights load directly.
pub struct Vgg19 {
    layers: Vec<VggLayer>,
}

impl Vgg19 {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let conv_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut layers = Vec::with_capacity(VGG19_SLICES[4]);
        let mut in_channels = 3;
        for entry in VGG19_PLAN {
            match entry {
                Some(out_channels) => {
                    let idx = layers.len();
                    layers.push(VggLayer::Conv(conv2d(
                        in_channels,
                        out_channels,
                        3,
                        conv_config,
                        vb.pp(format!("features.{idx}")),
                    )?));
                    layers.push(VggLayer::Relu);
                    in_channels = out_channels;
                }
                None => layers.push(VggLayer::MaxPool),
            }
        }
        Ok(Self { layers })
    }

    /// Load pretrained weights from a safetensors file
    pub fn from_safetensors<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading VGG19 weights");
        let tensors = candle_core::safetensors::load(path, device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(vb)
    }
}

impl PerceptualExtractor for Vgg19 {
    fn features(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        let mut outputs = Vec::with_capacity(VGG19_SLICES.len());
        let mut h = x.clone();
        let mut slice = 0;
        for (idx, layer) in self.layers.iter().enumerate() {
            h = match layer {
                VggLayer::Conv(conv) => conv.forward(&h)?,
                VggLayer::Relu => h.relu()?,
                VggLayer::MaxPool => h.max_pool2d(2)?,
            };
            if idx + 1 == VGG19_SLICES[slice] {
                outputs.push(h.clone());
                slice += 1;
                if slice == VGG19_SLICES.len() {
                    break;
                }
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, NormMode, SpadeNormConfig};
    use candle_nn::VarMap;

    fn norm_config(mode: NormMode) -> ConditionalNormConfig {
        let config = ModelConfig::default()
            .with_norm_mode(mode)
            .with_label_nc(3)
            .with_dontcare_label(false)
            .with_hidden_dim(16)
            .with_latent_dims(8, 4);
        let norm = SpadeNormConfig::parse("spectralspadeinstance3x3").unwrap();
        ConditionalNormConfig::from_model(&config, norm)
    }

    #[test]
    fn test_resblock_learned_shortcut() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = norm_config(NormMode::Spade);

        let block = SpadeResnetBlock::new(vb.pp("b"), 16, 8, &cfg, 0.2, 1).unwrap();
        assert!(block.has_learned_shortcut());

        let x = Tensor::randn(0f32, 1.0, &[2, 16, 8, 8], &device).unwrap();
        let seg = Tensor::zeros(&[2, cfg.semantic_nc, 16, 16], DType::F32, &device).unwrap();
        let out = block.forward(&x, &Conditioning::semantic(&seg), true).unwrap();
        assert_eq!(out.dims(), &[2, 8, 8, 8]);

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"b.conv_s.weight_u".to_string()));
        assert!(!names.contains(&"b.conv_s.bias".to_string()));
    }

    #[test]
    fn test_resblock_identity_shortcut_with_instances() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = norm_config(NormMode::Inade);

        let block = SpadeResnetBlock::new(vb, 8, 8, &cfg, 0.2, 1).unwrap();
        assert!(!block.has_learned_shortcut());

        let x = Tensor::randn(0f32, 1.0, &[1, 8, 4, 4], &device).unwrap();
        let seg = Tensor::ones(&[1, cfg.semantic_nc, 4, 4], DType::F32, &device).unwrap();
        let inst = Tensor::ones(&[1, 1, 4, 4], DType::F32, &device).unwrap();
        let noise = Tensor::randn(0f32, 1.0, &[1, 1, 2, 4], &device).unwrap();
        let cond = Conditioning::semantic(&seg).with_instances(&inst, &noise);
        assert_eq!(block.forward(&x, &cond, true).unwrap().dims(), &[1, 8, 4, 4]);
    }

    #[test]
    fn test_vgg_slices() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let vgg = Vgg19::new(vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, &[1, 3, 32, 32], &device).unwrap();
        let features = vgg.features(&x).unwrap();
        let shapes: Vec<Vec<usize>> = features.iter().map(|f| f.dims().to_vec()).collect();
        assert_eq!(
            shapes,
            vec![
                vec![1, 64, 32, 32],
                vec![1, 128, 16, 16],
                vec![1, 256, 8, 8],
                vec![1, 512, 4, 4],
                vec![1, 512, 2, 2],
            ]
        );
        assert!(varmap
            .data()
            .lock()
            .unwrap()
            .contains_key("features.28.weight"));
    }
}
