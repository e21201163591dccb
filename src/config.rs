//! Configuration for the synthesis model
//!
//! Option strings such as `spectralspadesyncbatch3x3` are parsed once, when a
//! model is built, into structured records ([`SpadeNormConfig`],
//! [`LayerNormConfig`]). Networks only ever see the structured form.

use crate::device::DevicePreference;
use crate::error::{Result, SynthesisError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Trait for validatable configurations
pub trait Validatable {
    /// Validate this configuration
    fn validate(&self) -> Result<()>;
}

/// Which conditional normalization the generator uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NormMode {
    /// Class-conditioned, per-pixel modulation from the semantic map
    Spade,
    /// Instance-adaptive modulation with per-instance noise
    Inade,
}

impl FromStr for NormMode {
    type Err = SynthesisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spade" => Ok(NormMode::Spade),
            "inade" => Ok(NormMode::Inade),
            _ => Err(SynthesisError::UnknownNormMode(s.to_string())),
        }
    }
}

impl fmt::Display for NormMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormMode::Spade => write!(f, "spade"),
            NormMode::Inade => write!(f, "inade"),
        }
    }
}

impl TryFrom<String> for NormMode {
    type Error = SynthesisError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<NormMode> for String {
    fn from(mode: NormMode) -> Self {
        mode.to_string()
    }
}

/// Parameter-free normalization applied before conditional modulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamFreeNormKind {
    Instance,
    Batch,
    /// Synchronized batch norm; identical to `Batch` on a single process
    SyncBatch,
}

impl FromStr for ParamFreeNormKind {
    type Err = SynthesisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "instance" => Ok(ParamFreeNormKind::Instance),
            "batch" => Ok(ParamFreeNormKind::Batch),
            "syncbatch" => Ok(ParamFreeNormKind::SyncBatch),
            _ => Err(SynthesisError::UnknownParamFreeNorm(s.to_string())),
        }
    }
}

/// Structured form of a `[spectral]spade<type><k>x<k>` string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpadeNormConfig {
    pub param_free: ParamFreeNormKind,
    pub kernel_size: usize,
    /// Whether convolutions next to the normalization are spectrally normalized
    pub spectral: bool,
}

impl SpadeNormConfig {
    /// Parse a generator normalization string
    ///
    /// ```rust
    /// use inade::config::{ParamFreeNormKind, SpadeNormConfig};
    ///
    /// let cfg = SpadeNormConfig::parse("spectralspadesyncbatch3x3").unwrap();
    /// assert!(cfg.spectral);
    /// assert_eq!(cfg.param_free, ParamFreeNormKind::SyncBatch);
    /// assert_eq!(cfg.kernel_size, 3);
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let malformed = || SynthesisError::MalformedSpadeConfig(text.to_string());

        let (spectral, rest) = match text.strip_prefix("spectral") {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let rest = rest.strip_prefix("spade").ok_or_else(malformed)?;

        let digits_at = rest
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(malformed)?;
        let (kind, kernel) = rest.split_at(digits_at);
        if kind.is_empty() {
            return Err(malformed());
        }

        let (k1, k2) = kernel.split_once('x').ok_or_else(malformed)?;
        let parse_k = |k: &str| -> Result<usize> {
            if k.is_empty() || !k.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            k.parse::<usize>().map_err(|_| malformed())
        };
        let kernel_size = parse_k(k1)?;
        if kernel_size == 0 || parse_k(k2)? != kernel_size {
            return Err(malformed());
        }

        Ok(Self {
            param_free: kind.parse()?,
            kernel_size,
            spectral,
        })
    }
}

/// Parameter-free norm following a plain convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlainNormKind {
    Instance,
    Batch,
    SyncBatch,
}

/// Structured form of a `[spectral]<kind>` string used by the discriminator and encoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerNormConfig {
    pub spectral: bool,
    /// `None` means the convolution is used as-is (keeping its bias)
    pub kind: Option<PlainNormKind>,
}

impl LayerNormConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let (spectral, rest) = match text.strip_prefix("spectral") {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let kind = match rest {
            "" | "none" => None,
            "instance" => Some(PlainNormKind::Instance),
            "batch" => Some(PlainNormKind::Batch),
            "sync_batch" | "syncbatch" => Some(PlainNormKind::SyncBatch),
            other => return Err(SynthesisError::UnknownLayerNorm(other.to_string())),
        };
        Ok(Self { spectral, kind })
    }
}

/// Adversarial loss variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GanMode {
    Hinge,
    /// Binary cross-entropy on logits
    Original,
    /// Least squares
    Ls,
    /// Wasserstein
    W,
}

impl FromStr for GanMode {
    type Err = SynthesisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hinge" => Ok(GanMode::Hinge),
            "original" => Ok(GanMode::Original),
            "ls" => Ok(GanMode::Ls),
            "w" => Ok(GanMode::W),
            _ => Err(SynthesisError::UnknownGanMode(s.to_string())),
        }
    }
}

impl fmt::Display for GanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GanMode::Hinge => "hinge",
            GanMode::Original => "original",
            GanMode::Ls => "ls",
            GanMode::W => "w",
        };
        f.write_str(name)
    }
}

impl TryFrom<String> for GanMode {
    type Error = SynthesisError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<GanMode> for String {
    fn from(mode: GanMode) -> Self {
        mode.to_string()
    }
}

/// How many 2x upsampling stages the generator uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsamplingLayers {
    Normal,
    More,
    Most,
}

impl UpsamplingLayers {
    pub fn count(&self) -> usize {
        match self {
            UpsamplingLayers::Normal => 5,
            UpsamplingLayers::More => 6,
            UpsamplingLayers::Most => 7,
        }
    }
}

/// Main model configuration
///
/// # Example
///
/// ```rust
/// use inade::config::{ModelConfig, NormMode, Validatable};
///
/// let config = ModelConfig::default()
///     .with_norm_mode(NormMode::Inade)
///     .with_label_nc(3)
///     .with_crop_size(64)
///     .with_vgg_loss(false);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.semantic_nc(), 5); // 3 classes + don't-care + edge channel
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub norm_mode: NormMode,
    /// Generator norm string, e.g. `spectralspadesyncbatch3x3`
    pub norm_g: String,
    /// Discriminator norm string, e.g. `spectralinstance`
    pub norm_d: String,
    /// Encoder norm string
    pub norm_e: String,
    /// Number of semantic classes, excluding the don't-care class
    pub label_nc: usize,
    pub contain_dontcare_label: bool,
    /// Disables the instance edge channel appended to the semantic map
    pub no_instance: bool,
    pub add_sketch: bool,
    pub use_vae: bool,
    pub z_dim: usize,
    /// Width of the per-instance noise vectors
    pub noise_nc: usize,
    pub ngf: usize,
    pub ndf: usize,
    pub num_d: usize,
    pub n_layers_d: usize,
    pub num_upsampling_layers: UpsamplingLayers,
    pub crop_size: usize,
    pub aspect_ratio: f64,
    /// Images are resized to this square size before the encoders
    pub encoder_input_size: usize,
    pub lambda_feat: f64,
    pub lambda_vgg: f64,
    pub lambda_kld: f64,
    pub no_gan_feat_loss: bool,
    pub no_vgg_loss: bool,
    pub gan_mode: GanMode,
    pub use_amp: bool,
    pub is_train: bool,
    pub device: DevicePreference,
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub no_ttur: bool,
    /// Width of the SPADE embedding space
    pub hidden_dim: usize,
    /// Negative slope of the leaky rectifiers in residual blocks
    pub leaky_slope: f64,
    pub spectral_power_iterations: usize,
    /// Safetensors file with VGG19 `features.<idx>` weights for the perceptual loss
    pub vgg_weights: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            norm_mode: NormMode::Spade,
            norm_g: "spectralspadesyncbatch3x3".to_string(),
            norm_d: "spectralinstance".to_string(),
            norm_e: "spectralinstance".to_string(),
            label_nc: 4,
            contain_dontcare_label: true,
            no_instance: false,
            add_sketch: false,
            use_vae: false,
            z_dim: 256,
            noise_nc: 64,
            ngf: 64,
            ndf: 64,
            num_d: 2,
            n_layers_d: 4,
            num_upsampling_layers: UpsamplingLayers::Normal,
            crop_size: 256,
            aspect_ratio: 1.0,
            encoder_input_size: 256,
            lambda_feat: 10.0,
            lambda_vgg: 10.0,
            lambda_kld: 0.05,
            no_gan_feat_loss: false,
            no_vgg_loss: false,
            gan_mode: GanMode::Hinge,
            use_amp: false,
            is_train: true,
            device: DevicePreference::Cpu,
            lr: 0.0002,
            beta1: 0.0,
            beta2: 0.9,
            no_ttur: false,
            hidden_dim: 128,
            leaky_slope: 0.2,
            spectral_power_iterations: 1,
            vgg_weights: None,
        }
    }
}

impl ModelConfig {
    /// Load a configuration from a JSON file; missing fields take their defaults
    ///
    /// Unknown mode names come back as their typed configuration errors
    /// rather than as JSON errors.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if let Some(mode) = value.get("norm_mode").and_then(|v| v.as_str()) {
            mode.parse::<NormMode>()?;
        }
        if let Some(mode) = value.get("gan_mode").and_then(|v| v.as_str()) {
            mode.parse::<GanMode>()?;
        }
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as pretty-printed JSON
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Class channels of the one-hot label map (with the don't-care class)
    pub fn class_nc(&self) -> usize {
        self.label_nc + usize::from(self.contain_dontcare_label)
    }

    /// Channels of the full semantic map fed to the networks
    pub fn semantic_nc(&self) -> usize {
        self.class_nc() + usize::from(!self.no_instance)
    }

    pub fn generator_norm(&self) -> Result<SpadeNormConfig> {
        SpadeNormConfig::parse(&self.norm_g)
    }

    pub fn discriminator_norm(&self) -> Result<LayerNormConfig> {
        LayerNormConfig::parse(&self.norm_d)
    }

    pub fn encoder_norm(&self) -> Result<LayerNormConfig> {
        LayerNormConfig::parse(&self.norm_e)
    }

    /// Spatial size `(height, width)` of the generator's first feature map
    pub fn latent_grid(&self) -> (usize, usize) {
        let sw = self.crop_size >> self.num_upsampling_layers.count();
        let sh = (sw as f64 / self.aspect_ratio).round() as usize;
        (sh, sw)
    }

    pub fn with_norm_mode(mut self, mode: NormMode) -> Self {
        self.norm_mode = mode;
        self
    }

    pub fn with_norm_g(mut self, norm_g: &str) -> Self {
        self.norm_g = norm_g.to_string();
        self
    }

    pub fn with_norm_d(mut self, norm_d: &str) -> Self {
        self.norm_d = norm_d.to_string();
        self
    }

    pub fn with_norm_e(mut self, norm_e: &str) -> Self {
        self.norm_e = norm_e.to_string();
        self
    }

    pub fn with_label_nc(mut self, label_nc: usize) -> Self {
        self.label_nc = label_nc;
        self
    }

    pub fn with_dontcare_label(mut self, enabled: bool) -> Self {
        self.contain_dontcare_label = enabled;
        self
    }

    pub fn with_instance_edges(mut self, enabled: bool) -> Self {
        self.no_instance = !enabled;
        self
    }

    pub fn with_sketch(mut self, enabled: bool) -> Self {
        self.add_sketch = enabled;
        self
    }

    pub fn with_vae(mut self, enabled: bool) -> Self {
        self.use_vae = enabled;
        self
    }

    pub fn with_vgg_loss(mut self, enabled: bool) -> Self {
        self.no_vgg_loss = !enabled;
        self
    }

    pub fn with_feat_loss(mut self, enabled: bool) -> Self {
        self.no_gan_feat_loss = !enabled;
        self
    }

    pub fn with_crop_size(mut self, crop_size: usize) -> Self {
        self.crop_size = crop_size;
        self
    }

    /// Set generator and discriminator base widths
    pub fn with_widths(mut self, ngf: usize, ndf: usize) -> Self {
        self.ngf = ngf;
        self.ndf = ndf;
        self
    }

    pub fn with_hidden_dim(mut self, hidden_dim: usize) -> Self {
        self.hidden_dim = hidden_dim;
        self
    }

    pub fn with_latent_dims(mut self, z_dim: usize, noise_nc: usize) -> Self {
        self.z_dim = z_dim;
        self.noise_nc = noise_nc;
        self
    }

    pub fn with_encoder_input_size(mut self, size: usize) -> Self {
        self.encoder_input_size = size;
        self
    }

    pub fn with_gan_mode(mut self, gan_mode: GanMode) -> Self {
        self.gan_mode = gan_mode;
        self
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    pub fn with_train(mut self, is_train: bool) -> Self {
        self.is_train = is_train;
        self
    }
}

impl Validatable for ModelConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SynthesisError::InvalidConfig(msg));

        self.generator_norm()?;
        self.discriminator_norm()?;
        self.encoder_norm()?;

        if self.label_nc == 0 {
            return invalid("label_nc must be positive".to_string());
        }
        if !(self.aspect_ratio.is_finite() && self.aspect_ratio > 0.0) {
            return invalid(format!("aspect_ratio must be positive, got {}", self.aspect_ratio));
        }
        let (sh, sw) = self.latent_grid();
        if sh == 0 || sw == 0 {
            return invalid(format!(
                "crop_size {} is too small for {} upsampling layers",
                self.crop_size,
                self.num_upsampling_layers.count()
            ));
        }
        if self.ngf < 2 || self.ndf == 0 {
            return invalid(format!("ngf/ndf too small: {}/{}", self.ngf, self.ndf));
        }
        if self.num_d == 0 || self.n_layers_d == 0 {
            return invalid("num_d and n_layers_d must be positive".to_string());
        }
        if self.hidden_dim == 0 {
            return invalid("hidden_dim must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.leaky_slope) {
            return invalid(format!("leaky_slope must be in [0, 1), got {}", self.leaky_slope));
        }
        if self.use_vae && self.z_dim == 0 {
            return invalid("z_dim must be positive when use_vae is set".to_string());
        }
        if self.norm_mode == NormMode::Inade && self.noise_nc == 0 {
            return invalid("noise_nc must be positive in inade mode".to_string());
        }
        if self.encoder_input_size == 0 {
            return invalid("encoder_input_size must be positive".to_string());
        }
        for (name, value) in [
            ("lambda_feat", self.lambda_feat),
            ("lambda_vgg", self.lambda_vgg),
            ("lambda_kld", self.lambda_kld),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("{name} must be non-negative, got {value}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spade_strings() {
        let cfg = SpadeNormConfig::parse("spadeinstance3x3").unwrap();
        assert_eq!(cfg.param_free, ParamFreeNormKind::Instance);
        assert_eq!(cfg.kernel_size, 3);
        assert!(!cfg.spectral);

        let cfg = SpadeNormConfig::parse("spadebatch5x5").unwrap();
        assert_eq!(cfg.param_free, ParamFreeNormKind::Batch);
        assert_eq!(cfg.kernel_size, 5);
    }

    #[test]
    fn test_parse_spade_rejects_malformed() {
        for text in ["instance3x3", "spade3x3", "spadeinstance", "spadeinstance3x", "spadeinstance3x5", "spadeinstance0x0"] {
            let err = SpadeNormConfig::parse(text).unwrap_err();
            assert!(
                matches!(err, SynthesisError::MalformedSpadeConfig(_)),
                "{text}: {err}"
            );
        }
    }

    #[test]
    fn test_parse_spade_rejects_unknown_norm() {
        let err = SpadeNormConfig::parse("spadegroup3x3").unwrap_err();
        assert!(matches!(err, SynthesisError::UnknownParamFreeNorm(ref k) if k == "group"));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_parse_layer_norm() {
        let cfg = LayerNormConfig::parse("spectralinstance").unwrap();
        assert!(cfg.spectral);
        assert_eq!(cfg.kind, Some(PlainNormKind::Instance));

        let cfg = LayerNormConfig::parse("spectralnone").unwrap();
        assert_eq!(cfg.kind, None);
        assert!(LayerNormConfig::parse("spectrallayer").is_err());
    }

    #[test]
    fn test_norm_mode_parse() {
        assert_eq!("spade".parse::<NormMode>().unwrap(), NormMode::Spade);
        assert_eq!("INADE".parse::<NormMode>().unwrap(), NormMode::Inade);
        assert!(matches!(
            "adain".parse::<NormMode>(),
            Err(SynthesisError::UnknownNormMode(_))
        ));
    }

    #[test]
    fn test_channel_counts() {
        let config = ModelConfig::default().with_label_nc(3).with_dontcare_label(false);
        assert_eq!(config.class_nc(), 3);
        assert_eq!(config.semantic_nc(), 4);

        let config = config.with_instance_edges(false);
        assert_eq!(config.semantic_nc(), 3);
    }

    #[test]
    fn test_latent_grid() {
        let config = ModelConfig::default();
        assert_eq!(config.latent_grid(), (8, 8));

        let mut config = ModelConfig::default().with_crop_size(64);
        config.aspect_ratio = 2.0;
        assert_eq!(config.latent_grid(), (1, 2));
    }

    #[test]
    fn test_validate_rejects_small_crop() {
        let config = ModelConfig::default().with_crop_size(16);
        assert!(matches!(
            config.validate(),
            Err(SynthesisError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_json_round_trip_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{"norm_mode": "inade", "label_nc": 7, "gan_mode": "ls"}"#).unwrap();

        let config = ModelConfig::from_json_file(&path).unwrap();
        assert_eq!(config.norm_mode, NormMode::Inade);
        assert_eq!(config.label_nc, 7);
        assert_eq!(config.gan_mode, GanMode::Ls);
        assert_eq!(config.hidden_dim, 128);

        let out = dir.path().join("full.json");
        config.to_json_file(&out).unwrap();
        let again = ModelConfig::from_json_file(&out).unwrap();
        assert_eq!(again.label_nc, 7);
    }

    #[test]
    fn test_json_unknown_names_are_config_errors() {
        let err = ModelConfig::from_json_str(r#"{"norm_mode": "adain"}"#).unwrap_err();
        assert!(matches!(err, SynthesisError::UnknownNormMode(ref m) if m == "adain"));
        assert!(err.is_config_error());

        let err = ModelConfig::from_json_str(r#"{"gan_mode": "relativistic"}"#).unwrap_err();
        assert!(matches!(err, SynthesisError::UnknownGanMode(_)));

        let err = ModelConfig::from_json_str(r#"{"norm_g": "spadegroup3x3"}"#).unwrap_err();
        assert!(matches!(err, SynthesisError::UnknownParamFreeNorm(_)));

        let err = ModelConfig::from_json_str(r#"{"norm_d": "spectrallayer"}"#).unwrap_err();
        assert!(matches!(err, SynthesisError::UnknownLayerNorm(_)));
        assert!(err.is_config_error());

        // Names are matched case-insensitively, as on the command line
        let config = ModelConfig::from_json_str(r#"{"norm_mode": "INADE"}"#).unwrap();
        assert_eq!(config.norm_mode, NormMode::Inade);
    }
}
