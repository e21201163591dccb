//! Error types shared by the normalization layers, networks and model orchestrator.

use thiserror::Error;

/// Result type for synthesis operations
pub type Result<T> = std::result::Result<T, SynthesisError>;

/// Error type for synthesis operations
///
/// Configuration variants are raised while building a model and are never
/// retried. Precondition variants are raised at call time when the inputs do
/// not match what the configuration promised.
#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Normalization mode {0:?} is not recognized (expected \"spade\" or \"inade\")")]
    UnknownNormMode(String),

    #[error("Malformed SPADE configuration {0:?} (expected spade<type><k>x<k>)")]
    MalformedSpadeConfig(String),

    #[error("{0:?} is not a recognized param-free norm type")]
    UnknownParamFreeNorm(String),

    #[error("Normalization layer {0:?} is not recognized")]
    UnknownLayerNorm(String),

    #[error("GAN mode {0:?} is not recognized")]
    UnknownGanMode(String),

    #[error("Mode {0:?} is invalid")]
    UnknownMode(String),

    #[error("Sketch conditioning is enabled but no sketch tensor was supplied")]
    MissingSketch,

    #[error("Instance-adaptive normalization requires an instance map")]
    MissingInstances,

    #[error("Instance-adaptive normalization requires a noise tensor")]
    MissingNoise,

    #[error("KL divergence loss requested while use_vae is disabled")]
    VaeDisabled,

    #[error("{0} is not available in the current configuration")]
    Unavailable(&'static str),

    #[error("Perceptual loss is enabled but no VGG weights were configured")]
    MissingPerceptualWeights,

    #[error("Instance index {index} out of range (instance count {count})")]
    InstanceOutOfRange { index: usize, count: usize },

    #[error("Label {label} out of range for {classes} semantic classes")]
    LabelOutOfRange { label: u32, classes: usize },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SynthesisError {
    /// Whether the error was raised while validating the configuration
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SynthesisError::InvalidConfig(_)
                | SynthesisError::UnknownNormMode(_)
                | SynthesisError::MalformedSpadeConfig(_)
                | SynthesisError::UnknownParamFreeNorm(_)
                | SynthesisError::UnknownLayerNorm(_)
                | SynthesisError::UnknownGanMode(_)
                | SynthesisError::MissingPerceptualWeights
        )
    }
}
