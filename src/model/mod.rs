//! Model orchestration: batch preprocessing, the five operating modes and
//! parameter-group persistence

pub mod checkpoint;
pub mod pix2pix;
pub mod preprocess;

pub use checkpoint::{checkpoint_path, ParameterGroups};
pub use pix2pix::{
    DiscriminatorLosses, GeneratorLosses, InstanceTransfer, ModelComponents, ModelMode,
    ModelOutput, Pix2PixModel, ReferenceBatch, INSTANCE_FEATURE_FIRST_LAYER,
};
pub use preprocess::{instance_edges, instance_one_hot, one_hot, Batch, PreparedInputs, Preprocessor};
