//! Batch preprocessing
//!
//! Turns raw label and instance id maps into the one-hot semantic map, the
//! optional instance edge channel and the optional instance one-hot map. The
//! instance count of the one-hot map is `max id + 1` over the whole batch, so it
//! varies from batch to batch; ids with no pixels still get an (empty) channel.

use crate::error::{Result, SynthesisError};
use candle_core::{DType, Device, Tensor};
use tracing::debug;

/// Raw inputs of one batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// Class ids `(B, 1, H, W)`, integral values in any dtype
    pub label: Tensor,
    /// Instance ids `(B, 1, H, W)`
    pub instance: Option<Tensor>,
    /// Real image `(B, 3, H, W)` in `[-1, 1]`
    pub image: Tensor,
    /// Sketch `(B, 1, H, W)`
    pub sketch: Option<Tensor>,
}

impl Batch {
    pub fn new(label: Tensor, image: Tensor) -> Self {
        Self {
            label,
            instance: None,
            image,
            sketch: None,
        }
    }

    pub fn with_instance(mut self, instance: Tensor) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_sketch(mut self, sketch: Tensor) -> Self {
        self.sketch = Some(sketch);
        self
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.label.dim(0)?)
    }
}

/// Tensors derived once per batch and shared by every network call
#[derive(Debug, Clone)]
pub struct PreparedInputs {
    pub semantics: Tensor,
    pub instances: Option<Tensor>,
    pub image: Tensor,
    pub sketch: Option<Tensor>,
}

impl PreparedInputs {
    /// Per-batch instance count, when the instance one-hot map was built
    pub fn instance_count(&self) -> Option<usize> {
        self.instances.as_ref().and_then(|t| t.dim(1).ok())
    }
}

/// One-hot encode `(B, 1, H, W)` ids into `(B, classes, H, W)` floats
pub fn one_hot(ids: &Tensor, classes: usize) -> Result<Tensor> {
    let ids = ids.to_dtype(DType::U32)?;
    let range = Tensor::arange(0u32, classes as u32, ids.device())?.reshape((1, classes, 1, 1))?;
    Ok(ids.broadcast_eq(&range)?.to_dtype(DType::F32)?)
}

fn max_id(ids: &Tensor) -> Result<u32> {
    Ok(ids
        .to_dtype(DType::U32)?
        .flatten_all()?
        .max(0)?
        .to_scalar::<u32>()?)
}

/// Mark pixels whose 4-neighborhood contains a different instance id
pub fn instance_edges(instance: &Tensor) -> Result<Tensor> {
    let t = instance.to_dtype(DType::F32)?;
    let (_, _, h, w) = t.dims4()?;
    let mut edges = t.zeros_like()?;

    if w > 1 {
        let diff = t
            .narrow(3, 1, w - 1)?
            .ne(&t.narrow(3, 0, w - 1)?)?
            .to_dtype(DType::F32)?;
        edges = edges
            .maximum(&diff.pad_with_zeros(3, 1, 0)?)?
            .maximum(&diff.pad_with_zeros(3, 0, 1)?)?;
    }
    if h > 1 {
        let diff = t
            .narrow(2, 1, h - 1)?
            .ne(&t.narrow(2, 0, h - 1)?)?
            .to_dtype(DType::F32)?;
        edges = edges
            .maximum(&diff.pad_with_zeros(2, 1, 0)?)?
            .maximum(&diff.pad_with_zeros(2, 0, 1)?)?;
    }
    Ok(edges)
}

/// One-hot encode instance ids with `max id + 1` channels
pub fn instance_one_hot(instance: &Tensor) -> Result<Tensor> {
    let count = max_id(instance)? as usize + 1;
    one_hot(instance, count)
}

/// Derives the network inputs of a batch according to the model configuration
#[derive(Debug, Clone)]
pub struct Preprocessor {
    /// Class channels including the don't-care class
    pub class_nc: usize,
    /// Append the instance edge channel to the semantic map
    pub instance_edges: bool,
    /// Build the instance one-hot map
    pub instance_one_hot: bool,
    pub device: Device,
}

impl Preprocessor {
    pub fn prepare(&self, batch: &Batch) -> Result<PreparedInputs> {
        let label = batch.label.to_device(&self.device)?;
        let max_label = max_id(&label)?;
        if max_label as usize >= self.class_nc {
            return Err(SynthesisError::LabelOutOfRange {
                label: max_label,
                classes: self.class_nc,
            });
        }
        let mut semantics = one_hot(&label, self.class_nc)?;

        let instance = batch
            .instance
            .as_ref()
            .map(|t| t.to_device(&self.device))
            .transpose()?;

        if self.instance_edges {
            let instance = instance.as_ref().ok_or(SynthesisError::MissingInstances)?;
            semantics = Tensor::cat(&[&semantics, &instance_edges(instance)?], 1)?;
        }

        let instances = if self.instance_one_hot {
            let instance = instance.as_ref().ok_or(SynthesisError::MissingInstances)?;
            Some(instance_one_hot(instance)?)
        } else {
            None
        };

        let image = batch.image.to_device(&self.device)?.to_dtype(DType::F32)?;
        let sketch = batch
            .sketch
            .as_ref()
            .map(|t| t.to_device(&self.device)?.to_dtype(DType::F32))
            .transpose()?;

        let prepared = PreparedInputs {
            semantics,
            instances,
            image,
            sketch,
        };
        debug!(
            batch = batch.batch_size()?,
            semantic_nc = prepared.semantics.dim(1)?,
            instances = ?prepared.instance_count(),
            "Prepared batch"
        );
        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_hot() {
        let device = Device::Cpu;
        let ids = Tensor::new(&[[[[0u32, 2], [1, 2]]]], &device).unwrap();
        let oh = one_hot(&ids, 3).unwrap();
        assert_eq!(oh.dims(), &[1, 3, 2, 2]);
        assert_eq!(
            oh.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0]
        );
        // exactly one hot channel per pixel
        let per_pixel = oh.sum(1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(per_pixel, vec![1.0; 4]);
    }

    #[test]
    fn test_edges_constant_map() {
        let device = Device::Cpu;
        let inst = Tensor::full(5f32, (2, 1, 4, 3), &device).unwrap();
        let edges = instance_edges(&inst).unwrap();
        assert_eq!(edges.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_edges_two_by_two() {
        let device = Device::Cpu;
        let inst = Tensor::new(&[[[[1f32, 1.0], [1.0, 2.0]]]], &device).unwrap();
        let edges = instance_edges(&inst).unwrap();
        assert_eq!(
            edges.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![0.0, 1.0, 1.0, 1.0]
        );
    }

    #[test]
    fn test_instance_one_hot_with_gaps() {
        let device = Device::Cpu;
        // ids 0 and 3: channels 1 and 2 stay empty
        let inst = Tensor::new(&[[[[0u32, 3]]]], &device).unwrap();
        let oh = instance_one_hot(&inst).unwrap();
        assert_eq!(oh.dims(), &[1, 4, 1, 2]);
        let per_channel = oh.sum((0, 2, 3)).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(per_channel, vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_prepare_rejects_out_of_range_label() {
        let device = Device::Cpu;
        let pre = Preprocessor {
            class_nc: 2,
            instance_edges: false,
            instance_one_hot: false,
            device: device.clone(),
        };
        let label = Tensor::new(&[[[[0u32, 2]]]], &device).unwrap();
        let image = Tensor::zeros((1, 3, 1, 2), DType::F32, &device).unwrap();
        assert!(matches!(
            pre.prepare(&Batch::new(label, image)),
            Err(SynthesisError::LabelOutOfRange { label: 2, classes: 2 })
        ));
    }

    #[test]
    fn test_prepare_appends_edges() {
        let device = Device::Cpu;
        let pre = Preprocessor {
            class_nc: 3,
            instance_edges: true,
            instance_one_hot: true,
            device: device.clone(),
        };
        let label = Tensor::new(&[[[[0u32, 1], [2, 2]]]], &device).unwrap();
        let inst = Tensor::new(&[[[[0u32, 0], [1, 1]]]], &device).unwrap();
        let image = Tensor::zeros((1, 3, 2, 2), DType::F32, &device).unwrap();

        let prepared = pre
            .prepare(&Batch::new(label.clone(), image.clone()).with_instance(inst))
            .unwrap();
        assert_eq!(prepared.semantics.dims(), &[1, 4, 2, 2]);
        assert_eq!(prepared.instance_count(), Some(2));

        assert!(matches!(
            pre.prepare(&Batch::new(label, image)),
            Err(SynthesisError::MissingInstances)
        ));
    }
}
