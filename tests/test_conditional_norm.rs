#[cfg(test)]
mod test_conditional_norm {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use inade::config::{ModelConfig, NormMode, ParamFreeNormKind};
    use inade::networks::layers::instance_norm;
    use inade::networks::normalization::{class_affine, instance_projection};
    use inade::networks::{
        ConditionalNorm, ConditionalNormConfig, ConditionalNormalization, Conditioning, IladeNorm,
        SpadeNorm, SpadeResnetBlock,
    };
    use inade::SynthesisError;

    fn zero_vars(varmap: &VarMap, names: &[&str]) {
        let data = varmap.data().lock().unwrap();
        for name in names {
            let var = data.get(*name).unwrap_or_else(|| panic!("no variable {name}"));
            var.set(&var.zeros_like().unwrap()).unwrap();
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    /// `(B, n, H, W)` one-hot map where pixel column `x` belongs to channel `x * n / W`
    fn striped_one_hot(b: usize, n: usize, h: usize, w: usize, device: &Device) -> Tensor {
        let mut data = vec![0f32; b * n * h * w];
        for bi in 0..b {
            for y in 0..h {
                for x in 0..w {
                    let c = x * n / w;
                    data[((bi * n + c) * h + y) * w + x] = 1.0;
                }
            }
        }
        Tensor::from_vec(data, (b, n, h, w), device).unwrap()
    }

    #[test]
    fn test_spade_preserves_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = SpadeNorm::new(vb, 8, 4, 16, ParamFreeNormKind::Instance, 3).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 8, 16, 16), &device).unwrap();
        let segmap = striped_one_hot(2, 4, 64, 64, &device);
        let out = norm.forward(&x, &segmap, true).unwrap();
        assert_eq!(out.dims(), x.dims());
    }

    #[test]
    fn test_spade_zeroed_modulation_is_instance_norm() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = SpadeNorm::new(vb, 6, 3, 8, ParamFreeNormKind::Instance, 3).unwrap();
        zero_vars(
            &varmap,
            &[
                "mlp_gamma.weight",
                "mlp_gamma.bias",
                "mlp_beta.weight",
                "mlp_beta.bias",
            ],
        );

        let x = Tensor::randn(0f32, 1.0, (2, 6, 8, 8), &device).unwrap();
        let segmap = striped_one_hot(2, 3, 8, 8, &device);
        let out = norm.forward(&x, &segmap, true).unwrap();
        let expected = instance_norm(&x, 1e-5).unwrap();
        assert!(max_abs_diff(&out, &expected) < 1e-5);
    }

    #[test]
    fn test_ilade_zeroed_parameters_give_zero() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = IladeNorm::new(vb, 4, 3, 5, ParamFreeNormKind::Instance, false).unwrap();
        zero_vars(
            &varmap,
            &["weight", "bias", "fc_noise.weight", "fc_noise.bias"],
        );

        let x = Tensor::randn(0f32, 1.0, (1, 4, 8, 8), &device).unwrap();
        let segmap = striped_one_hot(1, 3, 8, 8, &device);
        let instances = striped_one_hot(1, 2, 8, 8, &device);
        let noise = Tensor::randn(0f32, 1.0, (1, 2, 2, 5), &device).unwrap();
        let cond = Conditioning::semantic(&segmap).with_instances(&instances, &noise);

        let out = norm.forward(&x, &cond, true).unwrap();
        assert_eq!(out.dims(), &[1, 4, 8, 8]);
        assert!(max_abs_diff(&out, &out.zeros_like().unwrap()) == 0.0);
    }

    #[test]
    fn test_ilade_zero_noise_ignores_instance_identity() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = IladeNorm::new(vb, 4, 2, 3, ParamFreeNormKind::Instance, false).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 4, 8, 8), &device).unwrap();
        let segmap = striped_one_hot(1, 2, 8, 8, &device);
        let noise = Tensor::zeros((1, 2, 2, 3), DType::F32, &device).unwrap();

        // Every pixel in instance 0, then every pixel in instance 1
        let ones = Tensor::ones((1, 1, 8, 8), DType::F32, &device).unwrap();
        let zeros = ones.zeros_like().unwrap();
        let first = Tensor::cat(&[&ones, &zeros], 1).unwrap();
        let second = Tensor::cat(&[&zeros, &ones], 1).unwrap();

        let a = norm
            .forward(&x, &Conditioning::semantic(&segmap).with_instances(&first, &noise), true)
            .unwrap();
        let b = norm
            .forward(&x, &Conditioning::semantic(&segmap).with_instances(&second, &noise), true)
            .unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-6);
    }

    #[test]
    fn test_ilade_ignores_trailing_edge_channel() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = IladeNorm::new(vb, 4, 2, 3, ParamFreeNormKind::Instance, false).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 4, 8, 8), &device).unwrap();
        let classes = striped_one_hot(1, 2, 8, 8, &device);
        let edges = Tensor::ones((1, 1, 8, 8), DType::F32, &device).unwrap();
        let with_edges = Tensor::cat(&[&classes, &edges], 1).unwrap();
        let instances = striped_one_hot(1, 2, 8, 8, &device);
        let noise = Tensor::randn(0f32, 1.0, (1, 2, 2, 3), &device).unwrap();

        let a = norm
            .forward(&x, &Conditioning::semantic(&classes).with_instances(&instances, &noise), true)
            .unwrap();
        let b = norm
            .forward(&x, &Conditioning::semantic(&with_edges).with_instances(&instances, &noise), true)
            .unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-6);
    }

    #[test]
    fn test_ilade_missing_inputs() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = IladeNorm::new(vb, 4, 2, 3, ParamFreeNormKind::Instance, true).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 4, 8, 8), &device).unwrap();
        let segmap = striped_one_hot(1, 2, 8, 8, &device);
        let instances = striped_one_hot(1, 2, 8, 8, &device);
        let noise = Tensor::zeros((1, 2, 2, 3), DType::F32, &device).unwrap();

        let err = norm
            .forward(&x, &Conditioning::semantic(&segmap), true)
            .unwrap_err();
        assert!(matches!(err, SynthesisError::MissingInstances));

        let cond = Conditioning::semantic(&segmap).with_instances(&instances, &noise);
        let err = norm.forward(&x, &cond, true).unwrap_err();
        assert!(matches!(err, SynthesisError::MissingSketch));

        let sketch = Tensor::zeros((1, 1, 32, 32), DType::F32, &device).unwrap();
        let out = norm.forward(&x, &cond.with_sketch(Some(&sketch)), true).unwrap();
        assert_eq!(out.dims(), &[1, 4, 8, 8]);
    }

    #[test]
    fn test_ilade_noise_instance_mismatch() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = IladeNorm::new(vb, 4, 2, 3, ParamFreeNormKind::Instance, false).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 4, 8, 8), &device).unwrap();
        let segmap = striped_one_hot(1, 2, 8, 8, &device);
        let instances = striped_one_hot(1, 2, 8, 8, &device);
        let noise = Tensor::zeros((1, 3, 2, 3), DType::F32, &device).unwrap();
        let cond = Conditioning::semantic(&segmap).with_instances(&instances, &noise);
        assert!(matches!(
            norm.forward(&x, &cond, true),
            Err(SynthesisError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_class_affine_selects_class_rows() {
        let device = Device::Cpu;
        // (K=2, C=3)
        let params = Tensor::new(&[[1f32, 2., 3.], [10., 20., 30.]], &device).unwrap();
        let classes = striped_one_hot(1, 2, 1, 2, &device);
        let out = class_affine(&params, &classes).unwrap();
        assert_eq!(out.dims(), &[1, 3, 1, 2]);
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![1., 10., 2., 20., 3., 30.]);
    }

    #[test]
    fn test_instance_projection_paints_instances() {
        let device = Device::Cpu;
        // (B=1, N=2, C=2)
        let noise = Tensor::new(&[[[0.5f32, -1.0], [2.0, 4.0]]], &device).unwrap();
        let instances = striped_one_hot(1, 2, 1, 2, &device);
        let out = instance_projection(&noise, &instances).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![0.5, 2.0, -1.0, 4.0]);
    }

    #[test]
    fn test_conditional_norm_from_config() {
        let device = Device::Cpu;
        let config = ModelConfig::default()
            .with_norm_mode(NormMode::Inade)
            .with_label_nc(2)
            .with_latent_dims(8, 3);
        let norm_cfg = ConditionalNormConfig::from_model(&config, config.generator_norm().unwrap());
        assert_eq!(norm_cfg.class_nc, 3);
        assert_eq!(norm_cfg.semantic_nc, 4);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = ConditionalNorm::new(vb, 4, &norm_cfg).unwrap();
        assert!(matches!(norm, ConditionalNorm::Ilade(_)));

        let x = Tensor::randn(0f32, 1.0, (2, 4, 8, 8), &device).unwrap();
        let segmap = striped_one_hot(2, 4, 8, 8, &device);
        let instances = striped_one_hot(2, 2, 8, 8, &device);
        let noise = Tensor::randn(0f32, 1.0, (2, 2, 2, 3), &device).unwrap();
        let cond = Conditioning::semantic(&segmap).with_instances(&instances, &noise);
        let out = norm.apply(&x, &cond, true).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8, 8]);
    }

    #[test]
    fn test_resnet_block_shortcut() {
        let device = Device::Cpu;
        let config = ModelConfig::default().with_label_nc(2).with_hidden_dim(8);
        let norm_cfg = ConditionalNormConfig::from_model(&config, config.generator_norm().unwrap());

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let same = SpadeResnetBlock::new(vb.pp("same"), 8, 8, &norm_cfg, 0.2, 1).unwrap();
        let narrowing = SpadeResnetBlock::new(vb.pp("narrow"), 8, 4, &norm_cfg, 0.2, 1).unwrap();
        assert!(!same.has_learned_shortcut());
        assert!(narrowing.has_learned_shortcut());

        let x = Tensor::randn(0f32, 1.0, (2, 8, 8, 8), &device).unwrap();
        let segmap = striped_one_hot(2, config.semantic_nc(), 16, 16, &device);
        let cond = Conditioning::semantic(&segmap);
        assert_eq!(same.forward(&x, &cond, true).unwrap().dims(), &[2, 8, 8, 8]);
        assert_eq!(narrowing.forward(&x, &cond, true).unwrap().dims(), &[2, 4, 8, 8]);
    }
}
