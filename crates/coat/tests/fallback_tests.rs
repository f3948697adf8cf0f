// Integration tests for the bf16 fallback
//
// With FP8 storage unavailable every quantization site stores bf16 codes
// instead. These tests run the activation, flow and trainer paths on
// `NumericCapabilities::bf16_only()` and check the results stay finite and
// close to full precision.

use coat::prelude::*;

fn activation_config() -> ActivationConfig {
    ActivationConfig::default().with_group_size(4)
}

fn bf16_quantizer() -> Result<ActivationQuantizer> {
    ActivationQuantizer::new(activation_config(), NumericCapabilities::bf16_only())
}

fn linear(rows: usize, cols: usize, seed: u64) -> Result<Linear> {
    Linear::from_tensors(Tensor::randn_seeded((rows, cols), DType::F32, seed)?, None)
}

fn assert_bf16(block: &QuantizedBlock) {
    assert!(!block.is_fp8());
    assert!(matches!(block.codes(), NarrowCodes::Bf16(_)));
}

fn assert_close(got: &[f64], expected: &[f64], rel: f64, abs: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        assert!(g.is_finite(), "index {i}: {g} is not finite");
        assert!((g - e).abs() <= rel * e.abs() + abs, "index {i}: got {g} expected {e}");
    }
}

#[test]
fn test_activation_quantizer_both_granularities() -> Result<()> {
    let q = bf16_quantizer()?;
    let x = Tensor::randn_seeded((3, 8), DType::F32, 1)?;
    let original = x.to_f64_vec()?;

    let whole = q.quantize_per_tensor(&x)?;
    assert_bf16(&whole);
    assert_eq!(whole.n_groups(), 1);
    assert_close(&q.dequantize(&whole)?.to_f64_vec()?, &original, 1e-2, 1e-6);

    let grouped = q.quantize_per_group(&x)?;
    assert_bf16(&grouped);
    assert_eq!(grouped.n_groups(), 6);
    let restored = q.dequantize(&grouped)?;
    assert_eq!(restored.dims(), x.dims());
    assert_close(&restored.to_f64_vec()?, &original, 1e-2, 1e-6);
    Ok(())
}

#[test]
fn test_flow_cache_sequential() -> Result<()> {
    let cache = PrecisionFlowCache::new(bf16_quantizer()?);
    let model = Sequential::new()
        .add(linear(8, 8, 2)?)
        .add(ReLU)
        .add(LayerNorm::new(8, 1e-5, DType::F32)?);
    let x = Tensor::randn_seeded((4, 8), DType::F32, 3)?;

    let y = cache.forward_sequential(&model, &x)?;
    let reference = model.forward(&x)?;
    assert_close(&y.to_f64_vec()?, &reference.to_f64_vec()?, 0.05, 0.05);

    assert_eq!(cache.len()?, 3);
    for index in 0..3 {
        let entry = cache.entry(index)?.expect("every unit cached");
        assert_bf16(&entry.input);
        assert_bf16(&entry.output);
    }
    Ok(())
}

#[test]
fn test_fp8_linear() -> Result<()> {
    let inner = linear(4, 8, 4)?;
    let x = Tensor::randn_seeded((3, 8), DType::F32, 5)?;
    let reference = inner.forward(&x)?.to_f64_vec()?;
    let spread = x
        .abs()?
        .matmul(&inner.weight().abs()?.t()?)?
        .to_f64_vec()?;

    let wrapped = Fp8Linear::new(Box::new(inner), bf16_quantizer()?);
    let out = wrapped.forward(&x)?.to_f64_vec()?;
    assert_eq!(out.len(), reference.len());
    for ((a, b), s) in reference.iter().zip(&out).zip(&spread) {
        assert!(b.is_finite());
        assert!((a - b).abs() <= 1e-2 * s + 1e-2 * a.abs() + 1e-5, "{a} vs {b}");
    }
    Ok(())
}

#[test]
fn test_training_step() -> Result<()> {
    let config = CoatConfig::default()
        .with_optimizer_block_size(16)
        .with_activation(activation_config());
    let mut trainer = CoatTrainer::new(config, NumericCapabilities::bf16_only())?;
    assert!(!trainer.capabilities().has_fp8());

    let mut model = Sequential::new().add(linear(2, 4, 6)?);
    assert_eq!(trainer.prepare_model(&mut model)?, 1);
    let mut opt = trainer.create_optimizer(model.parameters(), 0.05)?;

    let x = Tensor::randn_seeded((8, 4), DType::F32, 7)?;
    let target = Tensor::zeros((8, 2), DType::F32)?;
    let mut losses = Vec::new();
    for step in 0..10 {
        let metrics = trainer.training_step(&model, &mut opt, step, |pass| {
            let y = pass.forward(&x)?;
            let diff = y.sub(&target)?;
            let n = diff.elem_count() as f64;
            let loss = diff.square()?.sum_all()? / n;
            let grad = diff.t()?.matmul(&x)?.affine(2.0 / n, 0.0)?;
            Ok((loss, vec![Some(grad)]))
        })?;
        assert!(metrics.loss.is_finite());
        losses.push(metrics.loss);
    }
    assert!(losses[9] < losses[0], "loss {} → {}", losses[0], losses[9]);

    for v in model.parameters()[0].to_f64_vec()? {
        assert!(v.is_finite());
    }
    let state = opt.state(0).expect("weight state");
    for moment in [&state.exp_avg, &state.exp_avg_sq] {
        match moment {
            MomentStorage::Quantized(block) => assert_bf16(block),
            MomentStorage::Full(_) => panic!("moments should be stored narrow"),
        }
    }
    Ok(())
}
