use anyhow::Result;
use attention::masks::build_causal_mask;
use attention::{AttentionError, CacheConfig, CacheProvider, PagedKeyValueCache};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use embedding::{RopeConfig, RotaryEmbedding};
use layers::PrecisionPolicy;
use text_decoder::{
    DecoderLayer, ForwardContext, LayerKind, ModelError, SelfAttention, TextModel,
    TextModelConfig, TextModelInput,
};

const HIDDEN: usize = 16;
const VOCAB: usize = 32;

fn two_layer_config() -> TextModelConfig {
    TextModelConfig::new(VOCAB, HIDDEN, 32, 4, 2)
        .with_kv_heads(2)
        .with_cross_attention_layers([1])
}

fn build(config: TextModelConfig) -> Result<(VarMap, TextModel)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = TextModel::new(config, vb)?;
    Ok((varmap, model))
}

fn fresh_cache(layers: usize) -> Result<PagedKeyValueCache> {
    Ok(PagedKeyValueCache::new(CacheConfig::new(layers, 4)?))
}

fn tokens(ids: &[u32]) -> Result<(Tensor, Tensor)> {
    let device = Device::Cpu;
    let token_ids = Tensor::new(ids, &device)?.unsqueeze(0)?;
    let positions = Tensor::arange(0u32, ids.len() as u32, &device)?;
    Ok((token_ids, positions))
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?)
}

fn max_abs(a: &Tensor) -> Result<f32> {
    Ok(a.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?)
}

fn cross_gates(model: &TextModel, index: usize) -> Result<(f32, f32)> {
    match &model.decoder().layers()[index] {
        DecoderLayer::CrossAttention(layer) => Ok(layer.gates()?),
        DecoderLayer::SelfAttention(_) => panic!("layer {index} is not a cross-attention layer"),
    }
}

#[test]
fn construction_rejects_invalid_geometry() {
    let cases = [
        TextModelConfig::new(VOCAB, 18, 32, 4, 2),
        TextModelConfig::new(VOCAB, HIDDEN, 32, 4, 2).with_kv_heads(3),
        TextModelConfig::new(VOCAB, HIDDEN, 32, 4, 2).with_cross_attention_layers([2]),
        TextModelConfig::new(VOCAB, HIDDEN, 32, 4, 2).with_rope_dim(5),
    ];
    for config in cases {
        match build(config) {
            Err(err) => assert!(matches!(
                err.downcast_ref::<ModelError>(),
                Some(ModelError::Config(_))
            )),
            Ok(_) => panic!("construction should fail"),
        }
    }
}

#[test]
fn layer_layout_follows_cross_attention_indices() -> Result<()> {
    let config = TextModelConfig::new(VOCAB, HIDDEN, 32, 4, 5).with_cross_attention_layers([3, 1]);
    let (_, model) = build(config)?;
    assert_eq!(
        model.layer_kinds(),
        vec![
            LayerKind::SelfAttention,
            LayerKind::CrossAttention,
            LayerKind::SelfAttention,
            LayerKind::CrossAttention,
            LayerKind::SelfAttention,
        ]
    );
    Ok(())
}

#[test]
fn text_only_forward_produces_logits_and_skips_cross_layer() -> Result<()> {
    let (_, model) = build(two_layer_config())?;
    let ctx = ForwardContext::cpu();
    let (token_ids, positions) = tokens(&[1, 5, 9, 2])?;
    let mask = build_causal_mask(&Device::Cpu, 4, 4)?;
    let mut cache = fresh_cache(2)?;

    let logits = model.forward(
        &ctx,
        TextModelInput::new(&token_ids, &positions).with_mask(&mask),
        &mut cache,
    )?;
    assert_eq!(logits.dims(), &[1, 4, VOCAB]);
    assert_eq!(logits.dtype(), DType::F32);

    assert_eq!(cache.sub(0)?.len(), 4);
    assert!(cache.sub(1)?.is_empty(), "skipped layer must not touch its cache slice");
    Ok(())
}

#[test]
fn skipped_cross_layer_is_identity() -> Result<()> {
    let (_, model) = build(two_layer_config())?;
    let ctx = ForwardContext::cpu();
    let device = Device::Cpu;
    let hidden = Tensor::randn(0f32, 1.0, (1, 4, HIDDEN), &device)?;
    let positions = Tensor::arange(0u32, 4, &device)?;
    let mask = build_causal_mask(&device, 4, 4)?;

    let layers = model.decoder().layers();
    let mut direct_cache = fresh_cache(2)?;
    let after_first = layers[0].forward(
        &ctx,
        &hidden,
        &positions,
        Some(&mask),
        None,
        direct_cache.sub(0)?,
    )?;

    let mut cache = fresh_cache(2)?;
    let decoded = model
        .decoder()
        .forward(&ctx, &hidden, &positions, Some(&mask), None, None, &mut cache)?;
    assert_eq!(max_diff(&decoded, &after_first)?, 0.0);

    let passthrough = layers[1].forward(&ctx, &after_first, &positions, None, None, cache.sub(1)?)?;
    assert_eq!(max_diff(&passthrough, &after_first)?, 0.0);
    Ok(())
}

#[test]
fn zero_gates_make_cross_layer_the_identity() -> Result<()> {
    let config = TextModelConfig::new(VOCAB, HIDDEN, 32, 4, 1).with_cross_attention_layers([0]);
    let (_, model) = build(config)?;
    let ctx = ForwardContext::cpu();
    let device = Device::Cpu;
    let hidden = Tensor::randn(0f32, 1.0, (1, 3, HIDDEN), &device)?;
    let positions = Tensor::arange(0u32, 3, &device)?;
    let cross_state = Tensor::randn(0f32, 1.0, (2, 5, HIDDEN), &device)?;

    assert_eq!(cross_gates(&model, 0)?, (0.0, 0.0));
    let layer = &model.decoder().layers()[0];
    assert!(layer.is_cross_attention());
    let mut cache = fresh_cache(1)?;
    let out = layer.forward(&ctx, &hidden, &positions, None, Some(&cross_state), cache.sub(0)?)?;
    assert_eq!(max_diff(&out, &hidden)?, 0.0);
    Ok(())
}

#[test]
fn cross_state_changes_the_output_once_gates_open() -> Result<()> {
    let (mut varmap, model) = build(two_layer_config())?;
    let device = Device::Cpu;
    varmap.set_one("blk.1.cross_attn_attn_gate", Tensor::new(&[0.5f32], &device)?)?;
    varmap.set_one("blk.1.cross_attn_mlp_gate", Tensor::new(&[0.5f32], &device)?)?;
    let (attn_gate, mlp_gate) = cross_gates(&model, 1)?;
    assert!((attn_gate - 0.5f32.tanh()).abs() < 1e-6);
    assert!((mlp_gate - 0.5f32.tanh()).abs() < 1e-6);

    let ctx = ForwardContext::cpu();
    let (token_ids, positions) = tokens(&[3, 1, 4, 1])?;
    let mask = build_causal_mask(&device, 4, 4)?;
    // hidden x 3 vision tokens x 1 tile
    let cross_state = Tensor::randn(0f32, 1.0, (1, 3, HIDDEN), &device)?;

    let mut text_cache = fresh_cache(2)?;
    let text_only = model.forward(
        &ctx,
        TextModelInput::new(&token_ids, &positions).with_mask(&mask),
        &mut text_cache,
    )?;

    let mut image_cache = fresh_cache(2)?;
    let with_image = model.forward(
        &ctx,
        TextModelInput::new(&token_ids, &positions)
            .with_mask(&mask)
            .with_cross_state(&cross_state),
        &mut image_cache,
    )?;

    assert_eq!(with_image.dims(), &[1, 4, VOCAB]);
    assert!(max_diff(&with_image, &text_only)? > 1e-4);
    Ok(())
}

#[test]
fn cache_grows_by_one_position_per_decode_step() -> Result<()> {
    let (_, model) = build(two_layer_config())?;
    let ctx = ForwardContext::cpu();
    let device = Device::Cpu;
    let mut cache = fresh_cache(2)?;

    for step in 0..6u32 {
        let token_ids = Tensor::new(&[[step % VOCAB as u32]], &device)?;
        let positions = Tensor::new(&[step], &device)?;
        let logits = model.forward(&ctx, TextModelInput::new(&token_ids, &positions), &mut cache)?;
        assert_eq!(logits.dims(), &[1, 1, VOCAB]);
        assert_eq!(cache.sub(0)?.len(), step as usize + 1);
    }
    assert_eq!(cache.stats().tokens, 6);
    Ok(())
}

#[test]
fn incremental_decode_matches_prefill() -> Result<()> {
    let (_, model) = build(two_layer_config())?;
    let ctx = ForwardContext::cpu();
    let device = Device::Cpu;
    let ids = [7u32, 2, 11, 5, 0];

    let (token_ids, positions) = tokens(&ids)?;
    let mask = build_causal_mask(&device, ids.len(), ids.len())?;
    let mut prefill_cache = fresh_cache(2)?;
    let prefill = model.forward(
        &ctx,
        TextModelInput::new(&token_ids, &positions).with_mask(&mask),
        &mut prefill_cache,
    )?;
    let last = prefill.narrow(1, ids.len() - 1, 1)?;

    let mut cache = fresh_cache(2)?;
    let (head_ids, head_positions) = tokens(&ids[..ids.len() - 1])?;
    let head_mask = build_causal_mask(&device, ids.len() - 1, ids.len() - 1)?;
    model.forward(
        &ctx,
        TextModelInput::new(&head_ids, &head_positions).with_mask(&head_mask),
        &mut cache,
    )?;
    let step_ids = Tensor::new(&[[ids[ids.len() - 1]]], &device)?;
    let step_positions = Tensor::new(&[ids.len() as u32 - 1], &device)?;
    let step = model.forward(&ctx, TextModelInput::new(&step_ids, &step_positions), &mut cache)?;

    let tolerance = 1e-4 * (1.0 + max_abs(&last)?);
    assert!(max_diff(&step, &last)? < tolerance);
    Ok(())
}

#[test]
fn empty_sequence_yields_empty_logits() -> Result<()> {
    let (_, model) = build(two_layer_config())?;
    let ctx = ForwardContext::cpu();
    let device = Device::Cpu;
    let token_ids = Tensor::zeros((1, 0), DType::U32, &device)?;
    let positions = Tensor::zeros(0, DType::U32, &device)?;
    let mut cache = fresh_cache(2)?;

    let logits = model.forward(&ctx, TextModelInput::new(&token_ids, &positions), &mut cache)?;
    assert_eq!(logits.dims(), &[1, 0, VOCAB]);
    assert!(cache.sub(0)?.is_empty());
    Ok(())
}

#[test]
fn undersized_cache_is_a_cache_error() -> Result<()> {
    let (_, model) = build(two_layer_config())?;
    let ctx = ForwardContext::cpu();
    let device = Device::Cpu;
    let (token_ids, positions) = tokens(&[1, 2])?;
    let cross_state = Tensor::randn(0f32, 1.0, (1, 3, HIDDEN), &device)?;
    let mut cache = fresh_cache(1)?;

    let err = model
        .forward(
            &ctx,
            TextModelInput::new(&token_ids, &positions).with_cross_state(&cross_state),
            &mut cache,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ModelError::Cache(AttentionError::LayerOutOfRange { layer: 1, layers: 1 })
    ));
    Ok(())
}

#[test]
fn mismatched_positions_are_a_shape_error() -> Result<()> {
    let (_, model) = build(two_layer_config())?;
    let ctx = ForwardContext::cpu();
    let (token_ids, _) = tokens(&[1, 2, 3])?;
    let positions = Tensor::arange(0u32, 2, &Device::Cpu)?;
    let mut cache = fresh_cache(2)?;
    let err = model
        .forward(&ctx, TextModelInput::new(&token_ids, &positions), &mut cache)
        .unwrap_err();
    assert!(matches!(err, ModelError::Shape(_)));
    Ok(())
}

#[test]
fn bf16_parameters_decode_with_derived_policy() -> Result<()> {
    let device = Device::Cpu;
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::BF16, &device);
    let model = TextModel::new(two_layer_config(), vb)?;
    varmap.set_one(
        "blk.1.cross_attn_attn_gate",
        Tensor::new(&[0.5f32], &device)?.to_dtype(DType::BF16)?,
    )?;

    let ctx = ForwardContext::for_dtype(device.clone(), DType::BF16);
    assert_eq!(ctx.policy(), &PrecisionPolicy::from_parameter_dtype(DType::BF16));
    let (token_ids, positions) = tokens(&[2, 7, 1])?;
    let mask = build_causal_mask(&device, 3, 3)?;
    let cross_state = Tensor::randn(0f32, 1.0, (2, 3, HIDDEN), &device)?.to_dtype(DType::BF16)?;
    let mut cache = fresh_cache(2)?;

    let logits = model.forward(
        &ctx,
        TextModelInput::new(&token_ids, &positions)
            .with_mask(&mask)
            .with_cross_state(&cross_state),
        &mut cache,
    )?;
    assert_eq!(logits.dims(), &[1, 3, VOCAB]);
    assert_eq!(logits.dtype(), DType::BF16);
    let values = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| v.is_finite()));
    assert_eq!(cache.sub(0)?.len(), 3);
    Ok(())
}

#[test]
fn inputs_must_live_on_the_context_device() -> Result<()> {
    // Only meaningful when a second backend is compiled in.
    let Ok(accelerator) = Device::new_cuda(0).or_else(|_| Device::new_metal(0)) else {
        return Ok(());
    };
    let (_, model) = build(two_layer_config())?;
    let ctx = ForwardContext::new(accelerator, PrecisionPolicy::default());
    let (token_ids, positions) = tokens(&[1, 2])?;
    let err = model
        .forward(&ctx, TextModelInput::new(&token_ids, &positions), &mut fresh_cache(2)?)
        .unwrap_err();
    assert!(matches!(err, ModelError::Device(_)));
    Ok(())
}

#[test]
fn tied_read_out_reuses_token_embeddings() -> Result<()> {
    let mut config = two_layer_config();
    config.tie_word_embeddings = true;
    let (varmap, model) = build(config)?;
    assert!(!varmap.data().lock().unwrap().contains_key("output.weight"));

    let ctx = ForwardContext::cpu();
    let (token_ids, positions) = tokens(&[4, 8])?;
    let hidden = model.forward_hidden(&ctx, TextModelInput::new(&token_ids, &positions), &mut fresh_cache(2)?)?;
    let logits = model.forward(&ctx, TextModelInput::new(&token_ids, &positions), &mut fresh_cache(2)?)?;

    let table = varmap
        .data()
        .lock()
        .unwrap()
        .get("token_embd.weight")
        .map(|var| var.as_tensor().clone())
        .expect("embedding table");
    let expected = hidden.squeeze(0)?.matmul(&table.t()?)?.unsqueeze(0)?;
    assert!(max_diff(&logits, &expected)? < 1e-4);
    Ok(())
}

#[test]
fn self_attention_is_invariant_to_uniform_position_shift() -> Result<()> {
    let device = Device::Cpu;
    let config = TextModelConfig::new(VOCAB, HIDDEN, 32, 4, 1).with_kv_heads(2);
    let geometry = config.geometry();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let rope = RotaryEmbedding::new(
        RopeConfig {
            head_dim: geometry.head_dim,
            ..RopeConfig::default()
        },
        None,
        &device,
    )?;
    let attention = SelfAttention::load(geometry, rope, vb)?;
    let ctx = ForwardContext::cpu();
    let hidden = Tensor::randn(0f32, 1.0, (1, 4, HIDDEN), &device)?;
    let mask = build_causal_mask(&device, 4, 4)?;

    let mut cache_a = fresh_cache(1)?;
    let base = attention.forward(
        &ctx,
        &hidden,
        &Tensor::new(&[0u32, 1, 2, 3], &device)?,
        Some(&mask),
        cache_a.sub(0)?,
    )?;
    let mut cache_b = fresh_cache(1)?;
    let shifted = attention.forward(
        &ctx,
        &hidden,
        &Tensor::new(&[21u32, 22, 23, 24], &device)?,
        Some(&mask),
        cache_b.sub(0)?,
    )?;

    assert_eq!(base.dims(), &[1, 4, HIDDEN]);
    assert!(max_diff(&base, &shifted)? < 1e-3 * (1.0 + max_abs(&base)?));
    Ok(())
}

#[test]
fn batched_prompts_share_one_cross_state() -> Result<()> {
    let (_, model) = build(two_layer_config())?;
    let ctx = ForwardContext::cpu();
    let device = Device::Cpu;
    let token_ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &device)?;
    let positions = Tensor::arange(0u32, 3, &device)?;
    let cross_state = Tensor::randn(0f32, 1.0, (4, 2, HIDDEN), &device)?;
    let mask = build_causal_mask(&device, 3, 3)?;

    let logits = model.forward(
        &ctx,
        TextModelInput::new(&token_ids, &positions)
            .with_mask(&mask)
            .with_cross_state(&cross_state),
        &mut fresh_cache(2)?,
    )?;
    assert_eq!(logits.dims(), &[2, 3, VOCAB]);
    Ok(())
}
