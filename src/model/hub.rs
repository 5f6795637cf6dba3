//! Loading pretrained GPT-2 checkpoints
//!
//! `model_name_or_path` is either a local directory holding `config.json`
//! and `model.safetensors`, or a Hugging Face hub repo id. Checkpoint tensors
//! use the Hugging Face naming and `Conv1D` (in x out) weight layout; they are
//! renamed and transposed into this crate's layout and loaded as constants,
//! so the base model never receives gradients.

use super::{Config, GPTModel};
use anyhow::{anyhow, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::api::sync::ApiBuilder;
use std::{
    collections::HashMap,
    fs::read_to_string,
    path::{Path, PathBuf},
};

pub const CONFIG_FILENAME: &str = "config.json";
pub const WEIGHTS_FILENAME: &str = "model.safetensors";

/// Local paths of a checkpoint's config and weights
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
}

/// Finds the checkpoint locally or downloads it from the hub
///
/// `cache_dir` follows `HF_HOME` semantics: downloads land in its `hub`
/// subdirectory.
pub fn resolve_model_files(
    model_name_or_path: &str,
    cache_dir: Option<&str>,
    token: Option<&str>,
) -> anyhow::Result<ModelFiles> {
    let local = Path::new(model_name_or_path);
    if local.is_dir() {
        let files = ModelFiles {
            config: local.join(CONFIG_FILENAME),
            weights: local.join(WEIGHTS_FILENAME),
        };
        for path in [&files.config, &files.weights] {
            if !path.exists() {
                return Err(anyhow!("Missing checkpoint file {}", path.display()));
            }
        }
        return Ok(files);
    }

    tracing::info!(repo = model_name_or_path, "resolving model from the hub");
    let mut builder = ApiBuilder::new().with_token(token.map(str::to_string));
    if let Some(dir) = cache_dir {
        builder = builder.with_cache_dir(Path::new(dir).join("hub"));
    }
    let api = builder.build()?;
    let repo = api.model(model_name_or_path.to_string());
    let config = repo
        .get(CONFIG_FILENAME)
        .with_context(|| format!("Unable to fetch {CONFIG_FILENAME} for {model_name_or_path}"))?;
    let weights = repo
        .get(WEIGHTS_FILENAME)
        .with_context(|| format!("Unable to fetch {WEIGHTS_FILENAME} for {model_name_or_path}"))?;
    Ok(ModelFiles { config, weights })
}

fn take(weights: &mut HashMap<String, Tensor>, name: &str) -> anyhow::Result<Tensor> {
    if let Some(t) = weights.remove(name) {
        return Ok(t);
    }
    weights
        .remove(&format!("transformer.{name}"))
        .ok_or_else(|| anyhow!("Checkpoint is missing tensor `{name}`"))
}

/// Renames Hugging Face GPT-2 tensors to the `GPTModel` variable layout
pub fn gpt2_tensors_to_model_tensors(
    mut hf: HashMap<String, Tensor>,
    cfg: &Config,
) -> anyhow::Result<HashMap<String, Tensor>> {
    let mut out = HashMap::new();
    let wte = take(&mut hf, "wte.weight")?.to_dtype(DType::F32)?;
    out.insert("tok_emb.weight".to_string(), wte.clone());
    // GPT-2 ties the output head to the token embedding
    out.insert("out_head.weight".to_string(), wte);
    out.insert(
        "pos_emb.weight".to_string(),
        take(&mut hf, "wpe.weight")?.to_dtype(DType::F32)?,
    );

    for ix in 0..cfg.n_layers {
        let src = format!("h.{ix}");
        let dst = format!("trf.{ix}");
        let mut get = |name: &str| -> anyhow::Result<Tensor> {
            Ok(take(&mut hf, &format!("{src}.{name}"))?.to_dtype(DType::F32)?)
        };

        let c_attn_w = get("attn.c_attn.weight")?.chunk(3, 1)?;
        let c_attn_b = get("attn.c_attn.bias")?.chunk(3, 0)?;
        for (j, proj) in ["query", "key", "value"].iter().enumerate() {
            out.insert(
                format!("{dst}.mha.{proj}.weight"),
                c_attn_w[j].t()?.contiguous()?,
            );
            out.insert(format!("{dst}.mha.{proj}.bias"), c_attn_b[j].contiguous()?);
        }
        out.insert(
            format!("{dst}.mha.out_proj.weight"),
            get("attn.c_proj.weight")?.t()?.contiguous()?,
        );
        out.insert(format!("{dst}.mha.out_proj.bias"), get("attn.c_proj.bias")?);

        out.insert(
            format!("{dst}.ff.first_layer.weight"),
            get("mlp.c_fc.weight")?.t()?.contiguous()?,
        );
        out.insert(format!("{dst}.ff.first_layer.bias"), get("mlp.c_fc.bias")?);
        out.insert(
            format!("{dst}.ff.second_layer.weight"),
            get("mlp.c_proj.weight")?.t()?.contiguous()?,
        );
        out.insert(format!("{dst}.ff.second_layer.bias"), get("mlp.c_proj.bias")?);

        out.insert(format!("{dst}.norm1.scale"), get("ln_1.weight")?);
        out.insert(format!("{dst}.norm1.shift"), get("ln_1.bias")?);
        out.insert(format!("{dst}.norm2.scale"), get("ln_2.weight")?);
        out.insert(format!("{dst}.norm2.shift"), get("ln_2.bias")?);
    }

    out.insert(
        "final_norm.scale".to_string(),
        take(&mut hf, "ln_f.weight")?.to_dtype(DType::F32)?,
    );
    out.insert(
        "final_norm.shift".to_string(),
        take(&mut hf, "ln_f.bias")?.to_dtype(DType::F32)?,
    );
    Ok(out)
}

/// Loads a GPT-2 checkpoint into a frozen `GPTModel`
pub fn load_pretrained_gpt2(
    files: &ModelFiles,
    device: &Device,
) -> anyhow::Result<(Config, GPTModel)> {
    let config_json = read_to_string(&files.config)
        .with_context(|| format!("Unable to read {}", files.config.display()))?;
    let cfg = Config::from_hf_json(&config_json)?;
    let hf_tensors = candle_core::safetensors::load(&files.weights, device)
        .with_context(|| format!("Unable to load {}", files.weights.display()))?;
    let tensors = gpt2_tensors_to_model_tensors(hf_tensors, &cfg)?;
    let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
    let model = GPTModel::new(cfg, vb)?;
    tracing::info!(
        layers = cfg.n_layers,
        emb_dim = cfg.emb_dim,
        context_length = cfg.context_length,
        "loaded pretrained weights"
    );
    Ok((cfg, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::{IndexOp, ModuleT};
    use rstest::*;

    /// Random tensors shaped like a Hugging Face GPT-2 checkpoint
    fn fake_hf_checkpoint(cfg: &Config, prefix: &str) -> Result<HashMap<String, Tensor>> {
        let dev = Device::Cpu;
        let emb = cfg.emb_dim;
        let mut m = HashMap::new();
        let mut put = |name: String, shape: &[usize]| -> Result<()> {
            m.insert(format!("{prefix}{name}"), Tensor::randn(0f32, 0.02, shape, &dev)?);
            Ok(())
        };
        put("wte.weight".into(), &[cfg.vocab_size, emb])?;
        put("wpe.weight".into(), &[cfg.context_length, emb])?;
        for ix in 0..cfg.n_layers {
            put(format!("h.{ix}.attn.c_attn.weight"), &[emb, 3 * emb])?;
            put(format!("h.{ix}.attn.c_attn.bias"), &[3 * emb])?;
            put(format!("h.{ix}.attn.c_proj.weight"), &[emb, emb])?;
            put(format!("h.{ix}.attn.c_proj.bias"), &[emb])?;
            put(format!("h.{ix}.mlp.c_fc.weight"), &[emb, 4 * emb])?;
            put(format!("h.{ix}.mlp.c_fc.bias"), &[4 * emb])?;
            put(format!("h.{ix}.mlp.c_proj.weight"), &[4 * emb, emb])?;
            put(format!("h.{ix}.mlp.c_proj.bias"), &[emb])?;
            for ln in ["ln_1", "ln_2"] {
                put(format!("h.{ix}.{ln}.weight"), &[emb])?;
                put(format!("h.{ix}.{ln}.bias"), &[emb])?;
            }
        }
        put("ln_f.weight".into(), &[emb])?;
        put("ln_f.bias".into(), &[emb])?;
        Ok(m)
    }

    #[rstest]
    #[case("")]
    #[case("transformer.")]
    fn test_gpt2_tensors_build_a_model(#[case] prefix: &str) -> Result<()> {
        let cfg = Config::gpt_sm_test();
        let hf = fake_hf_checkpoint(&cfg, prefix)?;
        let c_attn = hf[&format!("{prefix}h.0.attn.c_attn.weight")].clone();

        let tensors = gpt2_tensors_to_model_tensors(hf, &cfg)?;

        // key projection is the transposed middle third of c_attn
        let expected_key = c_attn.i((.., cfg.emb_dim..2 * cfg.emb_dim))?.t()?;
        let diff = (tensors["trf.0.mha.key.weight"].clone() - expected_key)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.);

        let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
        let model = GPTModel::new(cfg, vb)?;
        let ids = Tensor::new(&[[1_u32, 2, 3]], &Device::Cpu)?;
        assert_eq!(
            model.forward_t(&ids, false)?.dims(),
            &[1, 3, cfg.vocab_size]
        );
        Ok(())
    }

    #[rstest]
    fn test_missing_tensor_is_reported() -> Result<()> {
        let cfg = Config::gpt_sm_test();
        let mut hf = fake_hf_checkpoint(&cfg, "")?;
        hf.remove("h.1.ln_2.bias");
        let err = gpt2_tensors_to_model_tensors(hf, &cfg).unwrap_err();
        assert!(err.to_string().contains("h.1.ln_2.bias"));
        Ok(())
    }

    #[rstest]
    fn test_load_from_local_dir() -> Result<()> {
        let cfg = Config::gpt_sm_test();
        let dir = tempfile::tempdir()?;
        let config_json = serde_json::json!({
            "vocab_size": cfg.vocab_size,
            "n_positions": cfg.context_length,
            "n_embd": cfg.emb_dim,
            "n_head": cfg.n_heads,
            "n_layer": cfg.n_layers,
        });
        std::fs::write(dir.path().join(CONFIG_FILENAME), config_json.to_string())?;
        candle_core::safetensors::save(
            &fake_hf_checkpoint(&cfg, "")?,
            dir.path().join(WEIGHTS_FILENAME),
        )?;

        let path = dir.path().to_str().unwrap();
        let files = resolve_model_files(path, None, None)?;
        let (loaded_cfg, _model) = load_pretrained_gpt2(&files, &Device::Cpu)?;
        assert_eq!(loaded_cfg, cfg);
        Ok(())
    }

    #[rstest]
    fn test_local_dir_without_weights_errors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(CONFIG_FILENAME), "{}")?;
        let path = dir.path().to_str().unwrap();
        assert!(resolve_model_files(path, None, None).is_err());
        Ok(())
    }
}
