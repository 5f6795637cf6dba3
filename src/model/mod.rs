//! GPT-2 style causal language model
//!
//! The architecture mirrors the Hugging Face GPT-2 checkpoints so pretrained
//! weights can be loaded with `hub::load_pretrained_gpt2`. Every linear
//! projection is a `LinearWithLoRA`, which lets `GPTModel::attach_lora` turn
//! a loaded model into a parameter-efficient fine-tuning target in place.

pub mod attention;
pub mod hub;
pub mod lora;

use attention::MultiHeadAttention;
use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn::{embedding, linear_b, Dropout, Embedding, Linear, VarBuilder};
use core::f64;
use lora::{LinearWithLoRA, LoRAConfig, TargetModule};
use serde::Deserialize;

const EPS: f32 = 1e-5;

/// Config for specifying parameters of a GPT-2 model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub vocab_size: usize,
    pub context_length: usize,
    pub emb_dim: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub drop_rate: f32,
    pub qkv_bias: bool,
}

/// The subset of a Hugging Face GPT-2 `config.json` the model needs
#[derive(Debug, Deserialize)]
pub struct HfGpt2Config {
    pub vocab_size: usize,
    #[serde(alias = "n_ctx")]
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    #[serde(default = "default_pdrop")]
    pub resid_pdrop: f32,
}

fn default_pdrop() -> f32 {
    0.1
}

impl From<HfGpt2Config> for Config {
    fn from(value: HfGpt2Config) -> Self {
        Self {
            vocab_size: value.vocab_size,
            context_length: value.n_positions,
            emb_dim: value.n_embd,
            n_heads: value.n_head,
            n_layers: value.n_layer,
            drop_rate: value.resid_pdrop,
            qkv_bias: true,
        }
    }
}

impl Config {
    /// Returns configuration for GPT-2 small
    pub fn gpt2_124m() -> Self {
        Self {
            vocab_size: 50_257,
            context_length: 1_024,
            emb_dim: 768,
            n_heads: 12,
            n_layers: 12,
            drop_rate: 0.1,
            qkv_bias: true,
        }
    }

    /// Parses a Hugging Face GPT-2 `config.json`
    pub fn from_hf_json(json: &str) -> anyhow::Result<Self> {
        let hf_config: HfGpt2Config = serde_json::from_str(json)?;
        Ok(hf_config.into())
    }

    /// Returns a custom configuration for GPT-2 to be used in unit tests
    pub fn gpt_sm_test() -> Self {
        Self {
            vocab_size: 500,
            context_length: 32,
            emb_dim: 12,
            n_heads: 3,
            n_layers: 2,
            drop_rate: 0.1,
            qkv_bias: true,
        }
    }
}

/// A layer normalization struct
#[derive(Clone, Debug)]
pub struct LayerNorm {
    eps: f32,
    scale: Tensor,
    shift: Tensor,
}

impl LayerNorm {
    pub fn new(emb_dim: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let scale = vb.get_with_hints(emb_dim, "scale", candle_nn::Init::Const(1.))?;
        let shift = vb.get_with_hints(emb_dim, "shift", candle_nn::Init::Const(0.))?;
        Ok(Self {
            eps: EPS,
            scale,
            shift,
        })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let var = xs.broadcast_sub(&mean)?.sqr()?.mean_keepdim(D::Minus1)?;
        let norm_xs = xs
            .broadcast_sub(&mean)?
            .broadcast_div(&(var + self.eps as f64)?.sqrt()?)?;
        norm_xs
            .broadcast_mul(&self.scale)?
            .broadcast_add(&self.shift)
    }
}

/// The tanh approximation of GELU used by GPT-2
#[derive(Clone, Debug)]
pub struct GELU;

impl Module for GELU {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let cubed = xs.mul(xs)?.mul(xs)?;
        let inner = ((xs + (cubed * 0.044715f64)?)? * (2_f64 / f64::consts::PI).sqrt())?;
        (0.5_f64 * xs)?.mul(&(inner.tanh()? + 1.0_f64)?)
    }
}

/// Explicit `FFLayer` enum
///
/// Kept as concrete types rather than a `candle_nn::Sequential` of trait
/// objects so that adapters can be attached to the linear layers.
#[derive(Clone, Debug)]
pub enum FFLayer {
    Linear(LinearWithLoRA),
    GELU(GELU),
}

impl ModuleT for FFLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            FFLayer::GELU(g) => g.forward(xs),
            FFLayer::Linear(l) => l.forward_t(xs, train),
        }
    }
}

/// A feed forward neural network module
#[derive(Clone, Debug)]
pub struct FeedForward {
    layers: Vec<FFLayer>,
}

impl FeedForward {
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let first: Linear = linear_b(cfg.emb_dim, 4_usize * cfg.emb_dim, true, vb.pp("first_layer"))?;
        let second: Linear =
            linear_b(4_usize * cfg.emb_dim, cfg.emb_dim, true, vb.pp("second_layer"))?;
        let layers = vec![
            FFLayer::Linear(LinearWithLoRA::from_linear(first)),
            FFLayer::GELU(GELU),
            FFLayer::Linear(LinearWithLoRA::from_linear(second)),
        ];
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &Vec<FFLayer> {
        &self.layers
    }

    fn attach_lora(&mut self, cfg: &LoRAConfig, vb: VarBuilder<'_>) -> Result<()> {
        let names = [
            (TargetModule::FfIn, "first_layer"),
            (TargetModule::FfOut, "second_layer"),
        ];
        let linears = self.layers.iter_mut().filter_map(|layer| match layer {
            FFLayer::Linear(l) => Some(l),
            FFLayer::GELU(_) => None,
        });
        for (linear, (target, name)) in linears.zip(names) {
            if cfg.targets(target) {
                linear.attach_lora(cfg, vb.pp(name))?;
            }
        }
        Ok(())
    }
}

impl ModuleT for FeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            xs = layer.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}

/// The transformer block component of GPT
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    att: MultiHeadAttention,
    ff: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    drop_shortcut: Dropout,
}

impl TransformerBlock {
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let att = MultiHeadAttention::new(
            cfg.emb_dim,
            cfg.emb_dim,
            cfg.drop_rate,
            cfg.n_heads,
            cfg.qkv_bias,
            vb.pp("mha"),
        )?;
        let ff = FeedForward::new(cfg, vb.pp("ff"))?;
        let norm1 = LayerNorm::new(cfg.emb_dim, vb.pp("norm1"))?;
        let norm2 = LayerNorm::new(cfg.emb_dim, vb.pp("norm2"))?;
        let drop_shortcut = Dropout::new(cfg.drop_rate);
        Ok(Self {
            att,
            ff,
            norm1,
            norm2,
            drop_shortcut,
        })
    }

    pub fn att(&self) -> &MultiHeadAttention {
        &self.att
    }

    pub fn ff(&self) -> &FeedForward {
        &self.ff
    }

    fn disable_dropout(&mut self) {
        self.att.disable_dropout();
        self.drop_shortcut = Dropout::new(0.);
    }

    fn attach_lora(&mut self, cfg: &LoRAConfig, vb: VarBuilder<'_>) -> Result<()> {
        let mha_vb = vb.pp("mha");
        if cfg.targets(TargetModule::Query) {
            self.att.w_query_mut().attach_lora(cfg, mha_vb.pp("query"))?;
        }
        if cfg.targets(TargetModule::Key) {
            self.att.w_key_mut().attach_lora(cfg, mha_vb.pp("key"))?;
        }
        if cfg.targets(TargetModule::Value) {
            self.att.w_value_mut().attach_lora(cfg, mha_vb.pp("value"))?;
        }
        if cfg.targets(TargetModule::OutProj) {
            self.att.out_proj_mut().attach_lora(cfg, mha_vb.pp("out_proj"))?;
        }
        self.ff.attach_lora(cfg, vb.pp("ff"))
    }
}

impl ModuleT for TransformerBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let shortcut = xs.to_owned();
        let mut x = self.norm1.forward(xs)?;
        x = self.att.forward_t(&x, train)?;
        x = self.drop_shortcut.forward(&x, train)?;
        x = (x + shortcut)?;

        let shortcut = x.clone();
        x = self.norm2.forward(&x)?;
        x = self.ff.forward_t(&x, train)?;
        x = self.drop_shortcut.forward(&x, train)?;
        x + shortcut
    }
}

/// The GPT model architecture implementation
pub struct GPTModel {
    tok_emb: Embedding,
    pos_emb: Embedding,
    drop_emb: Dropout,
    trf_blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
    out_head: Linear,
}

impl GPTModel {
    /// Creates a new `GPTModel`
    ///
    /// ```rust
    /// use candle_core::{Device, DType};
    /// use candle_nn::{VarBuilder, VarMap};
    /// use jpo_rs::model::{Config, GPTModel};
    ///
    /// let varmap = VarMap::new();
    /// let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    ///
    /// let cfg = Config::gpt_sm_test();
    /// let model = GPTModel::new(cfg, vb).unwrap();
    /// ```
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let tok_emb = embedding(cfg.vocab_size, cfg.emb_dim, vb.pp("tok_emb"))?;
        let pos_emb = embedding(cfg.context_length, cfg.emb_dim, vb.pp("pos_emb"))?;
        let drop_emb = Dropout::new(cfg.drop_rate);
        let trf_blocks = (0..cfg.n_layers)
            .map(|ix| TransformerBlock::new(cfg, vb.pp(format!("trf.{}", ix))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = LayerNorm::new(cfg.emb_dim, vb.pp("final_norm"))?;
        let out_head = linear_b(cfg.emb_dim, cfg.vocab_size, false, vb.pp("out_head"))?;
        Ok(Self {
            tok_emb,
            pos_emb,
            drop_emb,
            trf_blocks,
            final_norm,
            out_head,
        })
    }

    pub fn trf_blocks(&self) -> &[TransformerBlock] {
        &self.trf_blocks
    }

    pub fn out_head(&self) -> &Linear {
        &self.out_head
    }

    /// Zeroes the embedding, attention and residual dropout of the base
    /// model. Adapter dropout is left as configured.
    pub fn disable_dropout(&mut self) {
        self.drop_emb = Dropout::new(0.);
        for block in self.trf_blocks.iter_mut() {
            block.disable_dropout();
        }
    }

    /// Attaches adapters to every targeted projection.
    ///
    /// Adapter variables are created under `vb` with the same `trf.{ix}`
    /// layout as the base model, so `vb` should come from a dedicated
    /// `VarMap` that holds only trainable weights.
    pub fn attach_lora(&mut self, cfg: &LoRAConfig, vb: VarBuilder<'_>) -> Result<()> {
        for (ix, block) in self.trf_blocks.iter_mut().enumerate() {
            block.attach_lora(cfg, vb.pp(format!("trf.{}", ix)))?;
        }
        Ok(())
    }
}

impl ModuleT for GPTModel {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_batch_size, seq_len) = xs.dims2()?;
        let tok_embeds = self.tok_emb.forward(xs)?;
        let pos_ids = Tensor::arange(0u32, seq_len as u32, xs.device())?;
        let pos_embeds = self.pos_emb.embeddings().index_select(&pos_ids, 0)?;

        let mut x = tok_embeds.broadcast_add(&pos_embeds)?;
        x = self.drop_emb.forward(&x, train)?;
        for block in self.trf_blocks.iter() {
            x = block.forward_t(&x, train)?;
        }
        x = self.final_norm.forward(&x)?;

        self.out_head.forward(&x)
    }
}
