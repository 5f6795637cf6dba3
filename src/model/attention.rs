//! Causal multi-head self-attention

use super::lora::LinearWithLoRA;
use candle_core::{Device, ModuleT, Result, Tensor, D};
use candle_nn::{linear_b, ops::softmax, Dropout, VarBuilder};

/// Multi-head causal self-attention with a combined output projection
///
/// All four projections are `LinearWithLoRA` so adapters can be attached
/// after the pretrained weights are loaded.
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    num_heads: usize,
    d_out: usize,
    head_dim: usize,
    w_query: LinearWithLoRA,
    w_key: LinearWithLoRA,
    w_value: LinearWithLoRA,
    out_proj: LinearWithLoRA,
    scaling: f64,
    dropout: Dropout,
    drop_p: f32,
}

impl MultiHeadAttention {
    pub fn new(
        d_in: usize,
        d_out: usize,
        drop_p: f32,
        num_heads: usize,
        qkv_bias: bool,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        if d_out % num_heads != 0 {
            candle_core::bail!("d_out ({d_out}) must be divisible by num_heads ({num_heads})")
        }
        let head_dim = d_out / num_heads;
        let w_query = linear_b(d_in, d_out, qkv_bias, vb.pp("query"))?;
        let w_key = linear_b(d_in, d_out, qkv_bias, vb.pp("key"))?;
        let w_value = linear_b(d_in, d_out, qkv_bias, vb.pp("value"))?;
        let out_proj = linear_b(d_out, d_out, true, vb.pp("out_proj"))?;
        Ok(Self {
            num_heads,
            d_out,
            head_dim,
            w_query: LinearWithLoRA::from_linear(w_query),
            w_key: LinearWithLoRA::from_linear(w_key),
            w_value: LinearWithLoRA::from_linear(w_value),
            out_proj: LinearWithLoRA::from_linear(out_proj),
            scaling: 1. / (head_dim as f64).sqrt(),
            dropout: Dropout::new(drop_p),
            drop_p,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn drop_p(&self) -> f32 {
        self.drop_p
    }

    pub fn disable_dropout(&mut self) {
        self.dropout = Dropout::new(0.);
        self.drop_p = 0.;
    }

    pub fn w_query(&self) -> &LinearWithLoRA {
        &self.w_query
    }

    pub fn w_key(&self) -> &LinearWithLoRA {
        &self.w_key
    }

    pub fn w_value(&self) -> &LinearWithLoRA {
        &self.w_value
    }

    pub fn out_proj(&self) -> &LinearWithLoRA {
        &self.out_proj
    }

    pub fn w_query_mut(&mut self) -> &mut LinearWithLoRA {
        &mut self.w_query
    }

    pub fn w_key_mut(&mut self) -> &mut LinearWithLoRA {
        &mut self.w_key
    }

    pub fn w_value_mut(&mut self) -> &mut LinearWithLoRA {
        &mut self.w_value
    }

    pub fn out_proj_mut(&mut self) -> &mut LinearWithLoRA {
        &mut self.out_proj
    }
}

impl ModuleT for MultiHeadAttention {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (b, num_tokens, _d_in) = xs.dims3()?;
        let split_heads = |t: Tensor| -> Result<Tensor> {
            t.reshape((b, num_tokens, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let queries = split_heads(self.w_query.forward_t(xs, train)?)?;
        let keys = split_heads(self.w_key.forward_t(xs, train)?)?;
        let values = split_heads(self.w_value.forward_t(xs, train)?)?;

        let attn_scores = queries.matmul(&keys.t()?.contiguous()?)?;
        let mask = get_mask(num_tokens, xs.device())?;
        let masked = masked_fill(
            &attn_scores,
            &mask.broadcast_left((b, self.num_heads))?,
            f32::NEG_INFINITY,
        )?;

        let attn_weights = softmax(&(masked * self.scaling)?, D::Minus1)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;

        // (b, num_heads, num_tokens, head_dim) -> (b, num_tokens, d_out)
        let context_vec = attn_weights
            .matmul(&values)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, num_tokens, self.d_out))?;
        self.out_proj.forward_t(&context_vec, train)
    }
}

/// Upper-triangular causal mask; `1` marks positions a token may not attend to
pub fn get_mask(size: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..size)
        .flat_map(|i| (0..size).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_slice(&mask, (size, size), device)
}

pub fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = mask.shape();
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}
