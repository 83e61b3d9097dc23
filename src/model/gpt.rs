//! GPT-2 backbone
//!
//! A decoder-only transformer returning the final hidden states, with LoRA
//! adapters injected at construction time through a [`LoraBuilder`].

use super::lora::{LinearLayer, LoraBuilder};
use crate::candle_addons::{causal_mask, masked_fill};
use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn::{embedding, ops::softmax, Dropout, Embedding, VarBuilder};
use core::f64;

const EPS: f64 = 1e-5;

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

    /// Returns configuration for GPT-2 medium
    pub fn gpt2_medium() -> Self {
        Self {
            emb_dim: 1_024,
            n_heads: 16,
            n_layers: 24,
            ..Self::gpt2_124m()
        }
    }

    /// Returns configuration for GPT-2 large
    pub fn gpt2_large() -> Self {
        Self {
            emb_dim: 1_280,
            n_heads: 20,
            n_layers: 36,
            ..Self::gpt2_124m()
        }
    }

    /// Returns configuration for GPT-2 x-large
    pub fn gpt2_xlarge() -> Self {
        Self {
            emb_dim: 1_600,
            n_heads: 25,
            n_layers: 48,
            ..Self::gpt2_124m()
        }
    }

    /// Returns a custom configuration for GPT-2 to be used in unit tests
    pub fn gpt_sm_test() -> Self {
        Self {
            vocab_size: 500,
            context_length: 16,
            emb_dim: 12,
            n_heads: 3,
            n_layers: 2,
            drop_rate: 0.0,
            qkv_bias: true,
        }
    }

    /// Maps a hub model id onto its architecture.
    pub fn from_model_id(model_id: &str) -> anyhow::Result<Self> {
        let name = model_id.rsplit('/').next().unwrap_or(model_id);
        match name {
            "gpt2" => Ok(Self::gpt2_124m()),
            "gpt2-medium" => Ok(Self::gpt2_medium()),
            "gpt2-large" => Ok(Self::gpt2_large()),
            "gpt2-xl" => Ok(Self::gpt2_xlarge()),
            _ => anyhow::bail!(
                "Unsupported model `{model_id}`; expected one of gpt2, gpt2-medium, gpt2-large, gpt2-xl"
            ),
        }
    }
}

/// A layer normalization struct
#[derive(Clone, Debug)]
pub struct LayerNorm {
    eps: f64,
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
        let centered = xs.broadcast_sub(&mean)?;
        // biased variance, as in the pretrained checkpoints
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let norm_xs = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        norm_xs
            .broadcast_mul(&self.scale)?
            .broadcast_add(&self.shift)
    }
}

/// The tanh approximation of GELU
#[derive(Clone, Debug)]
pub struct GELU;

impl Module for GELU {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let inner = ((2_f64 / f64::consts::PI).sqrt() * (xs + (xs.powf(3.0)? * 0.044715_f64)?)?)?;
        (0.5_f64 * xs)?.mul(&(inner.tanh()? + 1.0_f64)?)
    }
}

/// Causal multi-head self-attention
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    num_heads: usize,
    d_out: usize,
    head_dim: usize,
    w_query: LinearLayer,
    w_key: LinearLayer,
    w_value: LinearLayer,
    out_proj: LinearLayer,
    scaling: f64,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(
        d_in: usize,
        d_out: usize,
        drop_p: f32,
        num_heads: usize,
        qkv_bias: bool,
        lb: LoraBuilder<'_>,
    ) -> Result<Self> {
        if d_out % num_heads != 0 {
            candle_core::bail!("`d_out` must be divisible by `num_heads`")
        }
        let head_dim = d_out / num_heads;
        let w_query = lb.linear(d_in, d_out, qkv_bias, "query")?;
        let w_key = lb.linear(d_in, d_out, qkv_bias, "key")?;
        let w_value = lb.linear(d_in, d_out, qkv_bias, "value")?;
        let out_proj = lb.linear(d_out, d_out, true, "out_proj")?;
        Ok(Self {
            num_heads,
            d_out,
            head_dim,
            w_query,
            w_key,
            w_value,
            out_proj,
            scaling: 1. / (head_dim as f64).sqrt(),
            dropout: Dropout::new(drop_p),
        })
    }

    fn split_heads(&self, xs: &Tensor, b: usize, num_tokens: usize) -> Result<Tensor> {
        xs.reshape((b, num_tokens, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl ModuleT for MultiHeadAttention {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (b, num_tokens, _d_in) = xs.dims3()?;
        let queries = self.split_heads(&self.w_query.forward_t(xs, train)?, b, num_tokens)?;
        let keys = self.split_heads(&self.w_key.forward_t(xs, train)?, b, num_tokens)?;
        let values = self.split_heads(&self.w_value.forward_t(xs, train)?, b, num_tokens)?;

        let attn_scores = queries.matmul(&keys.t()?)?;
        let mask = causal_mask(num_tokens, xs.device())?.broadcast_as(attn_scores.shape())?;
        let masked = masked_fill(&attn_scores, &mask, f32::NEG_INFINITY)?;
        let attn_weights = softmax(&(masked * self.scaling)?, D::Minus1)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;

        let context_vec = attn_weights
            .matmul(&values)?
            .transpose(1, 2)?
            .reshape((b, num_tokens, self.d_out))?;
        self.out_proj.forward_t(&context_vec, train)
    }
}

/// A feed forward neural network module
#[derive(Clone, Debug)]
pub struct FeedForward {
    first_layer: LinearLayer,
    second_layer: LinearLayer,
}

impl FeedForward {
    pub fn new(cfg: Config, lb: LoraBuilder<'_>) -> Result<Self> {
        let first_layer = lb.linear(cfg.emb_dim, 4_usize * cfg.emb_dim, true, "first_layer")?;
        let second_layer = lb.linear(4_usize * cfg.emb_dim, cfg.emb_dim, true, "second_layer")?;
        Ok(Self {
            first_layer,
            second_layer,
        })
    }
}

impl ModuleT for FeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.first_layer.forward_t(xs, train)?;
        let xs = GELU.forward(&xs)?;
        self.second_layer.forward_t(&xs, train)
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
    pub fn new(cfg: Config, lb: LoraBuilder<'_>) -> Result<Self> {
        let att = MultiHeadAttention::new(
            cfg.emb_dim,
            cfg.emb_dim,
            cfg.drop_rate,
            cfg.n_heads,
            cfg.qkv_bias,
            lb.pp("mha"),
        )?;
        let ff = FeedForward::new(cfg, lb.pp("ff"))?;
        let norm1 = LayerNorm::new(cfg.emb_dim, lb.base().pp("norm1"))?;
        let norm2 = LayerNorm::new(cfg.emb_dim, lb.base().pp("norm2"))?;
        Ok(Self {
            att,
            ff,
            norm1,
            norm2,
            drop_shortcut: Dropout::new(cfg.drop_rate),
        })
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

/// The GPT backbone, without a language modelling head
#[derive(Clone, Debug)]
pub struct GPTModel {
    cfg: Config,
    tok_emb: Embedding,
    pos_emb: Embedding,
    drop_emb: Dropout,
    trf_blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
}

impl GPTModel {
    /// Creates a new `GPTModel`
    ///
    /// ```rust
    /// use candle_core::{Device, DType};
    /// use candle_nn::{VarBuilder, VarMap};
    /// use reward_model_rs::model::gpt::{Config, GPTModel};
    /// use reward_model_rs::model::lora::{LoraBuilder, LoraConfig};
    ///
    /// let dev = Device::Cpu;
    /// let (base, adapter) = (VarMap::new(), VarMap::new());
    /// let lb = LoraBuilder::new(
    ///     VarBuilder::from_varmap(&base, DType::F32, &dev),
    ///     VarBuilder::from_varmap(&adapter, DType::F32, &dev),
    ///     LoraConfig::default(),
    /// );
    /// let model = GPTModel::new(Config::gpt_sm_test(), lb).unwrap();
    /// ```
    pub fn new(cfg: Config, lb: LoraBuilder<'_>) -> Result<Self> {
        let tok_emb = embedding(cfg.vocab_size, cfg.emb_dim, lb.base().pp("tok_emb"))?;
        let pos_emb = embedding(cfg.context_length, cfg.emb_dim, lb.base().pp("pos_emb"))?;
        let trf_blocks = (0..cfg.n_layers)
            .map(|ix| TransformerBlock::new(cfg, lb.pp(format!("trf.{ix}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = LayerNorm::new(cfg.emb_dim, lb.base().pp("final_norm"))?;
        Ok(Self {
            cfg,
            tok_emb,
            pos_emb,
            drop_emb: Dropout::new(cfg.drop_rate),
            trf_blocks,
            final_norm,
        })
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }
}

impl ModuleT for GPTModel {
    /// Returns hidden states of shape `(batch, seq_len, emb_dim)`.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_batch_size, seq_len) = xs.dims2()?;
        if seq_len > self.cfg.context_length {
            candle_core::bail!(
                "sequence length {seq_len} exceeds the context length {}",
                self.cfg.context_length
            )
        }
        let tok_embeds = self.tok_emb.forward(xs)?;
        let pos_ids = Tensor::arange(0u32, seq_len as u32, xs.device())?;
        let pos_embeds = self.pos_emb.embeddings().index_select(&pos_ids, 0)?;

        let mut x = tok_embeds.broadcast_add(&pos_embeds)?;
        x = self.drop_emb.forward(&x, train)?;
        for block in self.trf_blocks.iter() {
            x = block.forward_t(&x, train)?;
        }
        self.final_norm.forward(&x)
    }
}
