//! GPT-2 style backbone with a swappable output head.
//!
//! The same backbone serves two roles: with the default language-modelling
//! head it powers the chat demo, and with a scalar value head (see
//! [`modify_out_head_for_reward`]) it produces the per-token values consumed
//! by the pairwise ranking loss.

use crate::attention::MultiHeadAttention;
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{
    embedding, layer_norm, linear_b, Activation, Dropout, Embedding, LayerNorm, LayerNormConfig,
    Linear, VarBuilder,
};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Config for specifying parameters of a GPT-2 model.
#[derive(Debug, Clone, Copy)]
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
    /// Returns configuration for GPT-2 small.
    pub fn gpt2_124m() -> Self {
        Self {
            vocab_size: 50_257,
            context_length: 1_024,
            emb_dim: 768,
            n_heads: 12,
            n_layers: 12,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }

    /// Returns configuration for GPT-2 medium.
    pub fn gpt2_medium() -> Self {
        Self {
            vocab_size: 50_257,
            context_length: 1_024,
            emb_dim: 1_024,
            n_heads: 16,
            n_layers: 24,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }

    /// Returns a small custom configuration to be used in unit tests.
    pub fn gpt_sm_test() -> Self {
        Self {
            vocab_size: 500,
            context_length: 10,
            emb_dim: 12,
            n_heads: 3,
            n_layers: 2,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }
}

/// Explicit layer enum for the feed forward network.
#[derive(Clone, Debug)]
pub enum FFLayer {
    Linear(Linear),
    Gelu(Activation),
}

impl Module for FFLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            FFLayer::Linear(l) => l.forward(xs),
            FFLayer::Gelu(g) => g.forward(xs),
        }
    }
}

/// Position-wise feed forward network with a 4x expansion and GELU.
#[derive(Clone, Debug)]
pub struct FeedForward {
    layers: Vec<FFLayer>,
}

impl FeedForward {
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let layers = vec![
            FFLayer::Linear(linear_b(
                cfg.emb_dim,
                4_usize * cfg.emb_dim,
                true,
                vb.pp("first_layer"),
            )?),
            FFLayer::Gelu(Activation::Gelu),
            FFLayer::Linear(linear_b(
                4_usize * cfg.emb_dim,
                cfg.emb_dim,
                true,
                vb.pp("second_layer"),
            )?),
        ];
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &Vec<FFLayer> {
        &self.layers
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }
}

/// Pre-norm transformer block with residual shortcuts.
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
        let ln_cfg = LayerNormConfig::from(LAYER_NORM_EPS);
        let norm1 = layer_norm(cfg.emb_dim, ln_cfg, vb.pp("norm1"))?;
        let norm2 = layer_norm(cfg.emb_dim, ln_cfg, vb.pp("norm2"))?;
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
}

impl ModuleT for TransformerBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let shortcut = xs.to_owned();
        let mut x = self.norm1.forward(xs)?;
        x = self.att.forward_t(&x, train)?;
        x = self.drop_shortcut.forward(&x, train)?;
        x = (x + shortcut)?;

        let shortcut = x.clone();
        let mut y = self.norm2.forward(&x)?;
        y = self.ff.forward(&y)?;
        y = self.drop_shortcut.forward(&y, train)?;
        y + shortcut
    }
}

/// Explicit sequential container for transformer blocks.
#[derive(Clone, Debug)]
pub struct SequentialTransformers {
    layers: Vec<TransformerBlock>,
}

/// Creates a new empty sequential layer.
pub fn seqtransformers() -> SequentialTransformers {
    SequentialTransformers { layers: vec![] }
}

impl SequentialTransformers {
    #[allow(clippy::should_implement_trait)]
    pub fn add(mut self, layer: TransformerBlock) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl ModuleT for SequentialTransformers {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            xs = layer.forward_t(&xs, train)?
        }
        Ok(xs)
    }
}

/// The GPT model: embeddings, transformer stack, final norm and output head.
pub struct GPTModel {
    tok_emb: Embedding,
    pos_emb: Embedding,
    drop_emb: Dropout,
    trf_blocks: SequentialTransformers,
    final_norm: LayerNorm,
    out_head: Linear,
}

impl GPTModel {
    /// Creates a new `GPTModel` with a language-modelling head.
    ///
    /// ```rust
    /// use candle_core::{Device, DType};
    /// use candle_nn::{VarBuilder, VarMap};
    /// use pairtune::model::{Config, GPTModel};
    ///
    /// let varmap = VarMap::new();
    /// let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    /// let model = GPTModel::new(Config::gpt_sm_test(), vb.pp("model")).unwrap();
    /// ```
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let tok_emb = embedding(cfg.vocab_size, cfg.emb_dim, vb.pp("tok_emb"))?;
        let pos_emb = embedding(cfg.context_length, cfg.emb_dim, vb.pp("pos_emb"))?;
        let drop_emb = Dropout::new(cfg.drop_rate);
        let mut trf_blocks = seqtransformers();
        for ix in 0..cfg.n_layers {
            trf_blocks = trf_blocks.add(TransformerBlock::new(cfg, vb.pp(format!("trf.{}", ix)))?);
        }
        let final_norm = layer_norm(
            cfg.emb_dim,
            LayerNormConfig::from(LAYER_NORM_EPS),
            vb.pp("final_norm"),
        )?;
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

    pub fn pos_emb(&self) -> &Embedding {
        &self.pos_emb
    }

    pub fn tok_emb(&self) -> &Embedding {
        &self.tok_emb
    }

    pub fn trf_blocks(&self) -> &SequentialTransformers {
        &self.trf_blocks
    }

    pub fn out_head(&self) -> &Linear {
        &self.out_head
    }

    pub fn set_out_head(&mut self, new_out_head: Linear) {
        self.out_head = new_out_head;
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, true)
    }
}

impl ModuleT for GPTModel {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_batch_size, seq_len) = xs.dims2()?;
        let tok_embeds = self.tok_emb.forward(xs)?;
        let pos_ids = Tensor::arange(0_u32, seq_len as u32, xs.device())?;
        let pos_embeds = self.pos_emb.embeddings().index_select(&pos_ids, 0)?;

        let mut x = tok_embeds.broadcast_add(&pos_embeds)?;
        x = self.drop_emb.forward(&x, train)?;
        x = self.trf_blocks.forward_t(&x, train)?;
        x = self.final_norm.forward(&x)?;

        self.out_head.forward(&x)
    }
}

/// Swaps the language-modelling head for a scalar value head so the model
/// emits one value per token position. Forward outputs then have shape
/// `(batch, seq_len, 1)`; the pairwise loss squeezes the last dimension.
pub fn modify_out_head_for_reward(
    model: &mut GPTModel,
    cfg: Config,
    vb: VarBuilder<'_>,
) -> Result<()> {
    let reward_head = linear_b(cfg.emb_dim, 1_usize, false, vb.pp("reward_head"))?;
    model.set_out_head(reward_head);
    Ok(())
}
