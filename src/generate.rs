//! Token generation with temperature and nucleus sampling, plus a streaming
//! decoder that emits text chunks as soon as they decode cleanly.

use crate::model::GPTModel;
use candle_core::{IndexOp, ModuleT, Tensor, D};
use candle_nn::ops::softmax;
use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};
use std::sync::{mpsc::SyncSender, Arc};
use tiktoken_rs::CoreBPE;

/// GPT-2 `<|endoftext|>`.
pub const EOS_TOKEN_ID: u32 = 50_256;

pub fn text_to_token_ids(
    text: &str,
    tokenizer: &CoreBPE,
    device: &candle_core::Device,
) -> candle_core::Result<Tensor> {
    let encoded = tokenizer.encode_with_special_tokens(text);
    let num_tokens = encoded.len();
    // (1, num_tokens) to create a batch dimension
    Tensor::from_vec(encoded, (1_usize, num_tokens), device)
}

pub fn token_ids_to_text(token_ids: Tensor, tokenizer: &CoreBPE) -> anyhow::Result<String> {
    let flat = token_ids.squeeze(0)?;
    tokenizer.decode(flat.to_vec1::<u32>()?)
}

/// Draws one index from an unnormalized discrete distribution.
pub fn sample_multinomial(rng: &mut StdRng, prs: &[f32]) -> candle_core::Result<u32> {
    let distr = WeightedIndex::new(prs).map_err(candle_core::Error::wrap)?;
    Ok(distr.sample(rng) as u32)
}

/// Nucleus (top-p) filter: keeps the smallest set of tokens whose cumulative
/// probability reaches `top_p` and zeroes out the rest. The survivors are
/// left unnormalized; the sampler renormalizes.
pub fn apply_top_p(prs: &[f32], top_p: f32) -> Vec<f32> {
    if top_p >= 1_f32 {
        return prs.to_vec();
    }
    let mut indices: Vec<usize> = (0..prs.len()).collect();
    indices.sort_by(|&a, &b| prs[b].total_cmp(&prs[a]));

    let mut filtered = vec![0_f32; prs.len()];
    let mut cumulative = 0_f32;
    for ix in indices {
        filtered[ix] = prs[ix];
        cumulative += prs[ix];
        if cumulative >= top_p {
            break;
        }
    }
    filtered
}

/// Sampling settings for one generation run.
#[derive(Clone, Debug)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// Number of trailing prompt tokens the model conditions on.
    pub context_size: usize,
    /// A temperature of zero means greedy decoding.
    pub temperature: f64,
    pub top_p: Option<f32>,
    pub eos_id: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            context_size: 1_024,
            temperature: 0.95,
            top_p: Some(0.7),
            eos_id: Some(EOS_TOKEN_ID),
        }
    }
}

/// Incremental detokenizer feeding a bounded channel.
///
/// GPT-2 byte-pair tokens can split a multi-byte character, so token ids are
/// buffered until they decode to valid UTF-8 and only then sent as a chunk.
/// A send failure means the receiving end hung up; generation should stop.
pub struct TextStreamer {
    tokenizer: Arc<CoreBPE>,
    tx: SyncSender<String>,
    pending: Vec<u32>,
}

impl TextStreamer {
    pub fn new(tokenizer: Arc<CoreBPE>, tx: SyncSender<String>) -> Self {
        Self {
            tokenizer,
            tx,
            pending: vec![],
        }
    }

    /// Buffers one token id. Returns false once the receiver is gone.
    pub fn put(&mut self, token_id: u32) -> bool {
        self.pending.push(token_id);
        match self.tokenizer.decode(self.pending.clone()) {
            Ok(text) => {
                self.pending.clear();
                self.tx.send(text).is_ok()
            }
            // partial multi-byte character; wait for the next token
            Err(_) => true,
        }
    }

    /// Flushes whatever is still buffered, lossily if necessary.
    pub fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        let text = self
            .tokenizer
            .decode(std::mem::take(&mut self.pending))
            .unwrap_or_default();
        if text.is_empty() {
            return true;
        }
        self.tx.send(text).is_ok()
    }
}

/// Autoregressively extends `idx` (shape `(1, num_tokens)`).
///
/// Stops at `max_new_tokens`, at the end-of-sequence token, or as soon as the
/// streamer reports its receiver has hung up. Returns the full token
/// sequence including the prompt.
pub fn generate_text(
    model: &GPTModel,
    idx: Tensor,
    cfg: &GenerationConfig,
    rng: &mut StdRng,
    mut streamer: Option<&mut TextStreamer>,
) -> anyhow::Result<Tensor> {
    let mut idx = idx;
    for _ in 0..cfg.max_new_tokens {
        let (_b, seq_len) = idx.dims2()?;
        let start = seq_len.saturating_sub(cfg.context_size);
        let context = idx.i((.., start..))?;
        let num_context_tokens = context.dims2()?.1;

        let logits = model.forward_t(&context, false)?;
        let last_logits = logits.i((0, num_context_tokens - 1))?;

        let next_token_id = if cfg.temperature > 0_f64 {
            let scaled = (last_logits / cfg.temperature)?;
            let probs = softmax(&scaled, D::Minus1)?.to_vec1::<f32>()?;
            let probs = match cfg.top_p {
                Some(top_p) => apply_top_p(&probs, top_p),
                None => probs,
            };
            sample_multinomial(rng, &probs)?
        } else {
            last_logits.argmax(D::Minus1)?.to_scalar::<u32>()?
        };

        if cfg.eos_id == Some(next_token_id) {
            break;
        }

        let next = Tensor::new(&[[next_token_id]], idx.device())?;
        idx = Tensor::cat(&[&idx, &next], D::Minus1)?;

        if let Some(s) = streamer.as_deref_mut() {
            if !s.put(next_token_id) {
                break;
            }
        }
    }
    if let Some(s) = streamer {
        s.flush();
    }
    Ok(idx)
}
