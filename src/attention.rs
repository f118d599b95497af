//! Multi-head causal self-attention.

use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn::{linear_b, ops::softmax, Dropout, Linear, VarBuilder};

/// Multi-head self-attention with a causal mask.
///
/// Trailing pad tokens sit strictly after every real token, so under the
/// causal mask they can never contribute to the representation at an earlier
/// position. The reward read at a row's last real token is therefore
/// unaffected by how much padding follows it.
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    num_heads: usize,
    head_dim: usize,
    d_out: usize,
    w_query: Linear,
    w_key: Linear,
    w_value: Linear,
    out_proj: Linear,
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
            candle_core::bail!(
                "d_out ({}) must be divisible by num_heads ({})",
                d_out,
                num_heads
            );
        }
        let w_query = linear_b(d_in, d_out, qkv_bias, vb.pp("w_query"))?;
        let w_key = linear_b(d_in, d_out, qkv_bias, vb.pp("w_key"))?;
        let w_value = linear_b(d_in, d_out, qkv_bias, vb.pp("w_value"))?;
        let out_proj = linear_b(d_out, d_out, true, vb.pp("out_proj"))?;
        let dropout = Dropout::new(drop_p);
        Ok(Self {
            num_heads,
            head_dim: d_out / num_heads,
            d_out,
            w_query,
            w_key,
            w_value,
            out_proj,
            dropout,
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

    pub fn w_query(&self) -> &Linear {
        &self.w_query
    }

    pub fn w_key(&self) -> &Linear {
        &self.w_key
    }

    pub fn w_value(&self) -> &Linear {
        &self.w_value
    }

    /// Upper-triangular (strictly above the diagonal) mask of ones marking
    /// the future positions to be blanked out before softmax.
    fn causal_mask(num_tokens: usize, device: &candle_core::Device) -> Result<Tensor> {
        let mut mask = Vec::with_capacity(num_tokens * num_tokens);
        for i in 0..num_tokens {
            for j in 0..num_tokens {
                mask.push(u8::from(j > i));
            }
        }
        Tensor::from_vec(mask, (num_tokens, num_tokens), device)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, true)
    }
}

impl ModuleT for MultiHeadAttention {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (b, num_tokens, _d_in) = xs.dims3()?;

        let queries = self.w_query.forward(xs)?;
        let keys = self.w_key.forward(xs)?;
        let values = self.w_value.forward(xs)?;

        // (b, num_tokens, d_out) -> (b, num_heads, num_tokens, head_dim)
        let queries = queries
            .reshape((b, num_tokens, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let keys = keys
            .reshape((b, num_tokens, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let values = values
            .reshape((b, num_tokens, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let attn_scores = queries.matmul(&keys.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        let attn_scores = (attn_scores * (1_f64 / (self.head_dim as f64).sqrt()))?;

        let mask = Self::causal_mask(num_tokens, xs.device())?
            .broadcast_as(attn_scores.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, xs.device())?
            .broadcast_as(attn_scores.shape())?;
        let attn_scores = mask.where_cond(&neg_inf, &attn_scores)?;

        let attn_weights = softmax(&attn_scores, D::Minus1)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;

        // (b, num_heads, num_tokens, head_dim) -> (b, num_tokens, d_out)
        let context = attn_weights
            .matmul(&values)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, num_tokens, self.d_out))?;
        self.out_proj.forward(&context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use rstest::*;

    #[fixture]
    pub fn vb() -> VarBuilder<'static> {
        let varmap = VarMap::new();
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu)
    }

    #[rstest]
    fn test_multi_head_attention_init(vb: VarBuilder<'_>) -> Result<()> {
        let (d_in, d_out, num_heads) = (12_usize, 12_usize, 3_usize);
        let mha = MultiHeadAttention::new(d_in, d_out, 0.1_f32, num_heads, false, vb.pp("mha"))?;

        assert_eq!(mha.num_heads(), num_heads);
        assert_eq!(mha.head_dim(), d_out / num_heads);
        assert_eq!(mha.drop_p(), 0.1_f32);
        assert_eq!(mha.w_query().weight().dims(), &[d_out, d_in]);
        assert_eq!(mha.w_key().weight().dims(), &[d_out, d_in]);
        assert_eq!(mha.w_value().weight().dims(), &[d_out, d_in]);
        Ok(())
    }

    #[rstest]
    fn test_multi_head_attention_rejects_bad_head_count(vb: VarBuilder<'_>) {
        let res = MultiHeadAttention::new(12, 12, 0.1, 5, false, vb.pp("mha"));
        assert!(res.is_err());
    }

    #[rstest]
    fn test_multi_head_attention_forward(vb: VarBuilder<'_>) -> Result<()> {
        let (d_in, d_out, num_heads) = (12_usize, 12_usize, 3_usize);
        let mha = MultiHeadAttention::new(d_in, d_out, 0.0_f32, num_heads, false, vb.pp("mha"))?;

        let (batch_size, num_tokens) = (2_usize, 4_usize);
        let xs = Tensor::rand(0_f32, 1_f32, (batch_size, num_tokens, d_in), vb.device())?;
        let out = mha.forward_t(&xs, false)?;

        assert_eq!(out.dims(), &[batch_size, num_tokens, d_out]);
        Ok(())
    }

    #[rstest]
    fn test_causal_mask_blocks_future_positions(vb: VarBuilder<'_>) -> Result<()> {
        // With dropout off, the first position's output must not change when
        // later tokens change.
        let (d_in, d_out, num_heads) = (8_usize, 8_usize, 2_usize);
        let mha = MultiHeadAttention::new(d_in, d_out, 0.0_f32, num_heads, false, vb.pp("mha"))?;

        let a = Tensor::rand(0_f32, 1_f32, (1_usize, 3_usize, d_in), vb.device())?;
        let noise = Tensor::rand(0_f32, 1_f32, (1_usize, 1_usize, d_in), vb.device())?;
        let b = Tensor::cat(&[&a.narrow(1, 0, 2)?, &noise], 1)?;

        let out_a = mha.forward_t(&a, false)?;
        let out_b = mha.forward_t(&b, false)?;

        let diff = (out_a.narrow(1, 0, 2)? - out_b.narrow(1, 0, 2)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }
}
