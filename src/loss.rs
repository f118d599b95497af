//! Pairwise ranking loss for reward-model training.

use candle_core::{Tensor, D};

/// Per-pair rewards produced alongside the loss, detached from the graph so
/// callers can log them or compute ranking accuracy.
#[derive(Clone, Debug)]
pub struct PairwiseScores {
    pub r_accept: Tensor,
    pub r_reject: Tensor,
}

/// Reads each row's scalar reward at its last real (non-pad) token.
///
/// `values` has shape `(rows, num_tokens)` and `attention_mask` the same
/// shape with 1 marking real tokens and 0 padding. Since every encoded
/// sequence ends with `<|endoftext|>`, the position read here is the
/// end-of-sequence token. Rows with no real tokens are an error.
pub fn rewards_at_sequence_end(
    values: &Tensor,
    attention_mask: &Tensor,
) -> candle_core::Result<Tensor> {
    let (rows, num_tokens) = values.dims2()?;
    if attention_mask.dims2()? != (rows, num_tokens) {
        candle_core::bail!(
            "attention mask shape {:?} does not match values shape {:?}",
            attention_mask.dims(),
            values.dims()
        );
    }

    let seq_lengths = attention_mask.sum(D::Minus1)?.to_vec1::<u32>()?;
    let mut last_real_idx = Vec::with_capacity(rows);
    for (ix, &len) in seq_lengths.iter().enumerate() {
        if len == 0 {
            candle_core::bail!("row {ix} contains only padding");
        }
        last_real_idx.push(len - 1);
    }

    let idx = Tensor::from_vec(last_real_idx, (rows, 1), values.device())?;
    values.gather(&idx, D::Minus1)?.squeeze(D::Minus1)
}

/// A ranking-loss strategy over per-token value predictions.
pub trait RewardLoss {
    fn compute(
        &self,
        values: &Tensor,
        attention_mask: &Tensor,
    ) -> candle_core::Result<(Tensor, PairwiseScores)>;
}

/// The Bradley-Terry logistic ranking loss.
///
/// For a 2N-row batch whose first N rows are the chosen sequences and last N
/// rows the rejected ones, the loss is `mean(-log sigmoid(r_accept -
/// r_reject))`, computed in the softplus form `max(-x, 0) + ln(1 + exp(-|x|))`
/// which stays finite for arbitrarily large score gaps in either direction.
pub struct PairwiseLogisticLoss;

impl RewardLoss for PairwiseLogisticLoss {
    fn compute(
        &self,
        values: &Tensor,
        attention_mask: &Tensor,
    ) -> candle_core::Result<(Tensor, PairwiseScores)> {
        let rewards = rewards_at_sequence_end(values, attention_mask)?;
        let rows = rewards.dims1()?;
        if rows % 2 != 0 {
            candle_core::bail!("pairwise batch must have an even number of rows, got {rows}");
        }
        let num_pairs = rows / 2;

        let r_accept = rewards.narrow(0, 0, num_pairs)?;
        let r_reject = rewards.narrow(0, num_pairs, num_pairs)?;
        let diff = (&r_accept - &r_reject)?;

        // -log sigmoid(x) = softplus(-x) = max(-x, 0) + ln(1 + exp(-|x|))
        let linear_part = diff.neg()?.relu()?;
        let log_part = (diff.abs()?.neg()?.exp()? + 1_f64)?.log()?;
        let loss = (linear_part + log_part)?.mean_all()?;

        Ok((
            loss,
            PairwiseScores {
                r_accept: r_accept.detach(),
                r_reject: r_reject.detach(),
            },
        ))
    }
}
