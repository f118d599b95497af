//! Reward-model training loop, evaluation helpers and loss-curve plotting.

use crate::data::{DataLoader, PreferenceBatch};
use crate::loss::{PairwiseScores, RewardLoss};
use crate::model::GPTModel;
use candle_core::{Device, ModuleT, Tensor, D};
use candle_nn::{AdamW, Optimizer};
use comfy_table::Table;
use itertools::izip;
use ndarray::linspace;
use plotly::{common::Mode, layout::Axis, Layout, Plot, Scatter};
use std::path::Path;

/// Runs one batch through the model's value head and scores it.
///
/// Returns the scalar loss (attached to the graph when `train` is true) and
/// the detached per-pair rewards.
pub fn calc_loss_batch<L: RewardLoss>(
    batch: &PreferenceBatch,
    model: &GPTModel,
    loss_fn: &L,
    device: &Device,
    train: bool,
) -> candle_core::Result<(Tensor, PairwiseScores)> {
    let input_ids = batch.input_ids.to_device(device)?;
    let attention_mask = batch.attention_mask.to_device(device)?;

    // (2N, num_tokens, 1) -> (2N, num_tokens)
    let values = model.forward_t(&input_ids, train)?.squeeze(D::Minus1)?;
    loss_fn.compute(&values, &attention_mask)
}

/// Average loss over (up to `num_batches` of) a data loader, in eval mode.
pub fn calc_loss_loader<D, L>(
    data_loader: &D,
    model: &GPTModel,
    loss_fn: &L,
    device: &Device,
    num_batches: Option<usize>,
) -> candle_core::Result<f32>
where
    D: DataLoader,
    D::Batcher: Iterator<Item = candle_core::Result<PreferenceBatch>>,
    L: RewardLoss,
{
    let mut total_loss = 0_f32;
    let mut count = 0_usize;
    let mut batcher = match num_batches {
        None => data_loader.batcher().take(usize::MAX),
        Some(n) => data_loader.batcher().take(n),
    };
    while let Some(batch) = batcher.next() {
        let (loss, _scores) = calc_loss_batch(&batch?, model, loss_fn, device, false)?;
        total_loss += loss.to_scalar::<f32>()?;
        count += 1;
    }
    if count == 0 {
        candle_core::bail!("data loader yielded no batches");
    }
    Ok(total_loss / count as f32)
}

/// Fraction of pairs whose chosen sequence outscores its rejected partner.
pub fn calc_reward_accuracy_loader<D, L>(
    data_loader: &D,
    model: &GPTModel,
    loss_fn: &L,
    device: &Device,
    num_batches: Option<usize>,
) -> candle_core::Result<f32>
where
    D: DataLoader,
    D::Batcher: Iterator<Item = candle_core::Result<PreferenceBatch>>,
    L: RewardLoss,
{
    let mut num_correct = 0_usize;
    let mut num_pairs = 0_usize;
    let mut batcher = match num_batches {
        None => data_loader.batcher().take(usize::MAX),
        Some(n) => data_loader.batcher().take(n),
    };
    while let Some(batch) = batcher.next() {
        let (_loss, scores) = calc_loss_batch(&batch?, model, loss_fn, device, false)?;
        let r_accept = scores.r_accept.to_vec1::<f32>()?;
        let r_reject = scores.r_reject.to_vec1::<f32>()?;
        for (a, r) in izip!(r_accept.iter(), r_reject.iter()) {
            if a > r {
                num_correct += 1;
            }
            num_pairs += 1;
        }
    }
    if num_pairs == 0 {
        candle_core::bail!("data loader yielded no pairs");
    }
    Ok(num_correct as f32 / num_pairs as f32)
}

pub fn evaluate_model<D, L>(
    model: &GPTModel,
    train_loader: &D,
    val_loader: &D,
    loss_fn: &L,
    device: &Device,
    eval_iter: usize,
) -> candle_core::Result<(f32, f32)>
where
    D: DataLoader,
    D::Batcher: Iterator<Item = candle_core::Result<PreferenceBatch>>,
    L: RewardLoss,
{
    let train_loss = calc_loss_loader(train_loader, model, loss_fn, device, Some(eval_iter))?;
    let val_loss = calc_loss_loader(val_loader, model, loss_fn, device, Some(eval_iter))?;
    Ok((train_loss, val_loss))
}

/// Trains the reward model, evaluating every `eval_freq` steps.
///
/// Returns the recorded train losses, validation losses and the number of
/// preference pairs seen at each evaluation point.
#[allow(clippy::too_many_arguments)]
pub fn train_reward_model<D, L>(
    model: &GPTModel,
    train_loader: &D,
    val_loader: &D,
    optimizer: &mut AdamW,
    loss_fn: &L,
    device: &Device,
    num_epochs: usize,
    eval_freq: usize,
    eval_iter: usize,
) -> anyhow::Result<(Vec<f32>, Vec<f32>, Vec<usize>)>
where
    D: DataLoader,
    D::Batcher: Iterator<Item = candle_core::Result<PreferenceBatch>>,
    L: RewardLoss,
{
    let mut train_losses: Vec<f32> = vec![];
    let mut val_losses: Vec<f32> = vec![];
    let mut track_pairs_seen: Vec<usize> = vec![];
    let (mut pairs_seen, mut global_step) = (0_usize, 0_usize);

    for epoch in 0..num_epochs {
        let mut batcher = train_loader.batcher();
        while let Some(batch) = batcher.next() {
            let batch = batch?;
            let (loss, _scores) = calc_loss_batch(&batch, model, loss_fn, device, true)?;
            optimizer.backward_step(&loss)?;
            pairs_seen += batch.num_rows()? / 2;

            if global_step % eval_freq == 0 {
                let (train_loss, val_loss) =
                    evaluate_model(model, train_loader, val_loader, loss_fn, device, eval_iter)?;
                train_losses.push(train_loss);
                val_losses.push(val_loss);
                track_pairs_seen.push(pairs_seen);
                tracing::info!(
                    epoch = epoch + 1,
                    step = global_step,
                    train_loss,
                    val_loss,
                    pairs_seen,
                    "evaluation"
                );
            }
            global_step += 1;
        }
    }

    Ok((train_losses, val_losses, track_pairs_seen))
}

/// Writes an interactive train/validation loss curve to an html file.
pub fn plot_losses<P: AsRef<Path>>(
    num_epochs: usize,
    pairs_seen: Vec<usize>,
    train_losses: Vec<f32>,
    val_losses: Vec<f32>,
    save_path: P,
) {
    let epochs_seen: Vec<f32> = linspace(0_f32, num_epochs as f32, train_losses.len()).collect();

    let train_trace = Scatter::new(epochs_seen.clone(), train_losses)
        .mode(Mode::Lines)
        .name("train loss");
    let val_trace = Scatter::new(epochs_seen, val_losses)
        .mode(Mode::Lines)
        .name("validation loss");
    let pairs_text = pairs_seen
        .last()
        .map(|p| format!("Loss over {num_epochs} epochs ({p} pairs seen)"))
        .unwrap_or_else(|| "Loss".to_string());

    let layout = Layout::new()
        .title(pairs_text)
        .x_axis(Axis::new().title("Epoch"))
        .y_axis(Axis::new().title("Loss"));

    let mut plot = Plot::new();
    plot.add_trace(train_trace);
    plot.add_trace(val_trace);
    plot.set_layout(layout);
    plot.write_html(save_path);
}

/// Ranking-accuracy summary table for the dataset splits.
pub fn reward_accuracy_table(splits: &[(&str, f32)]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["split", "ranking accuracy"]);
    for (name, accuracy) in splits {
        table.add_row(vec![name.to_string(), format!("{:.4}", accuracy)]);
    }
    table
}
