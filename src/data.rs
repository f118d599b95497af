//! Preference dataset loading, encoding and pairwise batch collation.
//!
//! A batch holds 2N rows: rows `[0, N)` are the chosen (accept) sequences and
//! rows `[N, 2N)` the rejected ones, in matching order, so that row `i` and
//! row `i + N` always originate from the same source example.

use anyhow::Context;
use bytes::Bytes;
use candle_core::{Device, Result, Tensor};
use rand::{seq::SliceRandom, thread_rng};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, NoneAsEmptyString};
use std::{
    fmt::Display,
    fs::{read_to_string, File},
    io,
    path::Path,
    rc::Rc,
};
use tiktoken_rs::CoreBPE;

pub const DATA_DIR: &str = "data";
pub const PREFERENCE_DATA_FILENAME: &str = "instruction-data-with-preference.json";
pub const PREFERENCE_DATA_URL: &str = "https://raw.githubusercontent.com/rasbt/LLMs-from-scratch/\
    main/ch07/04_preference-tuning-with-dpo/instruction-data-with-preference.json";

/// GPT-2 `<|endoftext|>`, used both as the end-of-sequence marker and as the
/// pad token.
pub const DEFAULT_PAD_TOKEN_ID: u32 = 50_256;
pub const EOT_TOKEN: &str = "<|endoftext|>";

/// Formats an instruction (and optional free-form input) into a model prompt.
pub trait PromptFormatter {
    fn format_input(&self, instruction: &str, input: Option<&str>) -> String;
}

/// The Alpaca prompt style used by the preference dataset.
pub struct AlpacaPromptFormatter;

impl PromptFormatter for AlpacaPromptFormatter {
    fn format_input(&self, instruction: &str, input: Option<&str>) -> String {
        let mut prompt = format!(
            "Below is an instruction that describes a task. Write a response \
            that appropriately completes the request.\n\n\
            ### Instruction:\n{}",
            instruction
        );
        if let Some(inp) = input {
            if !inp.is_empty() {
                prompt.push_str("\n\n### Input:\n");
                prompt.push_str(inp);
            }
        }
        prompt
    }
}

/// One preference record: an instruction with a preferred (`chosen`) and a
/// dispreferred (`rejected`) response. Serde rejects records that lack either
/// response field, so a malformed dataset fails at load time.
#[serde_as]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
pub struct PreferenceExample {
    instruction: String,
    #[serde_as(as = "NoneAsEmptyString")]
    input: Option<String>,
    output: String,
    chosen: String,
    rejected: String,
}

impl PreferenceExample {
    pub fn new(
        instruction: &str,
        input: Option<&str>,
        output: &str,
        chosen: &str,
        rejected: &str,
    ) -> Self {
        Self {
            instruction: instruction.to_string(),
            input: input.map(|s| s.to_string()),
            output: output.to_string(),
            chosen: chosen.to_string(),
            rejected: rejected.to_string(),
        }
    }

    pub fn instruction(&self) -> &String {
        &self.instruction
    }

    pub fn input(&self) -> &Option<String> {
        &self.input
    }

    pub fn output(&self) -> &String {
        &self.output
    }

    pub fn chosen(&self) -> &String {
        &self.chosen
    }

    pub fn rejected(&self) -> &String {
        &self.rejected
    }
}

impl Display for PreferenceExample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Instruction: {}\nInput: {:?}\nChosen: {}\nRejected: {}",
            self.instruction, self.input, self.chosen, self.rejected
        )
    }
}

/// Downloads the preference dataset if the file is missing, then loads it.
pub fn download_and_load_file<P: AsRef<Path>>(
    file_path: P,
    url: &str,
) -> anyhow::Result<Vec<PreferenceExample>> {
    if !file_path.as_ref().exists() {
        let resp = reqwest::blocking::get(url)?;
        let content: Bytes = resp.bytes()?;
        let mut out = File::create(file_path.as_ref())?;
        io::copy(&mut content.as_ref(), &mut out)?;
    }
    let json_str = read_to_string(file_path.as_ref())
        .with_context(|| format!("Unable to read {}", file_path.as_ref().display()))?;
    let data: Vec<PreferenceExample> = serde_json::from_str(&json_str[..])?;

    Ok(data)
}

/// Splits examples into train, validation and test partitions.
pub fn partition_data(
    data: Vec<PreferenceExample>,
    train_frac: f32,
    val_frac: f32,
) -> anyhow::Result<(
    Vec<PreferenceExample>,
    Vec<PreferenceExample>,
    Vec<PreferenceExample>,
)> {
    if train_frac + val_frac >= 1_f32 {
        anyhow::bail!("train_frac + val_frac must be less than 1");
    }
    let train_size = (data.len() as f32 * train_frac) as usize;
    let val_size = (data.len() as f32 * val_frac) as usize;

    let mut data = data;
    let test_data = data.split_off(train_size + val_size);
    let val_data = data.split_off(train_size);

    Ok((data, val_data, test_data))
}

/// Token-id encoding of one preference record.
///
/// Both sequences end with `<|endoftext|>`, which makes the end-of-sequence
/// token the last real (non-pad) token of every batch row by construction.
/// The pairwise loss relies on this when it reads each row's reward at the
/// final masked-in position.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedPreferenceExample {
    accept_ids: Vec<u32>,
    reject_ids: Vec<u32>,
}

impl EncodedPreferenceExample {
    pub fn from_example<P: PromptFormatter>(
        example: &PreferenceExample,
        prompt_formatter: &P,
        tokenizer: &CoreBPE,
    ) -> anyhow::Result<Self> {
        if example.chosen.trim().is_empty() {
            anyhow::bail!("preference example has an empty `chosen` response: {example}");
        }
        if example.rejected.trim().is_empty() {
            anyhow::bail!("preference example has an empty `rejected` response: {example}");
        }

        let prompt =
            prompt_formatter.format_input(&example.instruction, example.input.as_deref());
        let chosen_full_text =
            format!("{prompt}\n\n### Response:\n{}{EOT_TOKEN}", example.chosen);
        let rejected_full_text =
            format!("{prompt}\n\n### Response:\n{}{EOT_TOKEN}", example.rejected);

        Ok(Self {
            accept_ids: tokenizer.encode_with_special_tokens(&chosen_full_text),
            reject_ids: tokenizer.encode_with_special_tokens(&rejected_full_text),
        })
    }

    pub fn accept_ids(&self) -> &Vec<u32> {
        &self.accept_ids
    }

    pub fn reject_ids(&self) -> &Vec<u32> {
        &self.reject_ids
    }
}

pub struct PreferenceDataset_ {
    data: Vec<PreferenceExample>,
    encoded: Vec<EncodedPreferenceExample>,
}

/// A preference dataset of encoded chosen/rejected pairs.
///
/// This is a wrapper over a refcounted `PreferenceDataset_`, which makes
/// cloning the dataset cheap when handing it to an iterator.
#[derive(Clone)]
pub struct PreferenceDataset(Rc<PreferenceDataset_>);

impl AsRef<PreferenceDataset> for PreferenceDataset {
    fn as_ref(&self) -> &PreferenceDataset {
        self
    }
}

impl std::ops::Deref for PreferenceDataset {
    type Target = PreferenceDataset_;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PreferenceDataset {
    pub fn new<P: PromptFormatter>(
        data: Vec<PreferenceExample>,
        tokenizer: &CoreBPE,
        prompt_formatter: &P,
    ) -> anyhow::Result<Self> {
        let mut encoded = Vec::with_capacity(data.len());
        for example in data.iter() {
            encoded.push(EncodedPreferenceExample::from_example(
                example,
                prompt_formatter,
                tokenizer,
            )?);
        }
        Ok(Self(Rc::new(PreferenceDataset_ { data, encoded })))
    }

    /// Gets the number of preference pairs in the dataset.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get_item_at_index(&self, idx: usize) -> &EncodedPreferenceExample {
        &self.encoded[idx]
    }

    pub fn data(&self) -> &Vec<PreferenceExample> {
        &self.data
    }
}

/// Iterates a dataset, yielding one `(accept_ids, reject_ids)` tensor pair
/// per preference example.
pub struct PreferenceDatasetIter {
    dataset: PreferenceDataset,
    remaining_indices: Vec<usize>,
}

impl PreferenceDatasetIter {
    pub fn new(dataset: PreferenceDataset, shuffle: bool) -> Self {
        let mut remaining_indices = (0..dataset.len()).rev().collect::<Vec<_>>();
        if shuffle {
            remaining_indices.shuffle(&mut thread_rng());
        }
        Self {
            dataset,
            remaining_indices,
        }
    }
}

impl Iterator for PreferenceDatasetIter {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(idx) = self.remaining_indices.pop() {
            let encoded = self.dataset.get_item_at_index(idx);
            let accept_tensor = Tensor::new(&encoded.accept_ids[..], &Device::Cpu);
            let reject_tensor = Tensor::new(&encoded.reject_ids[..], &Device::Cpu);
            Some(candle_core::error::zip(accept_tensor, reject_tensor))
        } else {
            None
        }
    }
}

/// A collated batch: 2N padded rows plus the matching attention mask
/// (1 = real token, 0 = padding).
#[derive(Clone, Debug)]
pub struct PreferenceBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
}

impl PreferenceBatch {
    pub fn num_rows(&self) -> Result<usize> {
        Ok(self.input_ids.dims2()?.0)
    }
}

/// A collation strategy turning per-example tensor pairs into a batch.
pub trait CustomCollator {
    type Batch;

    fn collate(&self, batch: Vec<(Tensor, Tensor)>) -> Result<Self::Batch>;
}

/// Collator for pairwise data.
///
/// Produces 2N rows where the first N rows are the chosen sequences and the
/// last N rows the rejected ones, all padded to the longest sequence in the
/// combined batch. Order is input order; no shuffling happens here.
#[derive(Clone)]
pub struct PairwiseDataCollator {
    pad_token_id: u32,
    allowed_max_length: Option<usize>,
    device: Device,
}

impl Default for PairwiseDataCollator {
    fn default() -> Self {
        Self {
            pad_token_id: DEFAULT_PAD_TOKEN_ID,
            allowed_max_length: None,
            device: Device::Cpu,
        }
    }
}

impl PairwiseDataCollator {
    /// Creates a collator with the default pad token (50256) on the CPU.
    ///
    /// ```rust
    /// use pairtune::data::PairwiseDataCollator;
    ///
    /// let collator = PairwiseDataCollator::new().allowed_max_length(Some(1024_usize));
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    pub fn allowed_max_length(mut self, allowed_max_length: Option<usize>) -> Self {
        self.allowed_max_length = allowed_max_length;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    fn collate_pairwise(&self, batch: Vec<(Tensor, Tensor)>) -> Result<PreferenceBatch> {
        if batch.is_empty() {
            candle_core::bail!("cannot collate an empty batch");
        }

        let mut accept_rows: Vec<Vec<u32>> = Vec::with_capacity(batch.len());
        let mut reject_rows: Vec<Vec<u32>> = Vec::with_capacity(batch.len());
        for (ix, (accept, reject)) in batch.into_iter().enumerate() {
            let accept = accept.to_vec1::<u32>()?;
            let reject = reject.to_vec1::<u32>()?;
            if accept.is_empty() {
                candle_core::bail!("example {ix} has empty accept_ids");
            }
            if reject.is_empty() {
                candle_core::bail!("example {ix} has empty reject_ids");
            }
            accept_rows.push(accept);
            reject_rows.push(reject);
        }

        // first N rows chosen, last N rows rejected, example order preserved
        let mut rows = accept_rows;
        rows.extend(reject_rows);

        if let Some(allowed) = self.allowed_max_length {
            for row in rows.iter_mut() {
                if row.len() > allowed {
                    // truncate from the front so the end-of-sequence token,
                    // where the reward is read, survives
                    *row = row[row.len() - allowed..].to_vec();
                }
            }
        }

        let batch_max_length = rows
            .iter()
            .map(|row| row.len())
            .max()
            .ok_or_else(|| candle_core::Error::Msg("Unable to get max length for batch.".into()))?;

        let num_rows = rows.len();
        let mut inputs: Vec<u32> = Vec::with_capacity(num_rows * batch_max_length);
        let mut mask: Vec<u32> = Vec::with_capacity(num_rows * batch_max_length);
        for row in rows.into_iter() {
            let num_pad = batch_max_length - row.len();
            mask.extend(std::iter::repeat(1_u32).take(row.len()));
            mask.extend(std::iter::repeat(0_u32).take(num_pad));
            inputs.extend(row);
            inputs.extend(std::iter::repeat(self.pad_token_id).take(num_pad));
        }

        let input_ids = Tensor::from_vec(inputs, (num_rows, batch_max_length), &self.device)?;
        let attention_mask = Tensor::from_vec(mask, (num_rows, batch_max_length), &self.device)?;
        Ok(PreferenceBatch {
            input_ids,
            attention_mask,
        })
    }
}

impl CustomCollator for PairwiseDataCollator {
    type Batch = PreferenceBatch;

    fn collate(&self, batch: Vec<(Tensor, Tensor)>) -> Result<PreferenceBatch> {
        self.collate_pairwise(batch)
    }
}

/// Groups items from an inner iterator into collated batches.
pub struct PreferenceDataBatcher<C, I>
where
    C: CustomCollator,
    I: Iterator<Item = Result<(Tensor, Tensor)>>,
{
    inner: I,
    batch_size: usize,
    return_last_incomplete_batch: bool,
    collator: C,
}

impl<C, I> PreferenceDataBatcher<C, I>
where
    C: CustomCollator,
    I: Iterator<Item = Result<(Tensor, Tensor)>>,
{
    pub fn new(inner: I, collator: C) -> Self {
        Self {
            inner,
            batch_size: 8,
            return_last_incomplete_batch: false,
            collator,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn return_last_incomplete_batch(mut self, r: bool) -> Self {
        self.return_last_incomplete_batch = r;
        self
    }
}

impl<C, I> Iterator for PreferenceDataBatcher<C, I>
where
    C: CustomCollator,
    I: Iterator<Item = Result<(Tensor, Tensor)>>,
{
    type Item = Result<C::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut items = Vec::with_capacity(self.batch_size);
        while items.len() < self.batch_size {
            match self.inner.next() {
                Some(Ok(item)) => items.push(item),
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        if items.is_empty() {
            return None;
        }
        if items.len() < self.batch_size && !self.return_last_incomplete_batch {
            return None;
        }
        Some(self.collator.collate(items))
    }
}

/// Anything that can repeatedly hand out a fresh batch iterator.
pub trait DataLoader {
    type Batcher: Iterator;

    fn batcher(&self) -> Self::Batcher;
}

/// A data loader over a preference dataset.
pub struct PreferenceDataLoader<C: CustomCollator<Batch = PreferenceBatch> + Clone> {
    dataset: PreferenceDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    collator: C,
}

impl<C: CustomCollator<Batch = PreferenceBatch> + Clone> DataLoader for PreferenceDataLoader<C> {
    type Batcher = PreferenceDataBatcher<C, PreferenceDatasetIter>;

    fn batcher(&self) -> Self::Batcher {
        let iter = PreferenceDatasetIter::new(self.dataset.clone(), self.shuffle);
        PreferenceDataBatcher::new(iter, self.collator.clone())
            .batch_size(self.batch_size)
            .return_last_incomplete_batch(!self.drop_last)
    }
}

impl<C: CustomCollator<Batch = PreferenceBatch> + Clone> PreferenceDataLoader<C> {
    pub fn new(
        dataset: PreferenceDataset,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        collator: C,
    ) -> Self {
        Self {
            dataset,
            batch_size,
            shuffle,
            drop_last,
            collator,
        }
    }

    /// Number of batches one pass over the dataset produces.
    pub fn len(&self) -> usize {
        self.batcher().count()
    }

    pub fn is_empty(&self) -> bool {
        (self.dataset.len() < self.batch_size) && (self.drop_last)
    }

    pub fn dataset(&self) -> &PreferenceDataset {
        &self.dataset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tiktoken_rs::get_bpe_from_model;

    #[fixture]
    fn preference_example() -> PreferenceExample {
        PreferenceExample::new(
            "Here is a fake instruction.",
            Some("Here is a fake input."),
            "here is a fake output.",
            "Here is a fake chosen.",
            "Here is a fake rejected.",
        )
    }

    #[fixture]
    fn another_preference_example() -> PreferenceExample {
        PreferenceExample::new(
            "Here is yet another fake instruction.",
            None,
            "here is yet another fake output.",
            "Here is yet another fake chosen.",
            "Here is yet another fake rejected.",
        )
    }

    #[fixture]
    fn preference_data(
        preference_example: PreferenceExample,
        another_preference_example: PreferenceExample,
    ) -> Vec<PreferenceExample> {
        vec![
            preference_example.clone(),
            another_preference_example.clone(),
            preference_example.clone(),
            another_preference_example,
            preference_example,
        ]
    }

    #[rstest]
    fn test_alpaca_prompt_formatter(preference_example: PreferenceExample) {
        let formatter = AlpacaPromptFormatter;
        let prompt = formatter.format_input(
            preference_example.instruction(),
            preference_example.input().as_deref(),
        );

        let expected = "Below is an instruction that describes a task. Write a \
        response that appropriately completes the request.\n\n\
        ### Instruction:\n\
        Here is a fake instruction.\n\n\
        ### Input:\n\
        Here is a fake input.";
        assert_eq!(prompt, expected);
    }

    #[rstest]
    fn test_encoded_example_ends_with_eot(preference_example: PreferenceExample) -> Result<()> {
        let tokenizer = get_bpe_from_model("gpt2")?;
        let formatter = AlpacaPromptFormatter;
        let encoded =
            EncodedPreferenceExample::from_example(&preference_example, &formatter, &tokenizer)?;

        assert_eq!(*encoded.accept_ids().last().unwrap(), DEFAULT_PAD_TOKEN_ID);
        assert_eq!(*encoded.reject_ids().last().unwrap(), DEFAULT_PAD_TOKEN_ID);
        assert_ne!(encoded.accept_ids(), encoded.reject_ids());
        Ok(())
    }

    #[rstest]
    fn test_empty_chosen_response_fails_loudly() {
        let tokenizer = get_bpe_from_model("gpt2").unwrap();
        let formatter = AlpacaPromptFormatter;
        let example = PreferenceExample::new("instruction", None, "output", "", "rejected");

        let res = EncodedPreferenceExample::from_example(&example, &formatter, &tokenizer);
        assert!(res.is_err());
    }

    #[rstest]
    fn test_missing_field_fails_at_deserialization() {
        // no `rejected` field
        let json = r#"[{"instruction": "i", "input": "", "output": "o", "chosen": "c"}]"#;
        let res = serde_json::from_str::<Vec<PreferenceExample>>(json);
        assert!(res.is_err());
    }

    #[rstest]
    fn test_preference_dataset_init(preference_data: Vec<PreferenceExample>) -> Result<()> {
        let tokenizer = get_bpe_from_model("gpt2")?;
        let formatter = AlpacaPromptFormatter;
        let dataset = PreferenceDataset::new(preference_data.clone(), &tokenizer, &formatter)?;

        let expected = EncodedPreferenceExample::from_example(
            &preference_data[0],
            &formatter,
            &tokenizer,
        )?;
        assert_eq!(dataset.len(), 5);
        assert_eq!(*dataset.get_item_at_index(0_usize), expected);
        Ok(())
    }

    #[rstest]
    fn test_partition_data(preference_data: Vec<PreferenceExample>) -> Result<()> {
        let (train, val, test) = partition_data(preference_data, 0.6_f32, 0.2_f32)?;
        assert_eq!(train.len(), 3);
        assert_eq!(val.len(), 1);
        assert_eq!(test.len(), 1);
        Ok(())
    }

    #[rstest]
    fn test_download_and_load_file_reads_existing_file(
        preference_data: Vec<PreferenceExample>,
    ) -> Result<()> {
        let mut file = NamedTempFile::new()?;
        file.write_all(serde_json::to_string(&preference_data)?.as_bytes())?;

        // file exists, so the bogus url is never touched
        let loaded = download_and_load_file(file.path(), "http://localhost/does-not-exist")?;
        assert_eq!(loaded, preference_data);
        Ok(())
    }

    #[rstest]
    fn test_collator_worked_example() -> Result<()> {
        // accept=[[1,2,3]], reject=[[1,2]] must collate to rows
        // [[1,2,3],[1,2,PAD]] with masks [[1,1,1],[1,1,0]]
        let collator = PairwiseDataCollator::new();
        let accept = Tensor::new(&[1_u32, 2, 3], &Device::Cpu)?;
        let reject = Tensor::new(&[1_u32, 2], &Device::Cpu)?;

        let batch = collator.collate(vec![(accept, reject)])?;

        assert_eq!(
            batch.input_ids.to_vec2::<u32>()?,
            &[[1_u32, 2, 3], [1, 2, DEFAULT_PAD_TOKEN_ID]]
        );
        assert_eq!(
            batch.attention_mask.to_vec2::<u32>()?,
            &[[1_u32, 1, 1], [1, 1, 0]]
        );
        Ok(())
    }

    #[rstest]
    fn test_collator_halves_stay_index_aligned() -> Result<()> {
        let collator = PairwiseDataCollator::new().pad_token_id(0_u32);
        let batch = vec![
            (
                Tensor::new(&[11_u32, 12], &Device::Cpu)?,
                Tensor::new(&[21_u32], &Device::Cpu)?,
            ),
            (
                Tensor::new(&[31_u32, 32, 33], &Device::Cpu)?,
                Tensor::new(&[41_u32, 42], &Device::Cpu)?,
            ),
        ];

        let collated = collator.collate(batch)?;
        let rows = collated.input_ids.to_vec2::<u32>()?;
        let masks = collated.attention_mask.to_vec2::<u32>()?;

        // 2N rows; row i and row i+N come from the same source example
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], vec![11, 12, 0]);
        assert_eq!(rows[2], vec![21, 0, 0]);
        assert_eq!(rows[1], vec![31, 32, 33]);
        assert_eq!(rows[3], vec![41, 42, 0]);

        // non-pad length equals original length; padding strictly trailing
        assert_eq!(masks[0], vec![1, 1, 0]);
        assert_eq!(masks[2], vec![1, 0, 0]);
        assert_eq!(masks[1], vec![1, 1, 1]);
        assert_eq!(masks[3], vec![1, 1, 0]);
        Ok(())
    }

    #[rstest]
    fn test_collator_rejects_empty_sequence() -> Result<()> {
        let collator = PairwiseDataCollator::new();
        let batch = vec![(
            Tensor::new(&[1_u32, 2], &Device::Cpu)?,
            Tensor::from_vec(Vec::<u32>::new(), (0,), &Device::Cpu)?,
        )];

        assert!(collator.collate(batch).is_err());
        Ok(())
    }

    #[rstest]
    fn test_collator_truncates_from_the_front() -> Result<()> {
        let collator = PairwiseDataCollator::new().allowed_max_length(Some(3_usize));
        let accept = Tensor::new(&[1_u32, 2, 3, 4, 5], &Device::Cpu)?;
        let reject = Tensor::new(&[7_u32, 8], &Device::Cpu)?;

        let batch = collator.collate(vec![(accept, reject)])?;
        let rows = batch.input_ids.to_vec2::<u32>()?;

        // the sequence end (where the reward is read) survives truncation
        assert_eq!(rows[0], vec![3, 4, 5]);
        assert_eq!(rows[1], vec![7, 8, DEFAULT_PAD_TOKEN_ID]);
        Ok(())
    }

    #[rstest]
    fn test_preference_data_loader(preference_data: Vec<PreferenceExample>) -> Result<()> {
        let tokenizer = get_bpe_from_model("gpt2")?;
        let formatter = AlpacaPromptFormatter;
        let dataset = PreferenceDataset::new(preference_data, &tokenizer, &formatter)?;

        let batch_size = 2_usize;
        let collator = PairwiseDataCollator::new();
        let loader = PreferenceDataLoader::new(dataset, batch_size, false, false, collator);

        let mut batcher = loader.batcher();
        let mut count = 0_usize;
        while let Some(Ok(batch)) = batcher.next() {
            assert!(batch.num_rows()? <= 2 * batch_size);
            assert_eq!(batch.num_rows()? % 2, 0);
            assert_eq!(batch.input_ids.dims(), batch.attention_mask.dims());
            count += 1;
        }
        // 5 examples at batch size 2 without drop_last -> 3 batches
        assert_eq!(count, 3);
        assert_eq!(loader.len(), count);
        assert!(!loader.is_empty());
        Ok(())
    }

    #[rstest]
    fn test_preference_data_loader_drop_last(
        preference_data: Vec<PreferenceExample>,
    ) -> Result<()> {
        let tokenizer = get_bpe_from_model("gpt2")?;
        let formatter = AlpacaPromptFormatter;
        let dataset = PreferenceDataset::new(preference_data, &tokenizer, &formatter)?;

        let loader =
            PreferenceDataLoader::new(dataset, 2_usize, false, true, PairwiseDataCollator::new());
        assert_eq!(loader.len(), 2);
        Ok(())
    }
}
