//! Tokenized preference examples and the dataset the trainer iterates over

use super::{PreferenceExample, DEFAULT_IGNORE_INDEX, DEFAULT_PAD_TOKEN_ID};
use anyhow::anyhow;
use itertools::Itertools;
use rayon::{prelude::*, ThreadPoolBuilder};
use std::rc::Rc;
use tiktoken_rs::CoreBPE;

/// Token ids and labels of both sides of a preference pair.
///
/// Each side is `prompt ++ response ++ <|endoftext|>`. In conditional mode
/// the prompt positions of the labels hold `DEFAULT_IGNORE_INDEX`, so only
/// the response is scored. In joint mode labels mirror the inputs and the
/// score is the likelihood of prompt and response together.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedPreferenceExample {
    chosen_prompt_len: usize,
    rejected_prompt_len: usize,
    chosen_input_ids: Vec<u32>,
    chosen_labels: Vec<i64>,
    rejected_input_ids: Vec<u32>,
    rejected_labels: Vec<i64>,
}

fn encode_prompt(tokenizer: &CoreBPE, prompt: &str, max_prompt_length: usize) -> Vec<u32> {
    let mut tokens = tokenizer.encode_with_special_tokens(prompt);
    if tokens.len() > max_prompt_length {
        // keep the end of the prompt, closest to the response
        tokens.drain(..tokens.len() - max_prompt_length);
    }
    tokens
}

fn build_side(
    prompt_tokens: Vec<u32>,
    response_tokens: Vec<u32>,
    eos_token_id: u32,
    joint: bool,
) -> (Vec<u32>, Vec<i64>) {
    let prompt_len = prompt_tokens.len();
    let mut input_ids = prompt_tokens;
    input_ids.extend(response_tokens);
    input_ids.push(eos_token_id);

    let labels = input_ids
        .iter()
        .enumerate()
        .map(|(ix, &id)| {
            if !joint && ix < prompt_len {
                DEFAULT_IGNORE_INDEX
            } else {
                id as i64
            }
        })
        .collect();
    (input_ids, labels)
}

impl EncodedPreferenceExample {
    pub fn from_example(
        example: &PreferenceExample,
        tokenizer: &CoreBPE,
        max_prompt_length: usize,
        joint: bool,
    ) -> Self {
        let chosen_prompt = encode_prompt(tokenizer, &example.chosen_prompt, max_prompt_length);
        let rejected_prompt = if example.is_conditional() {
            chosen_prompt.clone()
        } else {
            encode_prompt(tokenizer, &example.rejected_prompt, max_prompt_length)
        };
        Self::from_token_ids(
            chosen_prompt,
            tokenizer.encode_with_special_tokens(&example.chosen),
            rejected_prompt,
            tokenizer.encode_with_special_tokens(&example.rejected),
            DEFAULT_PAD_TOKEN_ID,
            joint,
        )
    }

    /// Builds both sides from already tokenized prompts and responses;
    /// `eos_token_id` is appended to each response.
    pub fn from_token_ids(
        chosen_prompt: Vec<u32>,
        chosen: Vec<u32>,
        rejected_prompt: Vec<u32>,
        rejected: Vec<u32>,
        eos_token_id: u32,
        joint: bool,
    ) -> Self {
        let chosen_prompt_len = chosen_prompt.len();
        let rejected_prompt_len = rejected_prompt.len();
        let (chosen_input_ids, chosen_labels) =
            build_side(chosen_prompt, chosen, eos_token_id, joint);
        let (rejected_input_ids, rejected_labels) =
            build_side(rejected_prompt, rejected, eos_token_id, joint);

        Self {
            chosen_prompt_len,
            rejected_prompt_len,
            chosen_input_ids,
            chosen_labels,
            rejected_input_ids,
            rejected_labels,
        }
    }

    pub fn chosen_prompt_len(&self) -> usize {
        self.chosen_prompt_len
    }

    pub fn rejected_prompt_len(&self) -> usize {
        self.rejected_prompt_len
    }

    pub fn chosen_input_ids(&self) -> &[u32] {
        &self.chosen_input_ids
    }

    pub fn chosen_labels(&self) -> &[i64] {
        &self.chosen_labels
    }

    pub fn rejected_input_ids(&self) -> &[u32] {
        &self.rejected_input_ids
    }

    pub fn rejected_labels(&self) -> &[i64] {
        &self.rejected_labels
    }

    /// Length of the longer of the two full sequences
    pub fn max_len(&self) -> usize {
        self.chosen_input_ids.len().max(self.rejected_input_ids.len())
    }
}

/// Tokenizes examples on a rayon pool of `num_workers` threads, preserving order
pub fn encode_examples(
    examples: &[PreferenceExample],
    tokenizer: &CoreBPE,
    max_prompt_length: usize,
    joint: bool,
    num_workers: usize,
) -> anyhow::Result<Vec<EncodedPreferenceExample>> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_workers.max(1))
        .build()?;
    let encoded = pool.install(|| {
        examples
            .par_iter()
            .map(|example| {
                EncodedPreferenceExample::from_example(
                    example,
                    tokenizer,
                    max_prompt_length,
                    joint,
                )
            })
            .collect::<Vec<_>>()
    });
    Ok(encoded)
}

/// Drops examples where either full sequence is longer than `max_length`
pub fn filter_long_sequences(
    examples: Vec<EncodedPreferenceExample>,
    max_length: usize,
) -> Vec<EncodedPreferenceExample> {
    let before = examples.len();
    let kept = examples
        .into_iter()
        .filter(|e| e.max_len() <= max_length)
        .collect_vec();
    tracing::info!(
        before,
        after = kept.len(),
        max_length,
        "filtered long sequences"
    );
    kept
}

pub struct PreferenceDataset_ {
    encoded_texts: Vec<EncodedPreferenceExample>,
}

/// Shared, cheaply cloneable collection of encoded examples
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
    pub fn new(encoded_texts: Vec<EncodedPreferenceExample>) -> Self {
        Self(Rc::new(PreferenceDataset_ { encoded_texts }))
    }

    /// Gets the number of preference examples.
    pub fn len(&self) -> usize {
        self.encoded_texts.len()
    }

    /// Checks whether the dataset has no examples.
    pub fn is_empty(&self) -> bool {
        self.encoded_texts.is_empty()
    }

    /// Returns the encoded example at the specified index
    pub fn get_item_at_index(&self, idx: usize) -> anyhow::Result<&EncodedPreferenceExample> {
        self.encoded_texts.get(idx).ok_or_else(|| {
            anyhow!(
                "Index {idx} out of range for dataset of {} examples",
                self.len()
            )
        })
    }

    pub fn encoded_texts(&self) -> &[EncodedPreferenceExample] {
        &self.encoded_texts
    }
}
