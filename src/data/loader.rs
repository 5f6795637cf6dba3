//! Batching preference examples into padded tensors

use super::{
    EncodedPreferenceExample, PreferenceDataset, DEFAULT_IGNORE_INDEX, DEFAULT_PAD_TOKEN_ID,
};
use candle_core::{Device, Result, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Anything that hands out a fresh pass over its data
pub trait DataLoader {
    type Batcher: Iterator;

    fn batcher(&self) -> Self::Batcher;
}

/// A collated batch of preference pairs.
///
/// All four tensors share the shape `(batch, seq_len)`, so the chosen and
/// rejected halves can be concatenated for a single forward pass.
#[derive(Debug, Clone)]
pub struct PreferenceBatch {
    pub chosen_input_ids: Tensor,
    pub chosen_labels: Tensor,
    pub rejected_input_ids: Tensor,
    pub rejected_labels: Tensor,
    /// Dataset positions of the rows, used to look up reference log-probs
    pub indices: Vec<usize>,
}

impl PreferenceBatch {
    pub fn batch_size(&self) -> usize {
        self.indices.len()
    }

    /// Chosen rows followed by rejected rows, as `(input_ids, labels)`
    pub fn concatenated(&self) -> Result<(Tensor, Tensor)> {
        let input_ids = Tensor::cat(&[&self.chosen_input_ids, &self.rejected_input_ids], 0)?;
        let labels = Tensor::cat(&[&self.chosen_labels, &self.rejected_labels], 0)?;
        Ok((input_ids, labels))
    }
}

/// Right-pads both sides of every pair to the longest sequence in the batch
#[derive(Clone)]
pub struct PreferenceCollator {
    pad_token_id: u32,
    ignore_index: i64,
    device: Device,
}

impl Default for PreferenceCollator {
    fn default() -> Self {
        Self {
            pad_token_id: DEFAULT_PAD_TOKEN_ID,
            ignore_index: DEFAULT_IGNORE_INDEX,
            device: Device::Cpu,
        }
    }
}

impl PreferenceCollator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    pub fn ignore_index(mut self, ignore_index: i64) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn collate(&self, batch: &[(usize, &EncodedPreferenceExample)]) -> Result<PreferenceBatch> {
        let batch_max_length = batch
            .iter()
            .map(|(_, example)| example.max_len())
            .max()
            .ok_or_else(|| candle_core::Error::Msg("Unable to collate an empty batch.".to_string()))?;

        let pad_ids = |ids: &[u32]| -> Vec<u32> {
            let mut padded = ids.to_vec();
            padded.resize(batch_max_length, self.pad_token_id);
            padded
        };
        let pad_labels = |labels: &[i64]| -> Vec<i64> {
            let mut padded = labels.to_vec();
            padded.resize(batch_max_length, self.ignore_index);
            padded
        };

        let shape = (batch.len(), batch_max_length);
        let chosen_input_ids = batch
            .iter()
            .flat_map(|(_, e)| pad_ids(e.chosen_input_ids()))
            .collect::<Vec<_>>();
        let chosen_labels = batch
            .iter()
            .flat_map(|(_, e)| pad_labels(e.chosen_labels()))
            .collect::<Vec<_>>();
        let rejected_input_ids = batch
            .iter()
            .flat_map(|(_, e)| pad_ids(e.rejected_input_ids()))
            .collect::<Vec<_>>();
        let rejected_labels = batch
            .iter()
            .flat_map(|(_, e)| pad_labels(e.rejected_labels()))
            .collect::<Vec<_>>();

        Ok(PreferenceBatch {
            chosen_input_ids: Tensor::from_vec(chosen_input_ids, shape, &self.device)?,
            chosen_labels: Tensor::from_vec(chosen_labels, shape, &self.device)?,
            rejected_input_ids: Tensor::from_vec(rejected_input_ids, shape, &self.device)?,
            rejected_labels: Tensor::from_vec(rejected_labels, shape, &self.device)?,
            indices: batch.iter().map(|(ix, _)| *ix).collect(),
        })
    }
}

/// One pass over a `PreferenceDataset`; the trailing batch may be smaller
pub struct PreferenceBatcher {
    dataset: PreferenceDataset,
    collator: PreferenceCollator,
    batch_size: usize,
    remaining_indices: Vec<usize>,
}

impl Iterator for PreferenceBatcher {
    type Item = anyhow::Result<PreferenceBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut items = Vec::with_capacity(self.batch_size);
        while items.len() < self.batch_size {
            match self.remaining_indices.pop() {
                Some(idx) => items.push(idx),
                None => break,
            }
        }
        if items.is_empty() {
            return None;
        }

        let collated = items
            .iter()
            .map(|&idx| Ok((idx, self.dataset.get_item_at_index(idx)?)))
            .collect::<anyhow::Result<Vec<_>>>()
            .and_then(|batch| Ok(self.collator.collate(&batch)?));
        Some(collated)
    }
}

pub struct PreferenceDataLoader {
    dataset: PreferenceDataset,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    collator: PreferenceCollator,
}

impl DataLoader for PreferenceDataLoader {
    type Batcher = PreferenceBatcher;

    /// Returns a `PreferenceBatcher` for the first epoch
    fn batcher(&self) -> PreferenceBatcher {
        self.batcher_for_epoch(0)
    }
}

impl PreferenceDataLoader {
    pub fn new(
        dataset: PreferenceDataset,
        batch_size: usize,
        shuffle: bool,
        collator: PreferenceCollator,
    ) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            seed: 42,
            collator,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Batcher whose shuffle order is fixed by `seed` and `epoch`
    pub fn batcher_for_epoch(&self, epoch: usize) -> PreferenceBatcher {
        let mut remaining_indices = (0..self.dataset.len()).rev().collect::<Vec<_>>();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            remaining_indices.shuffle(&mut rng);
        }
        PreferenceBatcher {
            dataset: self.dataset.clone(),
            collator: self.collator.clone(),
            batch_size: self.batch_size,
            remaining_indices,
        }
    }

    /// Number of batches per epoch, counting the trailing incomplete one
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn dataset(&self) -> &PreferenceDataset {
        &self.dataset
    }
}
