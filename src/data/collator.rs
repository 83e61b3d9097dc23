//! Padding collator and data loader for tokenized preference pairs

use super::{PreferenceDataset, TokenizedPair};
use crate::tokenizer::DEFAULT_PAD_TOKEN_ID;
use anyhow::{bail, Context};
use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// A collated batch of preference pairs
///
/// Each side is padded on its own, so `input_ids_j` and `input_ids_k` may
/// have different sequence lengths.
#[derive(Debug, Clone)]
pub struct RewardBatch {
    pub input_ids_j: Tensor,
    pub attention_mask_j: Tensor,
    pub input_ids_k: Tensor,
    pub attention_mask_k: Tensor,
    /// Always set; marks batches that the trainer computes a loss on
    pub return_loss: bool,
}

impl RewardBatch {
    pub fn batch_size(&self) -> usize {
        self.input_ids_j.dims().first().copied().unwrap_or(0)
    }
}

/// Pads both sides of a list of pairs into rectangular tensors
#[derive(Debug, Clone)]
pub struct RewardDataCollator {
    pad_token_id: u32,
    max_length: Option<usize>,
    pad_to_multiple_of: Option<usize>,
    device: Device,
}

impl Default for RewardDataCollator {
    fn default() -> Self {
        Self {
            pad_token_id: DEFAULT_PAD_TOKEN_ID,
            max_length: None,
            pad_to_multiple_of: None,
            device: Device::Cpu,
        }
    }
}

impl RewardDataCollator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    /// Sequences longer than `max_length` are cut before padding.
    pub fn max_length(mut self, max_length: Option<usize>) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn pad_to_multiple_of(mut self, pad_to_multiple_of: Option<usize>) -> Self {
        self.pad_to_multiple_of = pad_to_multiple_of.filter(|m| *m > 0);
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Collates pairs into a [`RewardBatch`].
    ///
    /// Errors if `batch` is empty.
    pub fn collate(&self, batch: &[&TokenizedPair]) -> anyhow::Result<RewardBatch> {
        if batch.is_empty() {
            bail!("Cannot collate an empty batch");
        }
        let (input_ids_j, attention_mask_j) = self.pad_side(
            batch
                .iter()
                .map(|p| (&p.input_ids_j[..], &p.attention_mask_j[..])),
        )?;
        let (input_ids_k, attention_mask_k) = self.pad_side(
            batch
                .iter()
                .map(|p| (&p.input_ids_k[..], &p.attention_mask_k[..])),
        )?;
        Ok(RewardBatch {
            input_ids_j,
            attention_mask_j,
            input_ids_k,
            attention_mask_k,
            return_loss: true,
        })
    }

    fn padded_length(&self, batch_max_length: usize) -> usize {
        let mut length = match self.pad_to_multiple_of {
            Some(m) => batch_max_length.div_ceil(m) * m,
            None => batch_max_length,
        };
        if let Some(a) = self.max_length {
            length = std::cmp::min(a, length);
        }
        length
    }

    fn pad_side<'a, I>(&self, side: I) -> anyhow::Result<(Tensor, Tensor)>
    where
        I: Iterator<Item = (&'a [u32], &'a [u32])> + Clone,
    {
        let batch_max_length = side
            .clone()
            .map(|(ids, _)| ids.len())
            .max()
            .context("Unable to get max length for batch.")?;
        let padded_length = self.padded_length(batch_max_length);

        let mut ids_lst: Vec<u32> = vec![];
        let mut mask_lst: Vec<u32> = vec![];
        let mut num_rows = 0_usize;
        for (ids, mask) in side {
            let keep = std::cmp::min(ids.len(), padded_length);
            let num_pad = padded_length - keep;
            ids_lst.extend_from_slice(&ids[..keep]);
            ids_lst.extend(std::iter::repeat(self.pad_token_id).take(num_pad));
            mask_lst.extend_from_slice(&mask[..std::cmp::min(mask.len(), keep)]);
            // masks shorter than their ids are padded as unattended
            let num_unattended = keep.saturating_sub(mask.len()) + num_pad;
            mask_lst.extend(std::iter::repeat(0_u32).take(num_unattended));
            num_rows += 1;
        }

        let shape = (num_rows, padded_length);
        let ids = Tensor::from_vec(ids_lst, shape, &self.device)?;
        let mask = Tensor::from_vec(mask_lst, shape, &self.device)?;
        Ok((ids, mask))
    }
}

/// Batches a [`PreferenceDataset`] through a [`RewardDataCollator`]
#[derive(Clone)]
pub struct PreferenceDataLoader {
    dataset: PreferenceDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    collator: RewardDataCollator,
}

impl PreferenceDataLoader {
    pub fn new(
        dataset: PreferenceDataset,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        collator: RewardDataCollator,
    ) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            drop_last,
            seed: 0_u64,
            collator,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Returns a batcher over the dataset; when shuffling, the order is a
    /// deterministic function of the loader's seed and `epoch`.
    pub fn batcher(&self, epoch: usize) -> PreferenceDataBatcher {
        let mut indices = (0..self.dataset.len()).collect::<Vec<_>>();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        indices.reverse();
        PreferenceDataBatcher {
            dataset: self.dataset.clone(),
            remaining_indices: indices,
            batch_size: self.batch_size,
            drop_last: self.drop_last,
            collator: self.collator.clone(),
        }
    }

    /// Number of batches per epoch
    pub fn len(&self) -> usize {
        if self.drop_last {
            self.dataset.len() / self.batch_size
        } else {
            self.dataset.len().div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &PreferenceDataset {
        &self.dataset
    }
}

pub struct PreferenceDataBatcher {
    dataset: PreferenceDataset,
    remaining_indices: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    collator: RewardDataCollator,
}

impl Iterator for PreferenceDataBatcher {
    type Item = anyhow::Result<RewardBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let num_remaining = self.remaining_indices.len();
        if num_remaining == 0 || (self.drop_last && num_remaining < self.batch_size) {
            return None;
        }
        let take = std::cmp::min(self.batch_size, num_remaining);
        let idxs = self.remaining_indices.split_off(num_remaining - take);
        let pairs = idxs
            .iter()
            .rev()
            .map(|idx| self.dataset.get_item_at_index(*idx))
            .collect::<anyhow::Result<Vec<_>>>();
        Some(pairs.and_then(|pairs| self.collator.collate(&pairs)))
    }
}
