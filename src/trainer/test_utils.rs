//! Scorers used by the trainer tests

use crate::model::RewardScorer;
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::VarMap;

pub const VOCAB_SIZE: usize = 32;

/// Scores a sequence as the sum of one trainable weight per attended token.
///
/// Weights start at `w[i] = i`, so untrained scores are sums of token ids.
pub struct SumScorer {
    varmap: VarMap,
    weights: Var,
    device: Device,
}

impl SumScorer {
    pub fn new(device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let weights = Var::from_tensor(&Tensor::arange(0f32, VOCAB_SIZE as f32, device)?)?;
        varmap
            .data()
            .lock()
            .unwrap()
            .insert("weights".to_string(), weights.clone());
        Ok(Self {
            varmap,
            weights,
            device: device.clone(),
        })
    }

    pub fn weights(&self) -> Result<Vec<f32>> {
        self.weights.as_tensor().to_vec1::<f32>()
    }
}

impl RewardScorer for SumScorer {
    fn score(&self, input_ids: &Tensor, attention_mask: &Tensor, _train: bool) -> Result<Tensor> {
        let (b, l) = input_ids.dims2()?;
        let per_token = self
            .weights
            .as_tensor()
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((b, l))?;
        (per_token * attention_mask.to_dtype(DType::F32)?)?.sum(1)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
