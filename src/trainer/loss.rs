//! Pairwise (Bradley-Terry) reward loss

use crate::candle_addons::log_sigmoid;
use crate::data::collator::RewardBatch;
use crate::model::RewardScorer;
use candle_core::{Result, Tensor};

/// Rewards of both sides of a batch, each `(batch,)`
#[derive(Debug, Clone)]
pub struct RewardPair {
    pub rewards_j: Tensor,
    pub rewards_k: Tensor,
}

/// Loss of a batch, optionally with the rewards it was computed from
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub rewards: Option<RewardPair>,
}

/// Computes `-mean(log_sigmoid(rewards_j - rewards_k))`.
///
/// Both tensors must have the same shape.
pub fn pairwise_loss(rewards_j: &Tensor, rewards_k: &Tensor) -> Result<Tensor> {
    if rewards_j.dims() != rewards_k.dims() {
        candle_core::bail!(
            "reward shapes differ: {:?} (j) vs {:?} (k)",
            rewards_j.dims(),
            rewards_k.dims()
        )
    }
    log_sigmoid(&(rewards_j - rewards_k)?)?.mean_all()?.neg()
}

/// Scores both sides of `batch` with `model` and returns the pairwise loss.
pub fn compute_loss<M: RewardScorer + ?Sized>(
    model: &M,
    batch: &RewardBatch,
    return_outputs: bool,
    train: bool,
) -> Result<LossOutput> {
    let rewards_j = model.score(&batch.input_ids_j, &batch.attention_mask_j, train)?;
    let rewards_k = model.score(&batch.input_ids_k, &batch.attention_mask_k, train)?;
    let loss = pairwise_loss(&rewards_j, &rewards_k)?;
    let rewards = return_outputs.then_some(RewardPair {
        rewards_j,
        rewards_k,
    });
    Ok(LossOutput { loss, rewards })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::test_utils::SumScorer;
    use anyhow::Result;
    use candle_core::Device;
    use rstest::*;

    #[rstest]
    #[case(1_usize)]
    #[case(4_usize)]
    #[case(64_usize)]
    fn test_pairwise_loss_known_value(#[case] batch_size: usize) -> Result<()> {
        let dev = Device::Cpu;
        let rewards_j = Tensor::full(2.0_f32, batch_size, &dev)?;
        let rewards_k = Tensor::full(-1.0_f32, batch_size, &dev)?;
        let loss = pairwise_loss(&rewards_j, &rewards_k)?.to_scalar::<f32>()?;
        // -log(sigmoid(3)) = log(1 + e^-3)
        assert!((loss - 0.048_587_35).abs() < 1e-5);
        Ok(())
    }

    #[rstest]
    fn test_pairwise_loss_equal_rewards_is_ln2() -> Result<()> {
        let rewards = Tensor::new(&[0.3_f32, -1.2, 5.0], &Device::Cpu)?;
        let loss = pairwise_loss(&rewards, &rewards)?.to_scalar::<f32>()?;
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
        Ok(())
    }

    #[rstest]
    fn test_pairwise_loss_shape_mismatch_errors() -> Result<()> {
        let rewards_j = Tensor::zeros(3_usize, candle_core::DType::F32, &Device::Cpu)?;
        let rewards_k = Tensor::zeros(2_usize, candle_core::DType::F32, &Device::Cpu)?;
        assert!(pairwise_loss(&rewards_j, &rewards_k).is_err());
        Ok(())
    }

    #[rstest]
    fn test_compute_loss_returns_rewards() -> Result<()> {
        let dev = Device::Cpu;
        let scorer = SumScorer::new(&dev)?;
        let batch = RewardBatch {
            input_ids_j: Tensor::new(&[[3_u32, 4], [1, 0]], &dev)?,
            attention_mask_j: Tensor::new(&[[1_u32, 1], [1, 0]], &dev)?,
            input_ids_k: Tensor::new(&[[2_u32], [5]], &dev)?,
            attention_mask_k: Tensor::new(&[[1_u32], [1]], &dev)?,
            return_loss: true,
        };

        let with_outputs = compute_loss(&scorer, &batch, true, false)?;
        let rewards = with_outputs.rewards.unwrap();
        assert_eq!(rewards.rewards_j.to_vec1::<f32>()?, &[7.0_f32, 1.0]);
        assert_eq!(rewards.rewards_k.to_vec1::<f32>()?, &[2.0_f32, 5.0]);

        let without_outputs = compute_loss(&scorer, &batch, false, false)?;
        assert!(without_outputs.rewards.is_none());
        assert_eq!(
            with_outputs.loss.to_scalar::<f32>()?,
            without_outputs.loss.to_scalar::<f32>()?
        );
        Ok(())
    }
}
