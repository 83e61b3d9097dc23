//! Reward models
//!
//! The trainer only depends on [`RewardScorer`]; [`reward::GPTRewardModel`]
//! is the GPT-2 implementation used by the CLI.

pub mod gpt;
pub mod lora;
pub mod reward;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarMap;
use lora::LoraConfig;
use std::str::FromStr;

/// Something that maps token ids to one scalar reward per sequence
pub trait RewardScorer {
    /// Scores a right-padded batch.
    ///
    /// `input_ids` and `attention_mask` are `(batch, seq_len)` u32 tensors;
    /// the result is a `(batch,)` f32 tensor.
    fn score(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor>;

    /// The trainable parameters
    fn varmap(&self) -> &VarMap;

    fn device(&self) -> &Device;

    /// Adapter hyperparameters written next to saved weights, if any
    fn lora_config(&self) -> Option<&LoraConfig> {
        None
    }
}

/// Numeric precision of the weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    F32,
    BF16,
}

impl FromStr for Precision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "f32" | "fp32" => Ok(Self::F32),
            "bf16" => Ok(Self::BF16),
            _ => anyhow::bail!("Unknown precision `{s}`"),
        }
    }
}

impl Precision {
    /// bf16 is only used on accelerators; CPU runs fall back to f32.
    pub fn dtype(&self, device: &Device) -> DType {
        match self {
            Self::BF16 if device.is_cuda() || device.is_metal() => DType::BF16,
            Self::BF16 => {
                tracing::warn!("bf16 requested on cpu, falling back to f32");
                DType::F32
            }
            Self::F32 => DType::F32,
        }
    }
}
