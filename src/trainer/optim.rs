//! Optimizer and learning-rate schedule selection

use candle_core::{backprop::GradStore, Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizerKind {
    #[default]
    AdamW,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "adamw" | "adamw_hf" | "adamw_torch" => Ok(Self::AdamW),
            "sgd" => Ok(Self::Sgd),
            _ => anyhow::bail!(
                "Unknown optimizer `{s}`; expected adamw, adamw_hf, adamw_torch or sgd"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerKind {
    /// Linear decay from the base rate to zero
    #[default]
    Linear,
    Constant,
    /// Half-cosine decay to zero
    Cosine,
}

impl FromStr for SchedulerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "constant" => Ok(Self::Constant),
            "cosine" => Ok(Self::Cosine),
            _ => anyhow::bail!("Unknown lr scheduler `{s}`; expected linear, constant or cosine"),
        }
    }
}

impl SchedulerKind {
    /// Learning rate for optimizer step `step` out of `total_steps`.
    pub fn lr_at(&self, base_lr: f64, step: usize, total_steps: usize) -> f64 {
        if total_steps == 0 {
            return base_lr;
        }
        let progress = (step as f64 / total_steps as f64).min(1.0);
        match self {
            Self::Constant => base_lr,
            Self::Linear => base_lr * (1.0 - progress),
            Self::Cosine => base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
        }
    }
}

/// A candle optimizer chosen at runtime
pub enum RewardOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl RewardOptimizer {
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64, weight_decay: f64) -> Result<Self> {
        match kind {
            OptimizerKind::AdamW => {
                let params = ParamsAdamW {
                    lr,
                    weight_decay,
                    ..Default::default()
                };
                Ok(Self::AdamW(AdamW::new(vars, params)?))
            }
            OptimizerKind::Sgd => {
                if weight_decay != 0.0 {
                    tracing::warn!("sgd ignores weight decay ({weight_decay})");
                }
                Ok(Self::Sgd(SGD::new(vars, lr)?))
            }
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::AdamW(opt) => opt.step(grads),
            Self::Sgd(opt) => opt.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}
