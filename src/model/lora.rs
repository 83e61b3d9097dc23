//! Low-rank adapters
//!
//! A LoRA-wrapped linear layer computes `W x + (alpha / r) * B A dropout(x)`
//! where `W` is frozen and only `A` and `B` are trainable.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{init, Dropout, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// Adapter hyperparameters, also persisted as `adapter_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    #[serde(rename = "r")]
    pub rank: usize,
    pub lora_alpha: f32,
    pub lora_dropout: f32,
    /// Names of the linear layers that receive adapters
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub base_model_name_or_path: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default = "default_bias")]
    pub bias: String,
}

fn default_task_type() -> String {
    "SEQ_CLS".to_string()
}

fn default_bias() -> String {
    "none".to_string()
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            lora_alpha: 32.0,
            lora_dropout: 0.1,
            target_modules: vec!["query".to_string(), "key".to_string(), "value".to_string()],
            base_model_name_or_path: String::new(),
            task_type: default_task_type(),
            bias: default_bias(),
        }
    }
}

impl LoraConfig {
    pub fn new(rank: usize, lora_alpha: f32, lora_dropout: f32) -> Self {
        Self {
            rank,
            lora_alpha,
            lora_dropout,
            ..Default::default()
        }
    }

    pub fn target_modules(mut self, target_modules: Vec<String>) -> Self {
        self.target_modules = target_modules;
        self
    }

    pub fn base_model_name_or_path(mut self, name: &str) -> Self {
        self.base_model_name_or_path = name.to_string();
        self
    }

    pub fn scaling(&self) -> f64 {
        self.lora_alpha as f64 / self.rank as f64
    }

    pub fn targets(&self, layer_name: &str) -> bool {
        self.target_modules.iter().any(|m| m == layer_name)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rank == 0 {
            anyhow::bail!("LoRA rank must be positive");
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            anyhow::bail!("LoRA dropout must be in [0, 1), got {}", self.lora_dropout);
        }
        Ok(())
    }
}

/// The trainable `A` and `B` matrices of an adapter
#[derive(Clone, Debug)]
pub struct LoRALayer {
    a: Tensor,
    b: Tensor,
    scaling: f64,
    dropout: Dropout,
}

impl LoRALayer {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        cfg: &LoraConfig,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let a = vb.get_with_hints(
            (cfg.rank, in_dim),
            "lora_a",
            Init::Kaiming {
                dist: init::NormalOrUniform::Uniform,
                fan: init::FanInOut::FanIn,
                non_linearity: init::NonLinearity::Linear,
            },
        )?;
        // zero init so a fresh adapter leaves the base layer unchanged
        let b = vb.get_with_hints((out_dim, cfg.rank), "lora_b", Init::Const(0.))?;
        Ok(Self {
            a,
            b,
            scaling: cfg.scaling(),
            dropout: Dropout::new(cfg.lora_dropout),
        })
    }

    pub fn rank(&self) -> usize {
        self.a.dims()[0]
    }
}

impl ModuleT for LoRALayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.dropout.forward(xs, train)?;
        let out = xs
            .broadcast_matmul(&self.a.t()?)?
            .broadcast_matmul(&self.b.t()?)?;
        out * self.scaling
    }
}

/// A frozen `Linear` plus a `LoRALayer`
#[derive(Clone, Debug)]
pub struct LinearWithLoRA {
    linear: Linear,
    lora: LoRALayer,
}

impl LinearWithLoRA {
    pub fn new(linear: Linear, lora: LoRALayer) -> Self {
        Self { linear, lora }
    }

    pub fn linear(&self) -> &Linear {
        &self.linear
    }
}

impl ModuleT for LinearWithLoRA {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.linear.forward(xs)? + self.lora.forward_t(xs, train)?
    }
}

/// A linear layer that may or may not carry an adapter
#[derive(Clone, Debug)]
pub enum LinearLayer {
    Frozen(Linear),
    LoRA(LinearWithLoRA),
}

impl LinearLayer {
    pub fn is_lora(&self) -> bool {
        matches!(self, Self::LoRA(_))
    }
}

impl ModuleT for LinearLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Frozen(l) => l.forward(xs),
            Self::LoRA(l) => l.forward_t(xs, train),
        }
    }
}

/// Pairs the frozen base weights with the trainable adapter weights while a
/// model is constructed.
///
/// `base` resolves pretrained (or randomly initialized) weights that are
/// never updated; `adapter` is backed by the `VarMap` handed to the optimizer.
#[derive(Clone)]
pub struct LoraBuilder<'a> {
    base: VarBuilder<'a>,
    adapter: VarBuilder<'a>,
    cfg: LoraConfig,
}

impl<'a> LoraBuilder<'a> {
    pub fn new(base: VarBuilder<'a>, adapter: VarBuilder<'a>, cfg: LoraConfig) -> Self {
        Self { base, adapter, cfg }
    }

    pub fn pp<S: ToString>(&self, s: S) -> Self {
        let s = s.to_string();
        Self {
            base: self.base.pp(&s),
            adapter: self.adapter.pp(&s),
            cfg: self.cfg.clone(),
        }
    }

    pub fn base(&self) -> &VarBuilder<'a> {
        &self.base
    }

    /// Builds the linear layer `name`, wrapping it with an adapter if it is
    /// one of the configured target modules.
    pub fn linear(
        &self,
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        name: &str,
    ) -> Result<LinearLayer> {
        let linear = candle_nn::linear_b(in_dim, out_dim, bias, self.base.pp(name))?;
        if self.cfg.targets(name) {
            let lora = LoRALayer::new(in_dim, out_dim, &self.cfg, self.adapter.pp(name))?;
            Ok(LinearLayer::LoRA(LinearWithLoRA::new(linear, lora)))
        } else {
            Ok(LinearLayer::Frozen(linear))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rstest::*;

    #[fixture]
    fn lora_cfg() -> LoraConfig {
        LoraConfig::new(2_usize, 4.0_f32, 0.0_f32).target_modules(vec!["query".to_string()])
    }

    #[rstest]
    fn test_lora_config_scaling_and_serde(lora_cfg: LoraConfig) -> Result<()> {
        assert_eq!(lora_cfg.scaling(), 2.0_f64);
        let json = serde_json::to_string(&lora_cfg)?;
        assert!(json.contains("\"r\":2"));
        let restored: LoraConfig = serde_json::from_str(&json)?;
        assert_eq!(restored, lora_cfg);
        Ok(())
    }

    #[rstest]
    fn test_lora_config_validate() {
        assert!(LoraConfig::default().validate().is_ok());
        assert!(LoraConfig::new(0, 32.0, 0.1).validate().is_err());
        assert!(LoraConfig::new(8, 32.0, 1.0).validate().is_err());
    }

    #[rstest]
    fn test_fresh_adapter_is_identity(lora_cfg: LoraConfig) -> Result<()> {
        let dev = Device::Cpu;
        let base_map = VarMap::new();
        let adapter_map = VarMap::new();
        let builder = LoraBuilder::new(
            VarBuilder::from_varmap(&base_map, DType::F32, &dev),
            VarBuilder::from_varmap(&adapter_map, DType::F32, &dev),
            lora_cfg,
        );
        let layer = builder.linear(6, 4, true, "query")?;
        assert!(layer.is_lora());
        let LinearLayer::LoRA(inner) = &layer else {
            unreachable!()
        };

        let xs = Tensor::rand(0f32, 1f32, (2_usize, 3_usize, 6_usize), &dev)?;
        let with_lora = layer.forward_t(&xs, true)?;
        let base_only = inner.linear().forward(&xs)?;
        let diff = (with_lora - base_only)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0_f32);
        assert_eq!(inner.lora.rank(), 2_usize);
        Ok(())
    }

    #[rstest]
    fn test_only_targets_are_adapted(lora_cfg: LoraConfig) -> Result<()> {
        let dev = Device::Cpu;
        let base_map = VarMap::new();
        let adapter_map = VarMap::new();
        let builder = LoraBuilder::new(
            VarBuilder::from_varmap(&base_map, DType::F32, &dev),
            VarBuilder::from_varmap(&adapter_map, DType::F32, &dev),
            lora_cfg,
        );
        let query = builder.pp("mha").linear(6, 6, false, "query")?;
        let value = builder.pp("mha").linear(6, 6, false, "value")?;

        assert!(query.is_lora());
        assert!(!value.is_lora());
        let mut adapter_names = adapter_map
            .data()
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        adapter_names.sort();
        assert_eq!(adapter_names, vec!["mha.query.lora_a", "mha.query.lora_b"]);
        Ok(())
    }
}
