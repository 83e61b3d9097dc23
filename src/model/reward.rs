//! GPT-2 sequence scorer
//!
//! The backbone is frozen; LoRA adapters and a bias-free `score` head live in
//! a separate `VarMap` which is the only thing the optimizer sees.

use super::gpt::{Config, GPTModel};
use super::lora::{LoraBuilder, LoraConfig};
use super::{Precision, RewardScorer};
use anyhow::Context;
use candle_core::{DType, Device, Module, ModuleT, Result, Tensor, D};
use candle_nn::{Init, Linear, VarBuilder, VarMap};
use hf_hub::api::sync::Api;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const HF_WEIGHTS_FILE: &str = "model.safetensors";
const SCORE_INIT_STD: f64 = 0.02;

/// Picks, per row, the hidden state of the last attended token.
///
/// Rows are assumed right-padded. A row without any attended token falls
/// back to position 0.
pub fn last_token_hidden(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let (b, _seq_len, emb_dim) = hidden.dims3()?;
    let lengths = attention_mask.to_dtype(DType::F32)?.sum(D::Minus1)?;
    let last_ix = (lengths - 1.0)?.relu()?.to_dtype(DType::U32)?;
    let idx = last_ix
        .reshape((b, 1, 1))?
        .broadcast_as((b, 1, emb_dim))?
        .contiguous()?;
    hidden.gather(&idx, 1)?.squeeze(1)
}

/// A GPT-2 backbone with LoRA adapters and a scalar score head
pub struct GPTRewardModel {
    backbone: GPTModel,
    score_head: Linear,
    adapter: VarMap,
    lora_cfg: LoraConfig,
    device: Device,
}

impl GPTRewardModel {
    /// Builds the model on top of the (frozen) weights resolved by `base`.
    pub fn new(
        cfg: Config,
        base: VarBuilder<'_>,
        lora_cfg: LoraConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let adapter = VarMap::new();
        let adapter_vb = VarBuilder::from_varmap(&adapter, dtype, device);
        let lb = LoraBuilder::new(base, adapter_vb.clone(), lora_cfg.clone());
        let backbone = GPTModel::new(cfg, lb)?;
        let score_weight = adapter_vb.pp("score").get_with_hints(
            (1, cfg.emb_dim),
            "weight",
            Init::Randn {
                mean: 0.,
                stdev: SCORE_INIT_STD,
            },
        )?;
        Ok(Self {
            backbone,
            score_head: Linear::new(score_weight, None),
            adapter,
            lora_cfg,
            device: device.clone(),
        })
    }

    /// Downloads (or reads from a local directory) GPT-2 weights and builds
    /// the scorer on top of them.
    pub fn from_pretrained(
        model_id: &str,
        lora_cfg: LoraConfig,
        precision: Precision,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let cfg = Config::from_model_id(model_id)?;
        let weights_file = resolve_weights_file(model_id)?;
        tracing::info!(model = model_id, "loading weights from {}", weights_file.display());

        let hf_tensors = candle_core::safetensors::load(&weights_file, device)
            .with_context(|| format!("Unable to read {}", weights_file.display()))?;
        let tensors = gpt2_hf_to_local(&hf_tensors, &cfg)?;
        let dtype = precision.dtype(device);
        let base = VarBuilder::from_tensors(tensors, dtype, device);
        let lora_cfg = lora_cfg.base_model_name_or_path(model_id);
        let model = Self::new(cfg, base, lora_cfg, dtype, device)?;
        tracing::info!(
            "trainable parameters: {}",
            model
                .adapter
                .all_vars()
                .iter()
                .map(|v| v.elem_count())
                .sum::<usize>()
        );
        Ok(model)
    }

    pub fn cfg(&self) -> &Config {
        self.backbone.cfg()
    }
}

impl RewardScorer for GPTRewardModel {
    fn score(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.backbone.forward_t(input_ids, train)?;
        let last_hidden = last_token_hidden(&hidden, attention_mask)?;
        self.score_head
            .forward(&last_hidden)?
            .squeeze(D::Minus1)?
            .to_dtype(DType::F32)
    }

    fn varmap(&self) -> &VarMap {
        &self.adapter
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn lora_config(&self) -> Option<&LoraConfig> {
        Some(&self.lora_cfg)
    }
}

fn resolve_weights_file(model_id: &str) -> anyhow::Result<PathBuf> {
    let local = Path::new(model_id);
    if local.is_dir() {
        return Ok(local.join(HF_WEIGHTS_FILE));
    }
    let api = Api::new().context("Failed to initialize HuggingFace Hub API")?;
    api.model(model_id.to_string())
        .get(HF_WEIGHTS_FILE)
        .with_context(|| format!("Unable to fetch {HF_WEIGHTS_FILE} for `{model_id}`"))
}

fn hf_tensor<'a>(tensors: &'a HashMap<String, Tensor>, name: &str) -> anyhow::Result<&'a Tensor> {
    tensors
        .get(name)
        .or_else(|| tensors.get(&format!("transformer.{name}")))
        .with_context(|| format!("Missing tensor `{name}` in GPT-2 weights"))
}

/// Renames HuggingFace GPT-2 tensors to this crate's layout.
///
/// HF stores projections as `Conv1D` with `(in, out)` weights and fuses
/// query/key/value into `c_attn`; these are transposed and split.
pub fn gpt2_hf_to_local(
    hf: &HashMap<String, Tensor>,
    cfg: &Config,
) -> anyhow::Result<HashMap<String, Tensor>> {
    let emb = cfg.emb_dim;
    let mut out = HashMap::new();
    let conv1d = |t: &Tensor| -> Result<Tensor> { t.t()?.contiguous() };

    out.insert("tok_emb.weight".to_string(), hf_tensor(hf, "wte.weight")?.clone());
    out.insert("pos_emb.weight".to_string(), hf_tensor(hf, "wpe.weight")?.clone());
    for b in 0..cfg.n_layers {
        let src = format!("h.{b}");
        let dst = format!("trf.{b}");

        for (hf_norm, norm) in [("ln_1", "norm1"), ("ln_2", "norm2")] {
            out.insert(
                format!("{dst}.{norm}.scale"),
                hf_tensor(hf, &format!("{src}.{hf_norm}.weight"))?.clone(),
            );
            out.insert(
                format!("{dst}.{norm}.shift"),
                hf_tensor(hf, &format!("{src}.{hf_norm}.bias"))?.clone(),
            );
        }

        let c_attn_w = hf_tensor(hf, &format!("{src}.attn.c_attn.weight"))?;
        let c_attn_b = hf_tensor(hf, &format!("{src}.attn.c_attn.bias"))?;
        for (ix, name) in ["query", "key", "value"].iter().enumerate() {
            out.insert(
                format!("{dst}.mha.{name}.weight"),
                conv1d(&c_attn_w.narrow(1, ix * emb, emb)?)?,
            );
            out.insert(
                format!("{dst}.mha.{name}.bias"),
                c_attn_b.narrow(0, ix * emb, emb)?.contiguous()?,
            );
        }

        for (hf_name, name) in [
            ("attn.c_proj", "mha.out_proj"),
            ("mlp.c_fc", "ff.first_layer"),
            ("mlp.c_proj", "ff.second_layer"),
        ] {
            out.insert(
                format!("{dst}.{name}.weight"),
                conv1d(hf_tensor(hf, &format!("{src}.{hf_name}.weight"))?)?,
            );
            out.insert(
                format!("{dst}.{name}.bias"),
                hf_tensor(hf, &format!("{src}.{hf_name}.bias"))?.clone(),
            );
        }
    }
    out.insert("final_norm.scale".to_string(), hf_tensor(hf, "ln_f.weight")?.clone());
    out.insert("final_norm.shift".to_string(), hf_tensor(hf, "ln_f.bias")?.clone());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;

    #[fixture]
    fn tiny_model() -> GPTRewardModel {
        let dev = Device::Cpu;
        let base = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, &dev);
        GPTRewardModel::new(
            Config::gpt_sm_test(),
            vb,
            LoraConfig::new(2, 4.0, 0.0),
            DType::F32,
            &dev,
        )
        .unwrap()
    }

    /// HF-layout tensors with the shapes of `cfg`
    fn hf_tensors(cfg: &Config) -> Result<HashMap<String, Tensor>> {
        let dev = Device::Cpu;
        let e = cfg.emb_dim;
        let mut m = HashMap::new();
        let mut put = |name: String, shape: &[usize]| -> Result<()> {
            m.insert(name, Tensor::randn(0f32, 0.02_f32, shape, &dev)?);
            Ok(())
        };
        put("wte.weight".into(), &[cfg.vocab_size, e])?;
        put("wpe.weight".into(), &[cfg.context_length, e])?;
        for b in 0..cfg.n_layers {
            for ln in ["ln_1", "ln_2"] {
                put(format!("h.{b}.{ln}.weight"), &[e])?;
                put(format!("h.{b}.{ln}.bias"), &[e])?;
            }
            put(format!("h.{b}.attn.c_attn.weight"), &[e, 3 * e])?;
            put(format!("h.{b}.attn.c_attn.bias"), &[3 * e])?;
            put(format!("h.{b}.attn.c_proj.weight"), &[e, e])?;
            put(format!("h.{b}.attn.c_proj.bias"), &[e])?;
            put(format!("h.{b}.mlp.c_fc.weight"), &[e, 4 * e])?;
            put(format!("h.{b}.mlp.c_fc.bias"), &[4 * e])?;
            put(format!("h.{b}.mlp.c_proj.weight"), &[4 * e, e])?;
            put(format!("h.{b}.mlp.c_proj.bias"), &[e])?;
        }
        put("ln_f.weight".into(), &[e])?;
        put("ln_f.bias".into(), &[e])?;
        Ok(m)
    }

    #[rstest]
    fn test_last_token_hidden() -> Result<()> {
        let hidden =
            Tensor::arange(0f32, 12f32, &Device::Cpu)?.reshape((2_usize, 3_usize, 2_usize))?;
        let mask = Tensor::new(&[[1_u32, 1, 0], [0, 0, 0]], &Device::Cpu)?;
        let last = last_token_hidden(&hidden, &mask)?;
        // row 0 -> position 1, row 1 (no tokens) -> position 0
        assert_eq!(last.to_vec2::<f32>()?, &[[2.0_f32, 3.0], [6.0, 7.0]]);
        Ok(())
    }

    #[rstest]
    fn test_score_shape_and_trainable_vars(tiny_model: GPTRewardModel) -> Result<()> {
        let ids = Tensor::new(&[[5_u32, 6, 7], [8, 9, 0]], &Device::Cpu)?;
        let mask = Tensor::new(&[[1_u32, 1, 1], [1, 1, 0]], &Device::Cpu)?;
        let scores = tiny_model.score(&ids, &mask, false)?;
        assert_eq!(scores.dims(), &[2_usize]);
        assert_eq!(scores.dtype(), DType::F32);

        let names = tiny_model
            .varmap()
            .data()
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        assert!(names.contains(&"score.weight".to_string()));
        assert!(names.iter().all(|n| n == "score.weight" || n.contains("lora_")));
        Ok(())
    }

    #[rstest]
    fn test_score_ignores_right_padding(tiny_model: GPTRewardModel) -> Result<()> {
        let dev = Device::Cpu;
        let ids = Tensor::new(&[[11_u32, 12, 13]], &dev)?;
        let mask = Tensor::new(&[[1_u32, 1, 1]], &dev)?;
        let padded_ids = Tensor::new(&[[11_u32, 12, 13, 0, 0]], &dev)?;
        let padded_mask = Tensor::new(&[[1_u32, 1, 1, 0, 0]], &dev)?;

        let score = tiny_model.score(&ids, &mask, false)?.to_vec1::<f32>()?;
        let padded_score = tiny_model.score(&padded_ids, &padded_mask, false)?.to_vec1::<f32>()?;
        assert!((score[0] - padded_score[0]).abs() < 1e-5);
        Ok(())
    }

    #[rstest]
    fn test_gpt2_hf_to_local_splits_and_transposes() -> Result<()> {
        let cfg = Config::gpt_sm_test();
        let hf = hf_tensors(&cfg)?;
        let local = gpt2_hf_to_local(&hf, &cfg)?;

        let e = cfg.emb_dim;
        let key = local.get("trf.1.mha.key.weight").unwrap();
        let expected = hf["h.1.attn.c_attn.weight"].narrow(1, e, e)?.t()?;
        assert_eq!(key.dims(), &[e, e]);
        assert_eq!(key.to_vec2::<f32>()?, expected.to_vec2::<f32>()?);
        assert_eq!(
            local.get("trf.0.ff.first_layer.weight").unwrap().dims(),
            &[4 * e, e]
        );

        // the mapped tensors are enough to build the scorer
        let vb = VarBuilder::from_tensors(local, DType::F32, &Device::Cpu);
        let model = GPTRewardModel::new(cfg, vb, LoraConfig::default(), DType::F32, &Device::Cpu)?;
        let ids = Tensor::new(&[[1_u32, 2, 3]], &Device::Cpu)?;
        let mask = Tensor::ones((1_usize, 3_usize), DType::U32, &Device::Cpu)?;
        assert_eq!(model.score(&ids, &mask, false)?.dims(), &[1_usize]);
        Ok(())
    }

    #[rstest]
    fn test_gpt2_hf_to_local_accepts_prefixed_names() -> Result<()> {
        let cfg = Config::gpt_sm_test();
        let hf = hf_tensors(&cfg)?
            .into_iter()
            .map(|(k, v)| (format!("transformer.{k}"), v))
            .collect::<HashMap<_, _>>();
        assert!(gpt2_hf_to_local(&hf, &cfg).is_ok());

        let mut missing = hf;
        missing.remove("transformer.ln_f.bias");
        assert!(gpt2_hf_to_local(&missing, &cfg).is_err());
        Ok(())
    }
}
