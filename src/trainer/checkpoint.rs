//! Adapter checkpoints and trainer state

use crate::model::lora::{LoraConfig, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};
use anyhow::{anyhow, Context};
use candle_core::Device;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// One logged event of a training run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub epoch: usize,
    pub step: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eval_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eval_accuracy: Option<f64>,
}

/// Progress of a training run, saved with every checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Number of completed epochs
    pub epoch: usize,
    pub global_step: usize,
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)
            .with_context(|| format!("Unable to write {}", path.as_ref().display()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Unable to read {}", path.as_ref().display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed trainer state in {}", path.as_ref().display()))
    }

    pub fn train_losses(&self) -> Vec<(usize, f64)> {
        self.log_history
            .iter()
            .filter_map(|e| e.loss.map(|l| (e.step, l)))
            .collect()
    }

    pub fn eval_losses(&self) -> Vec<(usize, f64)> {
        self.log_history
            .iter()
            .filter_map(|e| e.eval_loss.map(|l| (e.step, l)))
            .collect()
    }
}

/// Writes the adapter weights (and its config, when known) to `dir`.
pub fn save_adapter<P: AsRef<Path>>(
    dir: P,
    varmap: &VarMap,
    lora_cfg: Option<&LoraConfig>,
) -> anyhow::Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("Unable to create {}", dir.display()))?;
    varmap
        .save(dir.join(ADAPTER_WEIGHTS_FILE))
        .with_context(|| format!("Failed to save adapter weights to {}", dir.display()))?;
    if let Some(cfg) = lora_cfg {
        fs::write(
            dir.join(ADAPTER_CONFIG_FILE),
            serde_json::to_string_pretty(cfg)?,
        )?;
    }
    Ok(())
}

/// Overwrites every variable of `varmap` with the tensor of the same name
/// stored in `file`.
pub fn load_adapter<P: AsRef<Path>>(
    varmap: &VarMap,
    file: P,
    device: &Device,
) -> anyhow::Result<()> {
    let file = file.as_ref();
    let tensors = candle_core::safetensors::load(file, device)
        .with_context(|| format!("Unable to read {}", file.display()))?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("Adapter variables are poisoned"))?;
    for (name, var) in data.iter() {
        let tensor = tensors
            .get(name)
            .with_context(|| format!("Missing `{name}` in {}", file.display()))?;
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

/// Saves a full checkpoint as `<experiment_dir>/checkpoint-<step>`.
pub fn save_checkpoint<P: AsRef<Path>>(
    experiment_dir: P,
    varmap: &VarMap,
    lora_cfg: Option<&LoraConfig>,
    state: &TrainerState,
) -> anyhow::Result<PathBuf> {
    let dir = experiment_dir
        .as_ref()
        .join(format!("{CHECKPOINT_PREFIX}{}", state.global_step));
    save_adapter(&dir, varmap, lora_cfg)?;
    state.save(dir.join(TRAINER_STATE_FILE))?;
    tracing::info!("saved checkpoint to {}", dir.display());
    Ok(dir)
}

/// Checkpoint directories under `experiment_dir`, sorted by step.
pub fn list_checkpoints<P: AsRef<Path>>(
    experiment_dir: P,
) -> anyhow::Result<Vec<(usize, PathBuf)>> {
    let experiment_dir = experiment_dir.as_ref();
    if !experiment_dir.is_dir() {
        return Ok(vec![]);
    }
    let mut checkpoints = vec![];
    for entry in fs::read_dir(experiment_dir)? {
        let path = entry?.path();
        let step = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|s| s.parse::<usize>().ok());
        if let (Some(step), true) = (step, path.is_dir()) {
            checkpoints.push((step, path));
        }
    }
    checkpoints.sort_by_key(|(step, _)| *step);
    Ok(checkpoints)
}

pub fn latest_checkpoint<P: AsRef<Path>>(experiment_dir: P) -> anyhow::Result<Option<PathBuf>> {
    Ok(list_checkpoints(experiment_dir)?.pop().map(|(_, path)| path))
}

/// Deletes the oldest checkpoints so that at most `save_total_limit` remain.
pub fn rotate_checkpoints<P: AsRef<Path>>(
    experiment_dir: P,
    save_total_limit: Option<usize>,
) -> anyhow::Result<()> {
    let Some(limit) = save_total_limit else {
        return Ok(());
    };
    let checkpoints = list_checkpoints(experiment_dir)?;
    let num_to_delete = checkpoints.len().saturating_sub(limit);
    for (_, path) in checkpoints.into_iter().take(num_to_delete) {
        tracing::info!("deleting older checkpoint {}", path.display());
        fs::remove_dir_all(&path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::{DType, Tensor};
    use candle_nn::{Init, VarBuilder};
    use rstest::*;

    #[fixture]
    fn varmap() -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((2_usize, 3_usize), "lora_a", Init::Const(1.))
            .unwrap();
        varmap
    }

    #[rstest]
    fn test_save_and_load_adapter(varmap: VarMap) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = LoraConfig::default();
        save_adapter(dir.path(), &varmap, Some(&cfg))?;
        assert!(dir.path().join(ADAPTER_WEIGHTS_FILE).exists());
        let saved_cfg: LoraConfig =
            serde_json::from_str(&fs::read_to_string(dir.path().join(ADAPTER_CONFIG_FILE))?)?;
        assert_eq!(saved_cfg, cfg);

        // clobber, then restore from disk
        let var = varmap.all_vars().pop().unwrap();
        var.set(&Tensor::zeros((2_usize, 3_usize), DType::F32, &Device::Cpu)?)?;
        load_adapter(&varmap, dir.path().join(ADAPTER_WEIGHTS_FILE), &Device::Cpu)?;
        assert_eq!(var.as_tensor().to_vec2::<f32>()?, &[[1.0_f32; 3]; 2]);
        Ok(())
    }

    #[rstest]
    fn test_checkpoint_rotation_and_latest(varmap: VarMap) -> Result<()> {
        let dir = tempfile::tempdir()?;
        for step in [3_usize, 12, 6] {
            let state = TrainerState {
                epoch: step / 3,
                global_step: step,
                log_history: vec![],
            };
            save_checkpoint(dir.path(), &varmap, None, &state)?;
        }
        // not a checkpoint
        fs::create_dir_all(dir.path().join("checkpoint-final"))?;

        let steps = list_checkpoints(dir.path())?
            .into_iter()
            .map(|(s, _)| s)
            .collect::<Vec<_>>();
        assert_eq!(steps, vec![3_usize, 6, 12]);

        rotate_checkpoints(dir.path(), Some(2))?;
        let steps = list_checkpoints(dir.path())?
            .into_iter()
            .map(|(s, _)| s)
            .collect::<Vec<_>>();
        assert_eq!(steps, vec![6_usize, 12]);

        let latest = latest_checkpoint(dir.path())?.unwrap();
        let state = TrainerState::load(latest.join(TRAINER_STATE_FILE))?;
        assert_eq!(state.global_step, 12_usize);
        assert_eq!(state.epoch, 4_usize);
        Ok(())
    }

    #[rstest]
    fn test_latest_checkpoint_missing_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(latest_checkpoint(dir.path().join("nope"))?.is_none());
        Ok(())
    }

    #[rstest]
    fn test_trainer_state_loss_series() {
        let state = TrainerState {
            epoch: 1,
            global_step: 2,
            log_history: vec![
                LogEntry {
                    epoch: 0,
                    step: 1,
                    loss: Some(0.7),
                    learning_rate: Some(1e-3),
                    ..Default::default()
                },
                LogEntry {
                    epoch: 1,
                    step: 2,
                    eval_loss: Some(0.6),
                    eval_accuracy: Some(0.5),
                    ..Default::default()
                },
            ],
        };
        assert_eq!(state.train_losses(), vec![(1_usize, 0.7_f64)]);
        assert_eq!(state.eval_losses(), vec![(2_usize, 0.6_f64)]);
    }
}
