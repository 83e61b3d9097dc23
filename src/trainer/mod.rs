//! Pairwise reward training
//!
//! [`RewardTrainer`] optimizes the trainable variables of a [`RewardScorer`]
//! with the pairwise loss from [`loss`], evaluates with [`metrics`] after
//! every epoch and keeps adapter checkpoints on disk.

pub mod checkpoint;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod report;
#[cfg(test)]
pub(crate) mod test_utils;

use crate::data::{
    collator::{PreferenceDataLoader, RewardDataCollator},
    PreferenceDataset,
};
use crate::model::{lora::ADAPTER_WEIGHTS_FILE, RewardScorer};
use anyhow::{bail, Context};
use candle_core::Tensor;
use checkpoint::{LogEntry, TrainerState, TRAINER_STATE_FILE};
use metrics::{compute_metrics, RewardMetrics};
use optim::{OptimizerKind, RewardOptimizer, SchedulerKind};
use report::{ReportTo, LOSS_CURVE_FILE};
use std::path::{Path, PathBuf};

/// Epoch checkpoints live under `<output_dir>/experiment`
pub const EXPERIMENT_DIR: &str = "experiment";
/// The adapter saved after training, under `<output_dir>`
pub const FINAL_ADAPTER_DIR: &str = "peft_last_checkpoint";

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingArgs {
    pub output_dir: PathBuf,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub num_train_epochs: usize,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    /// Log the training loss every this many optimizer steps
    pub logging_steps: usize,
    pub optim: OptimizerKind,
    pub lr_scheduler_type: SchedulerKind,
    pub seed: u64,
    /// Keep at most this many epoch checkpoints; `None` keeps all
    pub save_total_limit: Option<usize>,
    pub report_to: ReportTo,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            learning_rate: 2e-5,
            weight_decay: 0.001,
            num_train_epochs: 1,
            per_device_train_batch_size: 1,
            per_device_eval_batch_size: 1,
            gradient_accumulation_steps: 1,
            logging_steps: 1,
            optim: OptimizerKind::AdamW,
            lr_scheduler_type: SchedulerKind::Linear,
            seed: 1103,
            save_total_limit: None,
            report_to: ReportTo::None,
        }
    }
}

impl TrainingArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            bail!("weight_decay must be non-negative, got {}", self.weight_decay);
        }
        for (name, value) in [
            ("num_train_epochs", self.num_train_epochs),
            ("per_device_train_batch_size", self.per_device_train_batch_size),
            ("per_device_eval_batch_size", self.per_device_eval_batch_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("logging_steps", self.logging_steps),
        ] {
            if value == 0 {
                bail!("{name} must be at least 1");
            }
        }
        if self.save_total_limit == Some(0) {
            bail!("save_total_limit must be at least 1 when set");
        }
        Ok(())
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.output_dir.join(EXPERIMENT_DIR)
    }
}

/// Mean loss and reward metrics over an evaluation set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOutput {
    pub loss: f64,
    pub metrics: RewardMetrics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    pub global_step: usize,
    /// Mean micro-batch loss over the epochs run by this call
    pub training_loss: f64,
    /// Evaluation after the last epoch, if an eval set was given
    pub eval: Option<EvalOutput>,
}

pub struct RewardTrainer<'a, M: RewardScorer + ?Sized> {
    model: &'a M,
    args: TrainingArgs,
    train_dataset: PreferenceDataset,
    eval_dataset: Option<PreferenceDataset>,
    collator: RewardDataCollator,
    state: TrainerState,
}

impl<'a, M: RewardScorer + ?Sized> RewardTrainer<'a, M> {
    pub fn new(
        model: &'a M,
        args: TrainingArgs,
        train_dataset: PreferenceDataset,
        eval_dataset: Option<PreferenceDataset>,
        collator: RewardDataCollator,
    ) -> anyhow::Result<Self> {
        args.validate()?;
        Ok(Self {
            model,
            args,
            train_dataset,
            eval_dataset,
            collator,
            state: TrainerState::default(),
        })
    }

    pub fn args(&self) -> &TrainingArgs {
        &self.args
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Runs the remaining epochs.
    ///
    /// With `resume`, the adapter weights and state of the latest checkpoint
    /// under the experiment directory are restored first and training picks
    /// up at the next epoch.
    pub fn train(&mut self, resume: bool) -> anyhow::Result<TrainOutput> {
        if self.train_dataset.is_empty() {
            bail!("Training set `{}` is empty", self.train_dataset.name());
        }
        let experiment_dir = self.args.experiment_dir();
        if resume {
            self.resume_from_latest(&experiment_dir)?;
        }

        let train_loader = PreferenceDataLoader::new(
            self.train_dataset.clone(),
            self.args.per_device_train_batch_size,
            true,
            false,
            self.collator.clone(),
        )
        .seed(self.args.seed);
        let accum = self.args.gradient_accumulation_steps;
        let total_steps = train_loader.len().div_ceil(accum) * self.args.num_train_epochs;

        let mut optimizer = RewardOptimizer::new(
            self.args.optim,
            self.model.varmap().all_vars(),
            self.args.learning_rate,
            self.args.weight_decay,
        )?;

        tracing::info!(
            num_examples = self.train_dataset.len(),
            num_epochs = self.args.num_train_epochs,
            batch_size = self.args.per_device_train_batch_size,
            gradient_accumulation_steps = accum,
            total_steps,
            "starting training"
        );

        let mut loss_sum = 0_f64;
        let mut num_micro_batches = 0_usize;
        let mut eval = None;
        for epoch in self.state.epoch..self.args.num_train_epochs {
            let mut accumulated: Option<Tensor> = None;
            let mut accumulated_losses = vec![];
            for batch in train_loader.batcher(epoch) {
                let batch = batch?;
                let loss = loss::compute_loss(self.model, &batch, false, true)?.loss;
                let loss_value = loss.to_scalar::<f32>()? as f64;
                let scaled = (loss / accum as f64)?;
                accumulated = Some(match accumulated {
                    Some(acc) => (acc + scaled)?,
                    None => scaled,
                });
                accumulated_losses.push(loss_value);
                loss_sum += loss_value;
                num_micro_batches += 1;

                if accumulated_losses.len() == accum {
                    if let Some(acc) = accumulated.take() {
                        self.optimizer_step(
                            &mut optimizer,
                            &acc,
                            &accumulated_losses,
                            epoch,
                            total_steps,
                        )?;
                    }
                    accumulated_losses.clear();
                }
            }
            // flush a partial accumulation at the end of the epoch
            if let Some(acc) = accumulated.take() {
                self.optimizer_step(&mut optimizer, &acc, &accumulated_losses, epoch, total_steps)?;
            }
            self.state.epoch = epoch + 1;

            if let Some(eval_dataset) = self.eval_dataset.clone() {
                let output = self.evaluate(&eval_dataset)?;
                tracing::info!(
                    epoch = self.state.epoch,
                    step = self.state.global_step,
                    eval_loss = output.loss,
                    eval_accuracy = output.metrics.accuracy,
                    "evaluation"
                );
                self.state.log_history.push(LogEntry {
                    epoch: self.state.epoch,
                    step: self.state.global_step,
                    eval_loss: Some(output.loss),
                    eval_accuracy: Some(output.metrics.accuracy),
                    ..Default::default()
                });
                eval = Some(output);
            }

            checkpoint::save_checkpoint(
                &experiment_dir,
                self.model.varmap(),
                self.model.lora_config(),
                &self.state,
            )?;
            checkpoint::rotate_checkpoints(&experiment_dir, self.args.save_total_limit)?;
        }

        if self.args.report_to == ReportTo::LossPlot {
            let path = self.args.output_dir.join(LOSS_CURVE_FILE);
            report::plot_losses(&self.state.train_losses(), &self.state.eval_losses(), &path);
            tracing::info!("wrote loss curve to {}", path.display());
        }

        let training_loss = if num_micro_batches > 0 {
            loss_sum / num_micro_batches as f64
        } else {
            f64::NAN
        };
        Ok(TrainOutput {
            global_step: self.state.global_step,
            training_loss,
            eval,
        })
    }

    fn optimizer_step(
        &mut self,
        optimizer: &mut RewardOptimizer,
        loss: &Tensor,
        micro_batch_losses: &[f64],
        epoch: usize,
        total_steps: usize,
    ) -> anyhow::Result<()> {
        let lr = self
            .args
            .lr_scheduler_type
            .lr_at(self.args.learning_rate, self.state.global_step, total_steps);
        optimizer.set_learning_rate(lr);
        let grads = loss.backward()?;
        optimizer.step(&grads)?;
        self.state.global_step += 1;

        if self.state.global_step % self.args.logging_steps == 0 {
            let loss = micro_batch_losses.iter().sum::<f64>() / micro_batch_losses.len() as f64;
            tracing::info!(epoch = epoch + 1, step = self.state.global_step, loss, lr, "train");
            self.state.log_history.push(LogEntry {
                epoch: epoch + 1,
                step: self.state.global_step,
                loss: Some(loss),
                learning_rate: Some(lr),
                ..Default::default()
            });
        }
        Ok(())
    }

    fn resume_from_latest(&mut self, experiment_dir: &Path) -> anyhow::Result<()> {
        let Some(dir) = checkpoint::latest_checkpoint(experiment_dir)? else {
            bail!("No checkpoint to resume from in {}", experiment_dir.display());
        };
        checkpoint::load_adapter(
            self.model.varmap(),
            dir.join(ADAPTER_WEIGHTS_FILE),
            self.model.device(),
        )?;
        self.state = TrainerState::load(dir.join(TRAINER_STATE_FILE))?;
        tracing::info!(
            epoch = self.state.epoch,
            step = self.state.global_step,
            "resumed from {}",
            dir.display()
        );
        Ok(())
    }

    /// Mean loss (weighted by batch size) and reward metrics over `dataset`.
    pub fn evaluate(&self, dataset: &PreferenceDataset) -> anyhow::Result<EvalOutput> {
        if dataset.is_empty() {
            bail!("Evaluation set `{}` is empty", dataset.name());
        }
        let loader = PreferenceDataLoader::new(
            dataset.clone(),
            self.args.per_device_eval_batch_size,
            false,
            false,
            self.collator.clone(),
        );
        let mut loss_sum = 0_f64;
        let mut rewards_j = Vec::with_capacity(dataset.len());
        let mut rewards_k = Vec::with_capacity(dataset.len());
        for batch in loader.batcher(0) {
            let batch = batch?;
            let output = loss::compute_loss(self.model, &batch, true, false)?;
            loss_sum += output.loss.to_scalar::<f32>()? as f64 * batch.batch_size() as f64;
            let rewards = output
                .rewards
                .context("Rewards were requested but not returned")?;
            rewards_j.extend(rewards.rewards_j.to_vec1::<f32>()?);
            rewards_k.extend(rewards.rewards_k.to_vec1::<f32>()?);
        }
        let metrics = compute_metrics(&rewards_j, &rewards_k)?;
        Ok(EvalOutput {
            loss: loss_sum / rewards_j.len() as f64,
            metrics,
        })
    }

    /// Saves the trainable weights (and adapter config) to `dir`.
    pub fn save_model<P: AsRef<Path>>(&self, dir: P) -> anyhow::Result<()> {
        checkpoint::save_adapter(dir.as_ref(), self.model.varmap(), self.model.lora_config())?;
        tracing::info!("saved adapter to {}", dir.as_ref().display());
        Ok(())
    }
}
