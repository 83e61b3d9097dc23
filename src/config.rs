//! Command line configuration of a training run

use crate::data::{
    pipeline::{PipelineConfig, SourceConfig, DEFAULT_EVAL_FRACTION, DEFAULT_EVAL_SIZE},
    DataSource, DEFAULT_HUB_DATA_FILE,
};
use crate::model::{gpt::Config, lora::LoraConfig, Precision};
use crate::trainer::{
    optim::{OptimizerKind, SchedulerKind},
    report::ReportTo,
    TrainingArgs,
};
use anyhow::bail;
use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Clone, Args)]
pub struct ScriptArguments {
    /// GPT-2 model id on the HuggingFace hub, or a local directory holding
    /// `model.safetensors`
    #[arg(long, default_value = "gpt2")]
    pub model_name: String,

    /// First training source: a `.json`/`.jsonl` file or a hub dataset repo
    #[arg(long, default_value = "data/rm_training/P1A.json")]
    pub dataset_name1: String,

    /// Second training source
    #[arg(long, default_value = "data/rm_training/P1B.json")]
    pub dataset_name2: String,

    /// Extra eval-only sources (repeatable)
    #[arg(long)]
    pub eval_dataset_name: Vec<String>,

    /// File fetched from hub dataset repos
    #[arg(long, default_value = DEFAULT_HUB_DATA_FILE)]
    pub hub_file: String,

    /// Token budget per side when tokenizing
    #[arg(long, default_value_t = 512)]
    pub max_seq_length: usize,

    /// Pairs with a longer side are dropped after tokenization
    #[arg(long, default_value_t = 512)]
    pub max_length: usize,

    #[arg(long, default_value_t = 1)]
    pub per_device_train_batch_size: usize,

    #[arg(long, default_value_t = 1)]
    pub per_device_eval_batch_size: usize,

    #[arg(long, default_value_t = 1)]
    pub gradient_accumulation_steps: usize,

    #[arg(long, default_value_t = 2e-5)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 0.001)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = 1103)]
    pub seed: u64,

    /// Log the training loss every this many optimizer steps
    #[arg(long, default_value_t = 1)]
    pub log_freq: usize,

    /// Number of epoch checkpoints to keep; `0` keeps all
    #[arg(long, default_value_t = 0)]
    pub save_total_limit: usize,

    #[arg(long, default_value_t = 8)]
    pub lora_r: usize,

    #[arg(long, default_value_t = 32.0)]
    pub lora_alpha: f32,

    #[arg(long, default_value_t = 0.1)]
    pub lora_dropout: f32,

    /// Linear layers that receive LoRA adapters
    #[arg(long, value_delimiter = ',', default_value = "query,key,value")]
    pub lora_target_modules: Vec<String>,

    /// Load weights in bf16 (accelerators only)
    #[arg(long)]
    pub bf16: bool,

    #[arg(long, default_value_t = 1)]
    pub num_train_epochs: usize,

    /// Keep `1 / train_subset1` of the first source's train split; `0` keeps all
    #[arg(long, default_value_t = 0)]
    pub train_subset1: usize,

    /// Keep `1 / train_subset2` of the second source's train split; `0` keeps all
    #[arg(long, default_value_t = 0)]
    pub train_subset2: usize,

    /// Eval examples kept per source; `0` keeps the whole held-out split
    #[arg(long, default_value_t = DEFAULT_EVAL_SIZE)]
    pub eval_size: usize,

    /// Fail instead of clamping when a source has too few eval examples
    #[arg(long)]
    pub strict_eval_size: bool,

    /// adamw (aliases adamw_hf, adamw_torch) or sgd
    #[arg(long, default_value = "adamw_hf")]
    pub optim: String,

    /// linear, constant or cosine
    #[arg(long, default_value = "linear")]
    pub lr_scheduler_type: String,

    #[arg(long, default_value = "checkpoints/reward_model")]
    pub output_dir: PathBuf,

    /// Continue from the latest checkpoint under `<output_dir>/experiment`
    #[arg(long)]
    pub resume_from_checkpoint: bool,

    /// A `tokenizer.json` to use instead of the GPT-2 BPE
    #[arg(long)]
    pub tokenizer_file: Option<PathBuf>,

    /// none or loss-plot
    #[arg(long, default_value = "none")]
    pub report_to: String,
}

impl ScriptArguments {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_seq_length == 0 || self.max_length == 0 {
            bail!("max_seq_length and max_length must be positive");
        }
        let context_length = Config::from_model_id(&self.model_name)?.context_length;
        if self.max_seq_length > context_length || self.max_length > context_length {
            bail!(
                "max_seq_length and max_length must not exceed {context_length}, the context \
                 length of `{}`",
                self.model_name
            );
        }
        self.optim.parse::<OptimizerKind>()?;
        self.lr_scheduler_type.parse::<SchedulerKind>()?;
        self.report_to.parse::<ReportTo>()?;
        self.lora_config().validate()?;
        self.training_args()?.validate()
    }

    pub fn precision(&self) -> Precision {
        if self.bf16 {
            Precision::BF16
        } else {
            Precision::F32
        }
    }

    pub fn sources(&self) -> Vec<SourceConfig> {
        [
            (&self.dataset_name1, self.train_subset1),
            (&self.dataset_name2, self.train_subset2),
        ]
        .into_iter()
        .map(|(name, subset_divisor)| SourceConfig {
            source: DataSource::from_name(name, &self.hub_file),
            subset_divisor,
        })
        .collect()
    }

    pub fn custom_evals(&self) -> Vec<DataSource> {
        self.eval_dataset_name
            .iter()
            .map(|name| DataSource::from_name(name, &self.hub_file))
            .collect()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            seed: self.seed,
            eval_fraction: DEFAULT_EVAL_FRACTION,
            eval_size: self.eval_size,
            strict_eval_size: self.strict_eval_size,
            max_seq_length: self.max_seq_length,
            max_length: self.max_length,
        }
    }

    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig::new(self.lora_r, self.lora_alpha, self.lora_dropout)
            .target_modules(self.lora_target_modules.clone())
    }

    pub fn training_args(&self) -> anyhow::Result<TrainingArgs> {
        Ok(TrainingArgs {
            output_dir: self.output_dir.clone(),
            learning_rate: self.learning_rate,
            weight_decay: self.weight_decay,
            num_train_epochs: self.num_train_epochs,
            per_device_train_batch_size: self.per_device_train_batch_size,
            per_device_eval_batch_size: self.per_device_eval_batch_size,
            gradient_accumulation_steps: self.gradient_accumulation_steps,
            logging_steps: self.log_freq,
            optim: self.optim.parse()?,
            lr_scheduler_type: self.lr_scheduler_type.parse()?,
            seed: self.seed,
            save_total_limit: (self.save_total_limit > 0).then_some(self.save_total_limit),
            report_to: self.report_to.parse()?,
        })
    }
}
