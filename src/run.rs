//! End-to-end flows behind the command line

use crate::config::ScriptArguments;
use crate::data::{
    collator::RewardDataCollator,
    pipeline::{build_preference_data, PreferenceData},
};
use crate::model::reward::GPTRewardModel;
use crate::prompt::TuluPromptFormatter;
use crate::tokenizer::{load_encoder, PairEncoder};
use crate::trainer::{EvalOutput, RewardTrainer, FINAL_ADAPTER_DIR};
use anyhow::Context;
use candle_core::Device;
use comfy_table::{presets::UTF8_FULL, Table};

fn load_data(args: &ScriptArguments, encoder: &dyn PairEncoder) -> anyhow::Result<PreferenceData> {
    build_preference_data(
        &args.sources(),
        &args.custom_evals(),
        encoder,
        &TuluPromptFormatter,
        &args.pipeline_config(),
    )
}

/// Builds the datasets and prints their sizes without loading a model.
pub fn inspect_data(args: &ScriptArguments) -> anyhow::Result<()> {
    args.validate()?;
    let encoder = load_encoder(args.tokenizer_file.as_deref())?;
    let data = load_data(args, encoder.as_ref())?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["dataset", "pairs", "longest side"]);
    let mut add = |name: &str, len: usize, max_length: usize| {
        table.add_row(vec![name.to_string(), len.to_string(), max_length.to_string()]);
    };
    for source in data.sources.iter() {
        add(&format!("{}/train", source.name), source.train.len(), source.train.max_length());
        add(&format!("{}/eval", source.name), source.eval.len(), source.eval.max_length());
    }
    for custom in data.custom_evals.iter() {
        add(custom.name(), custom.len(), custom.max_length());
    }
    add("train", data.train.len(), data.train.max_length());
    add("eval", data.eval.len(), data.eval.max_length());
    println!("{table}");
    Ok(())
}

fn report_eval(name: &str, output: &EvalOutput) {
    tracing::info!(
        dataset = name,
        loss = output.loss,
        accuracy = output.metrics.accuracy,
        "evaluation"
    );
    println!("{name} (loss {:.4})\n{}", output.loss, output.metrics);
}

/// Trains a reward model on the configured sources and saves the adapter.
pub fn run_training(args: &ScriptArguments) -> anyhow::Result<()> {
    args.validate()?;
    let encoder = load_encoder(args.tokenizer_file.as_deref())?;
    let data = load_data(args, encoder.as_ref())?;

    let device = Device::cuda_if_available(0)?;
    let model = GPTRewardModel::from_pretrained(
        &args.model_name,
        args.lora_config(),
        args.precision(),
        &device,
    )?;
    let collator = RewardDataCollator::new()
        .pad_token_id(encoder.pad_token_id())
        .device(device.clone());

    let training_args = args.training_args()?;
    let output_dir = training_args.output_dir.clone();
    let mut trainer = RewardTrainer::new(
        &model,
        training_args,
        data.train.clone(),
        (!data.eval.is_empty()).then(|| data.eval.clone()),
        collator,
    )?;
    let output = trainer
        .train(args.resume_from_checkpoint)
        .context("Training failed")?;
    tracing::info!(
        global_step = output.global_step,
        training_loss = output.training_loss,
        "training finished"
    );

    for source in data.sources.iter() {
        if source.eval.is_empty() {
            tracing::warn!(source = %source.name, "no eval examples left after filtering");
            continue;
        }
        let eval = trainer.evaluate(&source.eval)?;
        report_eval(&source.name, &eval);
    }
    for custom in data.custom_evals.iter() {
        if custom.is_empty() {
            tracing::warn!(source = custom.name(), "no eval examples left after filtering");
            continue;
        }
        let eval = trainer.evaluate(custom)?;
        report_eval(custom.name(), &eval);
    }

    trainer.save_model(output_dir.join(FINAL_ADAPTER_DIR))
}
