//! Dataset pipeline
//!
//! Turns the configured preference sources into combined train/eval
//! datasets: deterministic shuffle, 90/10 split, optional train subsetting,
//! eval capping, parallel tokenization and length filtering.

use super::{
    preprocess_function, DataSource, PreferenceDataset, PreferenceExample, TokenizedColumns,
};
use crate::prompt::PromptFormatter;
use crate::tokenizer::PairEncoder;
use anyhow::{bail, Context};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;

pub const DEFAULT_EVAL_FRACTION: f64 = 0.1;
pub const DEFAULT_EVAL_SIZE: usize = 250;

/// Settings shared by every source in the pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub seed: u64,
    /// Fraction of each source held out for evaluation
    pub eval_fraction: f64,
    /// Number of eval examples kept per source; `0` keeps all of them
    pub eval_size: usize,
    /// Fail instead of clamping when a source has fewer than `eval_size`
    /// eval examples
    pub strict_eval_size: bool,
    /// Token budget applied when tokenizing
    pub max_seq_length: usize,
    /// Pairs with a side longer than this are dropped after tokenization
    pub max_length: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 1103_u64,
            eval_fraction: DEFAULT_EVAL_FRACTION,
            eval_size: DEFAULT_EVAL_SIZE,
            strict_eval_size: false,
            max_seq_length: 512_usize,
            max_length: 512_usize,
        }
    }
}

/// A training source and its train subset divisor
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub source: DataSource,
    /// When `> 0`, the train split is cut down to `len / subset_divisor`
    pub subset_divisor: usize,
}

/// Raw train/eval partitions of one source
#[derive(Debug, Clone, Default)]
pub struct RawSplits {
    pub train: Vec<PreferenceExample>,
    pub eval: Vec<PreferenceExample>,
}

/// Shuffles `data` with `seed` and holds out `ceil(eval_fraction * n)`
/// examples for evaluation.
pub fn train_eval_split(
    mut data: Vec<PreferenceExample>,
    eval_fraction: f64,
    seed: u64,
) -> anyhow::Result<RawSplits> {
    if !(0.0..1.0).contains(&eval_fraction) {
        bail!("Eval fraction must be in [0, 1), got {eval_fraction}");
    }
    let num_examples = data.len();
    let raw = num_examples as f64 * eval_fraction;
    // guard against float noise, e.g. 2500 * 0.1
    let num_eval = if (raw - raw.round()).abs() < 1e-9 {
        raw.round()
    } else {
        raw.ceil()
    } as usize;
    let num_train = num_examples - num_eval;
    if num_eval == 0 || num_train == 0 {
        bail!(
            "Cannot split {num_examples} examples into non-empty train and eval sets \
            (eval fraction {eval_fraction})"
        );
    }

    let mut rng = StdRng::seed_from_u64(seed);
    data.shuffle(&mut rng);
    let train = data.split_off(num_eval);
    Ok(RawSplits { train, eval: data })
}

/// Keeps the first `len / subset_divisor` train examples when the divisor is
/// positive.
pub fn select_train_subset(
    mut train: Vec<PreferenceExample>,
    subset_divisor: usize,
) -> Vec<PreferenceExample> {
    if subset_divisor > 0 {
        let subset_len = train.len() / subset_divisor;
        train.truncate(subset_len);
    }
    train
}

/// Caps an eval split at `eval_size` examples.
///
/// A split shorter than `eval_size` is an error in strict mode; otherwise it
/// is kept whole and the shortfall is logged.
pub fn select_eval(
    mut eval: Vec<PreferenceExample>,
    eval_size: usize,
    strict: bool,
    source_name: &str,
) -> anyhow::Result<Vec<PreferenceExample>> {
    if eval_size == 0 {
        return Ok(eval);
    }
    if eval.len() < eval_size {
        if strict {
            bail!(
                "Eval split of `{source_name}` has {} examples, fewer than the {eval_size} required",
                eval.len()
            );
        }
        tracing::warn!(
            source = source_name,
            available = eval.len(),
            requested = eval_size,
            "eval split is smaller than the eval size, keeping all available examples"
        );
        return Ok(eval);
    }
    eval.truncate(eval_size);
    Ok(eval)
}

/// Tokenizes `examples` in parallel, one shard per rayon worker, and
/// reassembles the pairs in their original order.
pub fn tokenize_examples<E: PairEncoder + ?Sized, P: PromptFormatter + ?Sized>(
    name: &str,
    examples: &[PreferenceExample],
    encoder: &E,
    prompt_formatter: &P,
    max_seq_length: usize,
) -> anyhow::Result<PreferenceDataset> {
    if examples.is_empty() {
        return Ok(PreferenceDataset::new(name, vec![]));
    }
    let num_shards = rayon::current_num_threads().max(1);
    let shard_size = examples.len().div_ceil(num_shards);

    let shards = examples
        .par_chunks(shard_size)
        .map(|shard| {
            let prompts: Vec<&str> = shard.iter().map(|e| e.prompt().as_str()).collect();
            let responses_j: Vec<&str> = shard.iter().map(|e| e.response_j().as_str()).collect();
            let responses_k: Vec<&str> = shard.iter().map(|e| e.response_k().as_str()).collect();
            preprocess_function(
                &prompts,
                &responses_j,
                &responses_k,
                encoder,
                prompt_formatter,
                max_seq_length,
            )
        })
        .collect::<anyhow::Result<Vec<TokenizedColumns>>>()
        .with_context(|| format!("Unable to tokenize `{name}`"))?;

    let pairs = shards
        .into_iter()
        .flat_map(TokenizedColumns::into_pairs)
        .collect();
    Ok(PreferenceDataset::new(name, pairs))
}

/// Tokenized and filtered train/eval splits of a single source
#[derive(Clone)]
pub struct SourceSplits {
    pub name: String,
    pub train: PreferenceDataset,
    pub eval: PreferenceDataset,
}

/// Runs split, subset, eval cap, tokenization and length filtering for one
/// source's examples.
pub fn prepare_source<E: PairEncoder + ?Sized, P: PromptFormatter + ?Sized>(
    name: &str,
    examples: Vec<PreferenceExample>,
    subset_divisor: usize,
    encoder: &E,
    prompt_formatter: &P,
    cfg: &PipelineConfig,
) -> anyhow::Result<SourceSplits> {
    let RawSplits { train, eval } = train_eval_split(examples, cfg.eval_fraction, cfg.seed)
        .with_context(|| format!("Unable to split `{name}`"))?;
    tracing::info!(source = name, "original train split: {}", train.len());

    let train = select_train_subset(train, subset_divisor);
    if subset_divisor > 0 {
        tracing::info!(source = name, "train subset: {}", train.len());
    }
    let eval = select_eval(eval, cfg.eval_size, cfg.strict_eval_size, name)?;

    let train = tokenize_examples(
        &format!("{name}/train"),
        &train,
        encoder,
        prompt_formatter,
        cfg.max_seq_length,
    )?
    .filter_by_length(cfg.max_length);
    let eval = tokenize_examples(
        &format!("{name}/eval"),
        &eval,
        encoder,
        prompt_formatter,
        cfg.max_seq_length,
    )?
    .filter_by_length(cfg.max_length);
    tracing::info!(
        source = name,
        "filtered train: {}, filtered eval: {}",
        train.len(),
        eval.len()
    );

    Ok(SourceSplits {
        name: name.to_string(),
        train,
        eval,
    })
}

/// The datasets a training run consumes
#[derive(Clone)]
pub struct PreferenceData {
    /// All train splits, in source order
    pub train: PreferenceDataset,
    /// All eval splits, in source order
    pub eval: PreferenceDataset,
    /// Per-source splits, kept for isolated evaluation
    pub sources: Vec<SourceSplits>,
    /// Extra eval-only datasets, tokenized and filtered in full
    pub custom_evals: Vec<PreferenceDataset>,
}

impl PreferenceData {
    /// Concatenates per-source splits without reshuffling.
    pub fn from_sources(sources: Vec<SourceSplits>) -> Self {
        let trains: Vec<&PreferenceDataset> = sources.iter().map(|s| &s.train).collect();
        let evals: Vec<&PreferenceDataset> = sources.iter().map(|s| &s.eval).collect();
        let train = PreferenceDataset::concat("train", &trains);
        let eval = PreferenceDataset::concat("eval", &evals);
        Self {
            train,
            eval,
            sources,
            custom_evals: vec![],
        }
    }

    /// The filtered eval split of a single source
    pub fn source_eval(&self, name: &str) -> Option<&PreferenceDataset> {
        self.sources.iter().find(|s| s.name == name).map(|s| &s.eval)
    }
}

/// Loads every source and runs the full pipeline.
pub fn build_preference_data<E: PairEncoder + ?Sized, P: PromptFormatter + ?Sized>(
    sources: &[SourceConfig],
    custom_evals: &[DataSource],
    encoder: &E,
    prompt_formatter: &P,
    cfg: &PipelineConfig,
) -> anyhow::Result<PreferenceData> {
    let mut splits = vec![];
    for (ix, source_cfg) in sources.iter().enumerate() {
        let examples = source_cfg
            .source
            .load()
            .with_context(|| format!("Unable to load dataset {}", ix + 1))?;
        tracing::info!(source = %source_cfg.source.name(), "loaded {} examples", examples.len());
        let mut name = source_cfg.source.name();
        if splits.iter().any(|s: &SourceSplits| s.name == name) {
            name = format!("{name}-{}", ix + 1);
        }
        splits.push(prepare_source(
            &name,
            examples,
            source_cfg.subset_divisor,
            encoder,
            prompt_formatter,
            cfg,
        )?);
    }

    let mut data = PreferenceData::from_sources(splits);
    for source in custom_evals.iter() {
        let examples = source.load()?;
        let dataset = tokenize_examples(
            &source.name(),
            &examples,
            encoder,
            prompt_formatter,
            cfg.max_seq_length,
        )?
        .filter_by_length(cfg.max_length);
        tracing::info!(source = %source.name(), "custom eval: {}", dataset.len());
        data.custom_evals.push(dataset);
    }
    tracing::info!(
        "combined train: {}, combined eval: {}",
        data.train.len(),
        data.eval.len()
    );
    Ok(data)
}
