//! Preference data: raw records, the pair tokenizer and tokenized datasets

pub mod collator;
pub mod pipeline;

use crate::prompt::{strip_preference_prompt, PromptFormatter};
use crate::tokenizer::PairEncoder;
use anyhow::{bail, Context};
use hf_hub::{api::sync::Api, Repo, RepoType};
use itertools::izip;
use serde::{Deserialize, Serialize};
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    rc::Rc,
};

pub const DEFAULT_HUB_DATA_FILE: &str = "train.jsonl";

/// A raw preference record where `response_j` is preferred over `response_k`
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceExample {
    #[serde(rename = "user_input")]
    prompt: String,
    #[serde(rename = "completion_a")]
    response_j: String,
    #[serde(rename = "completion_b")]
    response_k: String,
}

impl PreferenceExample {
    pub fn new(prompt: &str, response_j: &str, response_k: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            response_j: response_j.to_string(),
            response_k: response_k.to_string(),
        }
    }

    pub fn prompt(&self) -> &String {
        &self.prompt
    }

    pub fn response_j(&self) -> &String {
        &self.response_j
    }

    pub fn response_k(&self) -> &String {
        &self.response_k
    }
}

/// Where a preference dataset comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// A `.json` or `.jsonl` file on disk
    Json(PathBuf),
    /// A file inside a HuggingFace hub dataset repository
    Hub { repo_id: String, file: String },
}

impl DataSource {
    /// Interprets a dataset name: paths ending in `.json`/`.jsonl` are local
    /// files, anything else names a hub dataset repository.
    pub fn from_name(name: &str, hub_file: &str) -> Self {
        if name.ends_with(".json") || name.ends_with(".jsonl") {
            Self::Json(PathBuf::from(name))
        } else {
            Self::Hub {
                repo_id: name.to_string(),
                file: hub_file.to_string(),
            }
        }
    }

    /// A short human readable name, used to key per-source eval splits
    pub fn name(&self) -> String {
        match self {
            Self::Json(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Self::Hub { repo_id, .. } => repo_id.clone(),
        }
    }

    pub fn load(&self) -> anyhow::Result<Vec<PreferenceExample>> {
        match self {
            Self::Json(path) => load_preference_file(path),
            Self::Hub { repo_id, file } => {
                let api = Api::new()?;
                let repo = api.repo(Repo::new(repo_id.clone(), RepoType::Dataset));
                let local = repo
                    .get(file)
                    .with_context(|| format!("Unable to fetch {file} from dataset {repo_id}"))?;
                load_preference_file(local)
            }
        }
    }
}

/// Loads preference examples from a JSON array file or a JSON lines file.
pub fn load_preference_file<P: AsRef<Path>>(
    file_path: P,
) -> anyhow::Result<Vec<PreferenceExample>> {
    let json_str = read_to_string(file_path.as_ref())
        .with_context(|| format!("Unable to read {}", file_path.as_ref().display()))?;
    if json_str.trim_start().starts_with('[') {
        let data: Vec<PreferenceExample> = serde_json::from_str(&json_str[..])
            .with_context(|| format!("Malformed records in {}", file_path.as_ref().display()))?;
        return Ok(data);
    }
    let mut data = vec![];
    for (line_num, line) in json_str.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let example: PreferenceExample = serde_json::from_str(line).with_context(|| {
            format!(
                "Malformed record at line {} of {}",
                line_num + 1,
                file_path.as_ref().display()
            )
        })?;
        data.push(example);
    }
    Ok(data)
}

/// The two independently tokenized sides of a preference example
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizedPair {
    pub input_ids_j: Vec<u32>,
    pub attention_mask_j: Vec<u32>,
    pub input_ids_k: Vec<u32>,
    pub attention_mask_k: Vec<u32>,
}

impl TokenizedPair {
    /// Whether both sides are at most `max_length` tokens long
    pub fn fits(&self, max_length: usize) -> bool {
        self.input_ids_j.len() <= max_length && self.input_ids_k.len() <= max_length
    }
}

/// Columnar output of [`preprocess_function`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizedColumns {
    pub input_ids_j: Vec<Vec<u32>>,
    pub attention_mask_j: Vec<Vec<u32>>,
    pub input_ids_k: Vec<Vec<u32>>,
    pub attention_mask_k: Vec<Vec<u32>>,
}

impl TokenizedColumns {
    pub fn len(&self) -> usize {
        self.input_ids_j.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids_j.is_empty()
    }

    /// Turns the four columns back into row records.
    pub fn into_pairs(self) -> Vec<TokenizedPair> {
        izip!(
            self.input_ids_j,
            self.attention_mask_j,
            self.input_ids_k,
            self.attention_mask_k
        )
        .map(
            |(input_ids_j, attention_mask_j, input_ids_k, attention_mask_k)| TokenizedPair {
                input_ids_j,
                attention_mask_j,
                input_ids_k,
                attention_mask_k,
            },
        )
        .collect()
    }
}

/// Turns parallel (prompt, response_j, response_k) columns into tokenized
/// pairs.
///
/// Each prompt is stripped of its preference directive and templated; the
/// preferred and the other response are appended to it and both texts are
/// tokenized independently, truncated to `max_seq_length` tokens. No padding
/// is applied.
pub fn preprocess_function<E: PairEncoder + ?Sized, P: PromptFormatter + ?Sized>(
    prompts: &[&str],
    responses_j: &[&str],
    responses_k: &[&str],
    encoder: &E,
    prompt_formatter: &P,
    max_seq_length: usize,
) -> anyhow::Result<TokenizedColumns> {
    if prompts.len() != responses_j.len() || prompts.len() != responses_k.len() {
        bail!(
            "Mismatched column lengths: {} prompts, {} responses_j, {} responses_k",
            prompts.len(),
            responses_j.len(),
            responses_k.len()
        );
    }

    let mut columns = TokenizedColumns::default();
    for (prompt, response_j, response_k) in izip!(prompts, responses_j, responses_k) {
        let question = prompt_formatter.format_prompt(&strip_preference_prompt(prompt));
        let tokenized_j =
            encoder.encode_truncated(&format!("{question}{response_j}"), max_seq_length)?;
        let tokenized_k =
            encoder.encode_truncated(&format!("{question}{response_k}"), max_seq_length)?;

        columns.input_ids_j.push(tokenized_j.input_ids);
        columns.attention_mask_j.push(tokenized_j.attention_mask);
        columns.input_ids_k.push(tokenized_k.input_ids);
        columns.attention_mask_k.push(tokenized_k.attention_mask);
    }
    Ok(columns)
}

pub struct PreferenceDataset_ {
    name: String,
    pairs: Vec<TokenizedPair>,
}

/// A tokenized preference dataset
///
/// NOTE: This is a Rc-wrapped `PreferenceDataset_`, so clones share the
/// underlying pairs.
#[derive(Clone)]
pub struct PreferenceDataset(Rc<PreferenceDataset_>);

impl AsRef<PreferenceDataset> for PreferenceDataset {
    fn as_ref(&self) -> &PreferenceDataset {
        self
    }
}

impl std::ops::Deref for PreferenceDataset {
    type Target = PreferenceDataset_;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PreferenceDataset {
    pub fn new(name: &str, pairs: Vec<TokenizedPair>) -> Self {
        let dataset_ = PreferenceDataset_ {
            name: name.to_string(),
            pairs,
        };
        Self(Rc::new(dataset_))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the number of tokenized pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Checks whether the dataset has no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Returns the tokenized pair at the specified index
    pub fn get_item_at_index(&self, idx: usize) -> anyhow::Result<&TokenizedPair> {
        self.pairs.get(idx).with_context(|| {
            format!(
                "Index {idx} out of range for dataset `{}` of length {}",
                self.name,
                self.len()
            )
        })
    }

    pub fn pairs(&self) -> &Vec<TokenizedPair> {
        &self.pairs
    }

    /// Keeps only the pairs whose two sides are both at most `max_length`
    /// tokens long.
    pub fn filter_by_length(&self, max_length: usize) -> Self {
        let pairs = self
            .pairs
            .iter()
            .filter(|p| p.fits(max_length))
            .cloned()
            .collect();
        Self::new(&self.name, pairs)
    }

    /// Concatenates datasets in the given order, without reshuffling.
    pub fn concat(name: &str, datasets: &[&PreferenceDataset]) -> Self {
        let pairs = datasets
            .iter()
            .flat_map(|d| d.pairs.iter().cloned())
            .collect();
        Self::new(name, pairs)
    }

    /// Length of the longest sequence on either side
    pub fn max_length(&self) -> usize {
        self.pairs
            .iter()
            .map(|p| std::cmp::max(p.input_ids_j.len(), p.input_ids_k.len()))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{TuluPromptFormatter, PREF_PROMPTS};
    use anyhow::Result;
    use rstest::*;
    use std::io::Write;
    use tiktoken_rs::{get_bpe_from_model, CoreBPE};

    #[fixture]
    pub fn preference_example() -> PreferenceExample {
        PreferenceExample::new(
            "What is the capital of France? Generate a response in a sassy manner.",
            "Paris, obviously.",
            "I think it might be Lyon.",
        )
    }

    #[fixture]
    pub fn another_preference_example() -> PreferenceExample {
        PreferenceExample::new(
            "Name a primary color.",
            "Red is a primary color.",
            "Green, maybe?",
        )
    }

    #[fixture]
    pub fn gpt2_bpe() -> CoreBPE {
        get_bpe_from_model("gpt2").unwrap()
    }

    #[rstest]
    fn test_preference_example_deserializes_from_source_fields() -> Result<()> {
        let record = r#"{"user_input": "Q", "completion_a": "A", "completion_b": "B"}"#;
        let example: PreferenceExample = serde_json::from_str(record)?;
        assert_eq!(example, PreferenceExample::new("Q", "A", "B"));
        Ok(())
    }

    #[rstest]
    fn test_preference_example_missing_field_errors() {
        let record = r#"{"user_input": "Q", "completion_a": "A"}"#;
        let example: serde_json::Result<PreferenceExample> = serde_json::from_str(record);
        assert!(example.is_err());
    }

    #[rstest]
    fn test_load_preference_file_json_and_jsonl(
        preference_example: PreferenceExample,
        another_preference_example: PreferenceExample,
    ) -> Result<()> {
        let data = vec![preference_example, another_preference_example];
        let dir = tempfile::tempdir()?;

        let json_path = dir.path().join("prefs.json");
        std::fs::write(&json_path, serde_json::to_string_pretty(&data)?)?;

        let jsonl_path = dir.path().join("prefs.jsonl");
        let mut file = std::fs::File::create(&jsonl_path)?;
        for example in data.iter() {
            writeln!(file, "{}", serde_json::to_string(example)?)?;
        }
        writeln!(file)?;

        assert_eq!(load_preference_file(&json_path)?, data);
        assert_eq!(load_preference_file(&jsonl_path)?, data);
        Ok(())
    }

    #[rstest]
    fn test_load_preference_file_malformed_line_errors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"user_input\": \"Q\"}\n")?;
        let err = load_preference_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
        Ok(())
    }

    #[rstest]
    #[case("data/P1A.json", DataSource::Json(PathBuf::from("data/P1A.json")))]
    #[case("data/P1A.jsonl", DataSource::Json(PathBuf::from("data/P1A.jsonl")))]
    #[case(
        "org/preferences",
        DataSource::Hub {
            repo_id: "org/preferences".to_string(),
            file: DEFAULT_HUB_DATA_FILE.to_string()
        }
    )]
    fn test_data_source_from_name(#[case] name: &str, #[case] expected: DataSource) {
        assert_eq!(DataSource::from_name(name, DEFAULT_HUB_DATA_FILE), expected);
    }

    #[rstest]
    fn test_data_source_name() {
        let source = DataSource::from_name("data/rm_training/P1A.json", DEFAULT_HUB_DATA_FILE);
        assert_eq!(source.name(), "P1A");
    }

    #[rstest]
    fn test_preprocess_function(
        preference_example: PreferenceExample,
        gpt2_bpe: CoreBPE,
    ) -> Result<()> {
        let formatter = TuluPromptFormatter;
        let columns = preprocess_function(
            &[preference_example.prompt().as_str()],
            &[preference_example.response_j().as_str()],
            &[preference_example.response_k().as_str()],
            &gpt2_bpe,
            &formatter,
            512_usize,
        )?;

        let question = "<|user|>\nWhat is the capital of France?  \n<|assistant|>\n";
        let expected_j =
            gpt2_bpe.encode_with_special_tokens(&format!("{question}Paris, obviously."));
        let expected_k =
            gpt2_bpe.encode_with_special_tokens(&format!("{question}I think it might be Lyon."));

        assert_eq!(columns.len(), 1_usize);
        assert_eq!(columns.input_ids_j[0], expected_j);
        assert_eq!(columns.input_ids_k[0], expected_k);
        assert_eq!(columns.attention_mask_j[0], vec![1_u32; expected_j.len()]);
        assert_eq!(columns.attention_mask_k[0], vec![1_u32; expected_k.len()]);
        Ok(())
    }

    #[rstest]
    fn test_preprocess_function_truncates_to_max_seq_length(gpt2_bpe: CoreBPE) -> Result<()> {
        let long_response = "lorem ipsum dolor sit amet ".repeat(50);
        let prompts = vec![PREF_PROMPTS[0], "short prompt"];
        let responses_j = vec![long_response.as_str(), "ok"];
        let responses_k = vec!["no", long_response.as_str()];
        let max_seq_length = 16_usize;

        let columns = preprocess_function(
            &prompts,
            &responses_j,
            &responses_k,
            &gpt2_bpe,
            &TuluPromptFormatter,
            max_seq_length,
        )?;

        for (ids_j, ids_k) in columns.input_ids_j.iter().zip(columns.input_ids_k.iter()) {
            assert!(ids_j.len() <= max_seq_length);
            assert!(ids_k.len() <= max_seq_length);
        }
        assert_eq!(columns.input_ids_j[0].len(), max_seq_length);
        assert_eq!(columns.input_ids_k[1].len(), max_seq_length);
        Ok(())
    }

    #[rstest]
    fn test_preprocess_function_mismatched_columns_errors(gpt2_bpe: CoreBPE) {
        let result = preprocess_function(
            &["a", "b"],
            &["c"],
            &["d", "e"],
            &gpt2_bpe,
            &TuluPromptFormatter,
            8_usize,
        );
        assert!(result.is_err());
    }

    #[rstest]
    fn test_columns_into_pairs() {
        let columns = TokenizedColumns {
            input_ids_j: vec![vec![1, 2], vec![3]],
            attention_mask_j: vec![vec![1, 1], vec![1]],
            input_ids_k: vec![vec![4], vec![5, 6, 7]],
            attention_mask_k: vec![vec![1], vec![1, 1, 1]],
        };
        let pairs = columns.into_pairs();
        assert_eq!(pairs.len(), 2_usize);
        assert_eq!(pairs[1].input_ids_j, vec![3_u32]);
        assert_eq!(pairs[1].input_ids_k, vec![5_u32, 6, 7]);
    }

    #[fixture]
    fn tokenized_pairs() -> Vec<TokenizedPair> {
        let pair = |j: usize, k: usize| TokenizedPair {
            input_ids_j: vec![7_u32; j],
            attention_mask_j: vec![1_u32; j],
            input_ids_k: vec![8_u32; k],
            attention_mask_k: vec![1_u32; k],
        };
        vec![pair(3, 4), pair(9, 2), pair(5, 5), pair(1, 12), pair(6, 6)]
    }

    #[rstest]
    fn test_filter_by_length_is_idempotent(tokenized_pairs: Vec<TokenizedPair>) {
        let dataset = PreferenceDataset::new("toy", tokenized_pairs);
        let filtered = dataset.filter_by_length(6_usize);
        let refiltered = filtered.filter_by_length(6_usize);

        assert_eq!(filtered.len(), 3_usize);
        assert_eq!(filtered.pairs(), refiltered.pairs());
        assert!(filtered.pairs().iter().all(|p| p.fits(6_usize)));
    }

    #[rstest]
    fn test_concat_keeps_source_order(tokenized_pairs: Vec<TokenizedPair>) -> Result<()> {
        let first = PreferenceDataset::new("first", tokenized_pairs[..2].to_vec());
        let second = PreferenceDataset::new("second", tokenized_pairs[2..].to_vec());
        let combined = PreferenceDataset::concat("combined", &[&first, &second]);

        assert_eq!(combined.len(), 5_usize);
        assert_eq!(combined.name(), "combined");
        assert_eq!(combined.pairs(), &tokenized_pairs);
        assert_eq!(*combined.get_item_at_index(2_usize)?, tokenized_pairs[2]);
        assert!(combined.get_item_at_index(5_usize).is_err());
        assert_eq!(combined.max_length(), 12_usize);
        Ok(())
    }
}
