//! Tokenizer collaborators
//!
//! The data pipeline only needs two capabilities from a tokenizer: encoding a
//! text into token ids plus an attention mask, and a pad token for collation.
//! Both the GPT-2 BPE from `tiktoken-rs` and HuggingFace `tokenizers` files
//! are supported.

use anyhow::{anyhow, Context};
use std::path::Path;
use tiktoken_rs::{get_bpe_from_model, CoreBPE};
use tokenizers::Tokenizer;

/// GPT-2's `<|endoftext|>` token, reused as the pad token
pub const DEFAULT_PAD_TOKEN_ID: u32 = 50_256;
pub const DEFAULT_EOS_TOKEN: &str = "<|endoftext|>";

/// Token ids and attention mask for a single text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoding {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl Encoding {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Keeps at most the first `max_length` tokens.
    pub fn truncate(&mut self, max_length: usize) {
        self.input_ids.truncate(max_length);
        self.attention_mask.truncate(max_length);
    }
}

/// The tokenizer capability consumed by the pair tokenizer and the collator
pub trait PairEncoder: Send + Sync {
    /// Encodes `text` without any truncation or padding.
    fn encode(&self, text: &str) -> anyhow::Result<Encoding>;

    /// The token id used to right-pad sequences.
    fn pad_token_id(&self) -> u32;

    /// Encodes `text` and truncates it to `max_length` tokens.
    fn encode_truncated(&self, text: &str, max_length: usize) -> anyhow::Result<Encoding> {
        let mut encoding = self.encode(text)?;
        encoding.truncate(max_length);
        Ok(encoding)
    }
}

impl PairEncoder for CoreBPE {
    fn encode(&self, text: &str) -> anyhow::Result<Encoding> {
        let input_ids = self.encode_with_special_tokens(text);
        let attention_mask = vec![1_u32; input_ids.len()];
        Ok(Encoding {
            input_ids,
            attention_mask,
        })
    }

    fn pad_token_id(&self) -> u32 {
        DEFAULT_PAD_TOKEN_ID
    }
}

/// A HuggingFace `tokenizers` tokenizer with a resolved pad token
pub struct HfPairEncoder {
    tokenizer: Tokenizer,
    pad_token_id: u32,
}

impl HfPairEncoder {
    /// Loads a `tokenizer.json` file.
    ///
    /// The pad token is the tokenizer's configured padding token if any,
    /// otherwise its EOS token (`</s>` or `<|endoftext|>`). Padding and
    /// truncation settings stored in the file are cleared; the collator pads
    /// and the pair tokenizer truncates.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut tokenizer = Tokenizer::from_file(path.as_ref()).map_err(|e| {
            anyhow!(
                "Unable to load tokenizer from {}: {e}",
                path.as_ref().display()
            )
        })?;
        let pad_token_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("</s>"))
            .or_else(|| tokenizer.token_to_id(DEFAULT_EOS_TOKEN))
            .ok_or_else(|| {
                anyhow!("Tokenizer defines neither a pad token nor an eos token to pad with")
            })?;
        tokenizer
            .with_padding(None)
            .with_truncation(None)
            .map_err(|e| anyhow!("Unable to disable truncation: {e}"))?;
        Ok(Self {
            tokenizer,
            pad_token_id,
        })
    }
}

impl PairEncoder for HfPairEncoder {
    fn encode(&self, text: &str) -> anyhow::Result<Encoding> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenization failed: {e}"))?;
        Ok(Encoding {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }
}

/// Resolves the tokenizer for a run: an explicit `tokenizer.json` if given,
/// otherwise the GPT-2 BPE shipped with `tiktoken-rs`.
pub fn load_encoder(tokenizer_file: Option<&Path>) -> anyhow::Result<Box<dyn PairEncoder>> {
    match tokenizer_file {
        Some(path) => Ok(Box::new(HfPairEncoder::from_file(path)?)),
        None => {
            let bpe = get_bpe_from_model("gpt2").context("Unable to load the gpt2 BPE")?;
            Ok(Box::new(bpe))
        }
    }
}

impl<T: PairEncoder + ?Sized> PairEncoder for Box<T> {
    fn encode(&self, text: &str) -> anyhow::Result<Encoding> {
        (**self).encode(text)
    }

    fn pad_token_id(&self) -> u32 {
        (**self).pad_token_id()
    }
}
