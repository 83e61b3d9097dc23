//! Pairwise preference reward model training on top of candle.
//!
//! Preference records are stripped of style directives, tokenized pairwise,
//! padded into batches and used to fine-tune LoRA adapters plus a scalar
//! score head on a GPT-2 backbone with the Bradley-Terry loss.

pub mod candle_addons;
pub mod config;
pub mod data;
pub mod model;
pub mod prompt;
pub mod run;
pub mod tokenizer;
pub mod trainer;
