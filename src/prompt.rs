//! Preference prompt stripping and prompt templating

/// Instruction-style preference directives removed from prompts before
/// tokenization. Order matters: the first contained directive wins.
pub const PREF_PROMPTS: [&str; 8] = [
    "Generate a response that can be easily understood by an elementary school student.",
    "Generate a response that only a PhD Student in that specific field could understand.",
    "Generate a response that is concise and to the point, without being verbose.",
    "Generate a response that is very informative, without missing any background information.",
    "Generate a response that is friendly, witty, funny, and humorous, like a close friend.",
    "Generate a response in an unfriendly manner.",
    "Generate a response in a sassy manner.",
    "Generate a response in a sarcastic manner.",
];

/// Removes the first preference directive found anywhere in `prompt`.
///
/// Matching is substring containment. Once a directive matches, all of its
/// occurrences are removed and no other directive is considered.
///
/// ```rust
/// use reward_model_rs::prompt::strip_preference_prompt;
///
/// let prompt = "What is rust? Generate a response in a sassy manner.";
/// assert_eq!(strip_preference_prompt(prompt), "What is rust? ");
/// ```
pub fn strip_preference_prompt(prompt: &str) -> String {
    match PREF_PROMPTS.iter().find(|p| prompt.contains(*p)) {
        Some(pref_prompt) => prompt.replace(pref_prompt, ""),
        None => prompt.to_string(),
    }
}

/// A trait for wrapping a (cleaned) prompt into a chat template
pub trait PromptFormatter: Send + Sync {
    fn format_prompt(&self, prompt: &str) -> String;
}

/// The `<|user|>` / `<|assistant|>` template used by Tulu-style models
#[derive(Debug, Clone, Copy, Default)]
pub struct TuluPromptFormatter;

impl PromptFormatter for TuluPromptFormatter {
    fn format_prompt(&self, prompt: &str) -> String {
        format!("<|user|>\n{prompt} \n<|assistant|>\n")
    }
}
