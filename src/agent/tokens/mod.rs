//! Token cost estimation.
//!
//! Estimates are character based and deliberately cheap: they only need to be
//! consistent, so a transcript's total is always the sum of its parts.

/// Characters per token when nothing more specific is known about the model.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Model family prefixes and their observed characters-per-token ratio.
/// The first matching prefix wins, so longer prefixes come first.
const MODEL_RATIOS: &[(&str, f64)] = &[
    ("claude", 3.5),
    ("gpt-4o", 4.0),
    ("gpt-4", 4.0),
    ("gpt-3.5", 4.0),
    ("o1", 4.0),
    ("o3", 4.0),
    ("gemini", 4.0),
    ("deepseek", 3.8),
    ("llama", 3.8),
    ("qwen", 3.6),
    ("mistral", 3.6),
];

/// Ratio for a model id. Accepts vendor-qualified ids (`openai/gpt-4o`).
pub fn chars_per_token(model: &str) -> f64 {
    let name = model.rsplit('/').next().unwrap_or(model).to_ascii_lowercase();
    MODEL_RATIOS
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map_or(DEFAULT_CHARS_PER_TOKEN, |(_, ratio)| *ratio)
}

/// Estimated token cost of `text` for `model`. Empty text costs nothing;
/// any non-empty text costs at least one token.
pub fn estimate_tokens(text: &str, model: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count() as f64;
    (chars / chars_per_token(model)).ceil() as usize
}

/// Sum of per-text estimates.
pub fn estimate_total<'a>(texts: impl IntoIterator<Item = &'a str>, model: &str) -> usize {
    texts.into_iter().map(|t| estimate_tokens(t, model)).sum()
}

/// Largest prefix of `text` (in chars) whose estimate fits in `max_tokens`.
pub fn clip_to_tokens<'a>(text: &'a str, max_tokens: usize, model: &str) -> &'a str {
    if estimate_tokens(text, model) <= max_tokens {
        return text;
    }
    let max_chars = (max_tokens as f64 * chars_per_token(model)).floor() as usize;
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests;
