use super::*;
use proptest::prelude::*;

#[test]
fn test_empty_text_is_free() {
    assert_eq!(estimate_tokens("", "gpt-4o"), 0);
}

#[test]
fn test_rounds_up_partial_tokens() {
    assert_eq!(estimate_tokens("a", "gpt-4o"), 1);
    assert_eq!(estimate_tokens("abcd", "gpt-4o"), 1);
    assert_eq!(estimate_tokens("abcde", "gpt-4o"), 2);
}

#[test]
fn test_model_family_ratio() {
    assert!((chars_per_token("claude-sonnet-4-5") - 3.5).abs() < f64::EPSILON);
    assert!((chars_per_token("anthropic/claude-haiku") - 3.5).abs() < f64::EPSILON);
    assert!((chars_per_token("GPT-4o-mini") - 4.0).abs() < f64::EPSILON);
    assert!((chars_per_token("some-unknown-model") - DEFAULT_CHARS_PER_TOKEN).abs() < f64::EPSILON);
}

#[test]
fn test_counts_chars_not_bytes() {
    // 4 multibyte chars, 12 bytes
    assert_eq!(estimate_tokens("日本語だ", "gpt-4o"), 1);
}

#[test]
fn test_clip_to_tokens() {
    let text = "abcdefghijklmnop";
    assert_eq!(clip_to_tokens(text, 2, "gpt-4o"), "abcdefgh");
    assert_eq!(clip_to_tokens(text, 100, "gpt-4o"), text);
    assert_eq!(clip_to_tokens(text, 0, "gpt-4o"), "");
}

proptest! {
    #[test]
    fn total_is_sum_of_parts(parts in proptest::collection::vec(".{0,200}", 0..20)) {
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let expected: usize = refs.iter().map(|p| estimate_tokens(p, "claude-3")).sum();
        prop_assert_eq!(estimate_total(refs.iter().copied(), "claude-3"), expected);
    }

    #[test]
    fn estimate_is_deterministic(text in ".{0,500}", model in "[a-z0-9-]{1,20}") {
        prop_assert_eq!(estimate_tokens(&text, &model), estimate_tokens(&text, &model));
    }

    #[test]
    fn clipped_text_fits_budget(text in ".{0,400}", budget in 0usize..100) {
        let clipped = clip_to_tokens(&text, budget, "gpt-4o");
        prop_assert!(estimate_tokens(clipped, "gpt-4o") <= budget);
        prop_assert!(text.starts_with(clipped));
    }
}
