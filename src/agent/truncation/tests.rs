use super::*;

#[test]
fn short_result_passes_through() {
    assert_eq!(truncate_tool_result("ok", 100), "ok");
}

#[test]
fn ansi_codes_are_stripped() {
    assert_eq!(truncate_tool_result("\x1b[31mred\x1b[0m", 100), "red");
}

#[test]
fn long_text_is_cut_with_marker() {
    let text = "word ".repeat(500);
    let result = truncate_tool_result(&text, 400);
    assert!(result.len() <= 400 + 100);
    assert!(result.contains("[truncated - showed"));
    assert!(result.contains("Do NOT re-run"));
}

#[test]
fn cut_respects_char_boundaries() {
    let text = "é".repeat(400);
    let result = truncate_tool_result(&text, 301);
    assert!(result.starts_with('é'));
    assert!(result.contains("[truncated"));
}

#[test]
fn tiny_budget_has_no_marker() {
    let result = truncate_tool_result(&"x".repeat(200), 50);
    assert_eq!(result.len(), 50);
}

#[test]
fn json_is_pretty_printed_then_cut() {
    let items: Vec<_> = (0..200).map(|i| serde_json::json!({"id": i, "name": "item"})).collect();
    let raw = serde_json::to_string(&items).unwrap();
    let result = truncate_tool_result(&raw, 1000);
    assert!(result.contains("[JSON truncated"));
    assert!(result.starts_with("[\n"));
}

#[test]
fn data_uri_replaced_with_placeholder() {
    let blob = "A".repeat(300);
    let input = format!("img: data:image/png;base64,{} end", blob);
    let result = strip_binary_blobs(&input);
    assert!(!result.contains(&blob));
    assert!(result.contains("[image/png data, 300 bytes]"));
    assert!(result.ends_with(" end"));
}

#[test]
fn long_base64_replaced_only_with_marker_chars() {
    let b64 = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdef0123456789+/".repeat(8);
    let result = strip_binary_blobs(&format!("before {} after", b64));
    assert!(result.contains("[base64 data,"));

    let plain = "a".repeat(500);
    assert_eq!(strip_binary_blobs(&plain), plain);
}
