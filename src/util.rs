//! Shared utility functions used across the codebase.

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// JSON type name of a value, for "expected X, found Y" messages.
pub fn json_type(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Append `entry` to an accumulated context, dropping the oldest paragraphs
/// until the result fits in `max_chars`.
///
/// Paragraphs are separated by a blank line. The newest entry is always kept,
/// truncated from the front if it alone exceeds the bound.
pub fn append_bounded_context(context: &str, entry: &str, max_chars: usize) -> String {
    let mut paragraphs: Vec<&str> = context
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .collect();
    paragraphs.push(entry);

    let total = |ps: &[&str]| -> usize {
        ps.iter().map(|p| p.len()).sum::<usize>() + ps.len().saturating_sub(1) * 2
    };
    while paragraphs.len() > 1 && total(&paragraphs) > max_chars {
        paragraphs.remove(0);
    }

    let joined = paragraphs.join("\n\n");
    if joined.len() <= max_chars {
        return joined;
    }
    let mut start = joined.len() - max_chars;
    while !joined.is_char_boundary(start) {
        start += 1;
    }
    joined[start..].to_string()
}

/// Truncate `text` to at most `max_bytes`, on a char boundary, marking the cut.
pub fn truncate_with_marker(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [truncated]", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_bounded_context_keeps_newest() {
        let ctx = append_bounded_context("", "first", 100);
        let ctx = append_bounded_context(&ctx, "second", 100);
        assert_eq!(ctx, "first\n\nsecond");

        let ctx = append_bounded_context(&ctx, "third entry", 15);
        assert_eq!(ctx, "third entry");
    }

    #[test]
    fn append_bounded_context_truncates_oversized_entry() {
        let ctx = append_bounded_context("old", "0123456789", 4);
        assert_eq!(ctx, "6789");
    }

    #[test]
    fn truncate_with_marker_respects_char_boundary() {
        let text = "héllo";
        let out = truncate_with_marker(text, 2);
        assert_eq!(out, "h\n... [truncated]");
        assert_eq!(truncate_with_marker("short", 10), "short");
    }
}
