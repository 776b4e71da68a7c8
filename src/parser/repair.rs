//! Repair heuristics for structured payloads that failed a strict parse.
//!
//! The set is closed: each [`Repair`] is applied at most once, in declaration
//! order, and the caller retries the strict parse exactly once afterwards.

use serde::Serialize;

/// One repair the parser may apply to a candidate segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Repair {
    /// `"""..."""` literals collapsed into a single escaped JSON string.
    TripleQuotedString,
    /// Commas directly before `}` or `]` removed.
    TrailingComma,
    /// Missing closing quote/brackets appended to a truncated payload.
    UnbalancedClosers,
}

impl Repair {
    pub const ALL: [Repair; 3] = [
        Repair::TripleQuotedString,
        Repair::TrailingComma,
        Repair::UnbalancedClosers,
    ];

    fn apply(self, input: &str) -> Option<String> {
        match self {
            Repair::TripleQuotedString => collapse_triple_quotes(input),
            Repair::TrailingComma => strip_trailing_commas(input),
            Repair::UnbalancedClosers => close_unbalanced(input),
        }
    }
}

/// Apply every repair in order. Returns the repaired text and the repairs
/// that actually changed something.
pub fn repair(input: &str) -> (String, Vec<Repair>) {
    let mut text = input.to_string();
    let mut applied = Vec::new();
    for r in Repair::ALL {
        if let Some(next) = r.apply(&text) {
            text = next;
            applied.push(r);
        }
    }
    (text, applied)
}

fn collapse_triple_quotes(input: &str) -> Option<String> {
    const TQ: &str = "\"\"\"";
    if !input.contains(TQ) {
        return None;
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut changed = false;
    while let Some(open) = rest.find(TQ) {
        let after_open = &rest[open + TQ.len()..];
        let Some(close) = after_open.find(TQ) else {
            break;
        };
        out.push_str(&rest[..open]);
        let literal = &after_open[..close];
        // serde_json escapes quotes, backslashes, and control characters
        out.push_str(&serde_json::Value::String(literal.to_string()).to_string());
        rest = &after_open[close + TQ.len()..];
        changed = true;
    }
    if !changed {
        return None;
    }
    out.push_str(rest);
    Some(out)
}

fn strip_trailing_commas(input: &str) -> Option<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut changed = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next, Some('}') | Some(']')) {
                    changed = true;
                } else {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    changed.then_some(out)
}

fn close_unbalanced(input: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                // Mismatched closer: not a truncation, nothing safe to do
                if stack.pop() != Some(c) {
                    return None;
                }
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        return None;
    }

    let mut out = input.trim_end().to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    } else {
        // A payload cut right after a separator cannot be closed as-is
        while out.ends_with(',') || out.ends_with(':') {
            out.pop();
            out = out.trim_end().to_string();
        }
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triple_quotes_collapsed() {
        let input = "{\"content\": \"\"\"def foo():\n    return \"x\"\n\"\"\"}";
        let (out, applied) = repair(input);
        assert_eq!(applied, vec![Repair::TripleQuotedString]);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["content"], "def foo():\n    return \"x\"\n");
    }

    #[test]
    fn test_trailing_comma_outside_strings_only() {
        let input = r#"{"a": [1, 2,], "b": "x,}",}"#;
        let (out, applied) = repair(input);
        assert_eq!(applied, vec![Repair::TrailingComma]);
        assert_eq!(out, r#"{"a": [1, 2], "b": "x,}"}"#);
    }

    #[test]
    fn test_truncated_payload_closed() {
        let input = r#"{"tool": "write_file", "arguments": {"content": "abc"#;
        let (out, applied) = repair(input);
        assert_eq!(applied, vec![Repair::UnbalancedClosers]);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["arguments"]["content"], "abc");
    }

    #[test]
    fn test_dangling_separator_dropped() {
        let (out, _) = repair(r#"{"tool": "read_file", "arguments": {},"#);
        assert!(serde_json::from_str::<serde_json::Value>(&out).is_ok());
    }

    #[test]
    fn test_mismatched_closers_left_alone() {
        let (out, applied) = repair(r#"{"a": [1}"#);
        assert!(applied.is_empty());
        assert_eq!(out, r#"{"a": [1}"#);
    }

    #[test]
    fn test_valid_json_untouched() {
        let input = r#"{"tool": "read_file", "arguments": {}}"#;
        let (out, applied) = repair(input);
        assert!(applied.is_empty());
        assert_eq!(out, input);
    }
}
