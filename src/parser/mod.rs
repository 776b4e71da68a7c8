//! Output parser: turns free-text model output into tool-call descriptors.
//!
//! Model output is an untrusted, partially structured stream. The parser
//! looks for two kinds of candidate segments:
//!
//! - fenced blocks tagged as a data format (```` ```json ````, ```` ```tool_call ````,
//!   ```` ```tool ````), or untagged fences whose body starts with `{` / `[`
//! - inline `<tool_call> ... </tool_call>` markers
//!
//! Each candidate gets a strict parse, then one pass of [`repair::repair`] and
//! one retry. Segments that still fail produce a [`ParseDiagnostic`] and are
//! skipped; they never block sibling calls in the same response.
//!
//! Parsing never fails: a reply with no candidates is a conversational reply
//! and yields an empty call list.

pub mod repair;

use serde::Serialize;
use serde_json::{Map, Value};

pub use repair::Repair;

use crate::util::json_type;

const FENCE: &str = "```";
const MARKER_OPEN: &str = "<tool_call>";
const MARKER_CLOSE: &str = "</tool_call>";
const DATA_TAGS: &[&str] = &["json", "tool_call", "tool", "tool_code", "jsonc"];
const SNIPPET_CHARS: usize = 160;

/// Byte range into the raw model text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceSpan {
    pub start: usize,
    pub end: usize,
}

/// How a segment was delimited in the raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Fenced,
    InlineMarker,
}

/// Where a descriptor came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub span: SourceSpan,
    pub segment: SegmentKind,
    /// Position within the segment when one segment holds several calls
    pub index: usize,
    /// Repairs needed before the segment parsed
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<Repair>,
}

/// A structured tool call extracted from model output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallDescriptor {
    pub name: String,
    pub arguments: Map<String, Value>,
    pub provenance: Provenance,
}

/// A segment that looked like a tool call but could not be salvaged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseDiagnostic {
    pub span: SourceSpan,
    pub segment: SegmentKind,
    pub message: String,
    /// Leading part of the offending segment
    pub snippet: String,
}

/// Everything the parser extracted from one response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParseOutcome {
    /// Tool calls in source order
    pub calls: Vec<ToolCallDescriptor>,
    pub diagnostics: Vec<ParseDiagnostic>,
    /// Prose outside candidate segments, trimmed
    pub text: String,
}

#[derive(Debug)]
struct Segment {
    /// Whole segment including delimiters
    span: SourceSpan,
    /// Payload between delimiters
    body: SourceSpan,
    kind: SegmentKind,
    candidate: bool,
}

/// Parse raw model output into tool-call descriptors.
pub fn parse(raw: &str) -> ParseOutcome {
    let segments = scan(raw);
    let mut outcome = ParseOutcome::default();

    for segment in segments.iter().filter(|s| s.candidate) {
        let body = &raw[segment.body.start..segment.body.end];
        if body.trim().is_empty() {
            // e.g. a <tool_call> wrapper around a fenced block
            continue;
        }
        match parse_segment(body) {
            Ok((calls, repairs)) => {
                for (index, call) in calls.into_iter().enumerate() {
                    match call {
                        Ok((name, arguments)) => outcome.calls.push(ToolCallDescriptor {
                            name,
                            arguments,
                            provenance: Provenance {
                                span: segment.span,
                                segment: segment.kind,
                                index,
                                repairs: repairs.clone(),
                            },
                        }),
                        Err(message) => outcome
                            .diagnostics
                            .push(diagnostic(segment, body, format!("call {}: {}", index, message))),
                    }
                }
            }
            Err(message) => outcome.diagnostics.push(diagnostic(segment, body, message)),
        }
    }

    outcome.text = prose(raw, &segments);

    for d in &outcome.diagnostics {
        tracing::debug!(
            "Skipped unparsable {:?} segment at {}..{}: {}",
            d.segment,
            d.span.start,
            d.span.end,
            d.message
        );
    }
    outcome
}

fn diagnostic(segment: &Segment, body: &str, message: String) -> ParseDiagnostic {
    ParseDiagnostic {
        span: segment.span,
        segment: segment.kind,
        message,
        snippet: body.trim().chars().take(SNIPPET_CHARS).collect(),
    }
}

/// Locate fenced blocks and inline markers in one left-to-right pass, so a
/// delimiter inside a JSON string of an earlier segment never opens a new one.
fn scan(raw: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut pos = 0;
    while pos < raw.len() {
        let fence = raw[pos..].find(FENCE).map(|i| pos + i);
        let marker = raw[pos..].find(MARKER_OPEN).map(|i| pos + i);
        let segment = match (fence, marker) {
            (None, None) => break,
            (Some(f), Some(m)) if f < m => fence_at(raw, f),
            (Some(f), None) => fence_at(raw, f),
            (_, Some(m)) => marker_at(raw, m),
        };
        pos = segment.span.end;
        segments.push(segment);
    }
    segments
}

fn fence_at(raw: &str, open: usize) -> Segment {
    let after = open + FENCE.len();
    let line_end = raw[after..]
        .find('\n')
        .map(|i| after + i)
        .unwrap_or(raw.len());
    let info = &raw[after..line_end];
    let tag_len = info
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(info.len());
    let tag = info[..tag_len].to_ascii_lowercase();

    // Payload may start on the fence line itself (```json {"tool": ...}```)
    let body_start = if info[tag_len..].trim().is_empty() {
        (line_end + 1).min(raw.len())
    } else {
        after + tag_len
    };
    let candidate = if tag.is_empty() {
        raw[body_start..].trim_start().starts_with(['{', '['])
    } else {
        DATA_TAGS.contains(&tag.as_str())
    };

    let close = if candidate {
        find_closing(raw, body_start, FENCE)
    } else {
        raw[body_start..].find(FENCE).map(|i| body_start + i)
    };
    let (body_end, end) = match close {
        Some(i) => (i, i + FENCE.len()),
        // Unterminated fence: truncated output runs to the end
        None => (raw.len(), raw.len()),
    };

    Segment {
        span: SourceSpan { start: open, end },
        body: SourceSpan {
            start: body_start,
            end: body_end,
        },
        kind: SegmentKind::Fenced,
        candidate,
    }
}

fn marker_at(raw: &str, open: usize) -> Segment {
    let body_start = open + MARKER_OPEN.len();
    if raw[body_start..].trim_start().starts_with(FENCE) {
        // Wrapper around a fenced block: the fence is scanned next and the
        // stray closing marker is dropped from the prose.
        return Segment {
            span: SourceSpan {
                start: open,
                end: body_start,
            },
            body: SourceSpan {
                start: body_start,
                end: body_start,
            },
            kind: SegmentKind::InlineMarker,
            candidate: true,
        };
    }
    let (body_end, end) = match find_closing(raw, body_start, MARKER_CLOSE) {
        Some(i) => (i, i + MARKER_CLOSE.len()),
        None => (raw.len(), raw.len()),
    };
    Segment {
        span: SourceSpan { start: open, end },
        body: SourceSpan {
            start: body_start,
            end: body_end,
        },
        kind: SegmentKind::InlineMarker,
        candidate: true,
    }
}

/// First `delim` at or after `from` that sits outside a JSON string literal.
/// When the quoting never balances, falls back to the first plain occurrence.
fn find_closing(raw: &str, from: usize, delim: &str) -> Option<usize> {
    let bytes = raw.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    for i in from..bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else if b == b'"' {
            in_string = true;
        } else if bytes[i..].starts_with(delim.as_bytes()) {
            return Some(i);
        }
    }
    if in_string {
        raw[from..].find(delim).map(|i| from + i)
    } else {
        None
    }
}

/// Text outside candidate segments. Code fences stay; they are part of the reply.
fn prose(raw: &str, segments: &[Segment]) -> String {
    let mut out = String::new();
    let mut cursor = 0;
    for segment in segments.iter().filter(|s| s.candidate) {
        out.push_str(&raw[cursor..segment.span.start]);
        cursor = segment.span.end;
    }
    out.push_str(&raw[cursor..]);
    let out = out.replace(MARKER_CLOSE, "");
    out.trim().to_string()
}

type RawCall = Result<(String, Map<String, Value>), String>;

/// Strict parse, then one repair pass and one retry.
fn parse_segment(body: &str) -> Result<(Vec<RawCall>, Vec<Repair>), String> {
    let trimmed = body.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Ok((extract_calls(value)?, Vec::new())),
        Err(strict_err) => {
            let (repaired, applied) = repair::repair(trimmed);
            if applied.is_empty() {
                return Err(format!("invalid JSON: {}", strict_err));
            }
            match serde_json::from_str::<Value>(&repaired) {
                Ok(value) => Ok((extract_calls(value)?, applied)),
                Err(e) => Err(format!(
                    "invalid JSON after repairs {:?}: {} (original error: {})",
                    applied, e, strict_err
                )),
            }
        }
    }
}

fn extract_calls(value: Value) -> Result<Vec<RawCall>, String> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("tool_calls") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err("'tool_calls' must be an array".to_string()),
            None => vec![Value::Object(obj)],
        },
        other => {
            return Err(format!(
                "expected a tool call object, found {}",
                json_type(&other)
            ))
        }
    };
    if items.is_empty() {
        return Err("empty tool call list".to_string());
    }
    Ok(items.into_iter().map(extract_call).collect())
}

fn extract_call(value: Value) -> RawCall {
    let Value::Object(mut obj) = value else {
        return Err(format!(
            "expected a tool call object, found {}",
            json_type(&value)
        ));
    };

    // OpenAI style: {"function": {"name": ..., "arguments": "..."}}
    if let Some(Value::Object(function)) = obj.remove("function") {
        obj = function;
    }

    let name = ["tool", "name", "tool_name"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "not a tool call: missing 'tool' or 'name'".to_string())?
        .to_string();

    let raw_args = ["arguments", "args", "parameters", "input"]
        .iter()
        .find_map(|k| obj.remove(*k));

    let arguments = match raw_args {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(Value::String(s)) if s.trim().is_empty() => Map::new(),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(format!(
                    "arguments for '{}' must be an object, found {}",
                    name,
                    json_type(&other)
                ))
            }
            Err(e) => return Err(format!("arguments for '{}' are not JSON: {}", name, e)),
        },
        Some(other) => {
            return Err(format!(
                "arguments for '{}' must be an object, found {}",
                name,
                json_type(&other)
            ))
        }
    };

    Ok((name, arguments))
}
