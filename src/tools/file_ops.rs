//! File operation tools: read, write, and edit the agent's managed file.
//!
//! None of these take a path. The only file an agent can touch is the one it
//! owns, resolved from the [`ToolContext`].

use std::path::Path;

use async_trait::async_trait;
use serde_json::json;

use super::{ParamKind, ParamSpec, Tool, ToolArgs, ToolContext, ToolOutput, ToolSchema};

/// Write `content` to `path` via a sibling temp file and a rename, so readers
/// never observe a half-written file.
pub(crate) async fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Managed file has no parent directory"))?;
    tokio::fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(
        ".{}.{}.tmp",
        file_name,
        &uuid::Uuid::new_v4().to_string()[..8]
    ));

    if let Err(e) = tokio::fs::write(&tmp, content).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Read the managed file, `None` if it does not exist yet.
async fn read_text(path: &Path) -> anyhow::Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Managed file is not UTF-8 text ({} bytes)", e.as_bytes().len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn count_lines(content: &str) -> usize {
    content.lines().count()
}

/// Read the managed file with line numbers.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read your managed file with line numbers. Optionally restrict to a line range."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(vec![
            ParamSpec::optional(
                "start_line",
                ParamKind::Integer,
                "Start reading from this line number (1-indexed)",
            ),
            ParamSpec::optional(
                "end_line",
                ParamKind::Integer,
                "Stop reading at this line number (inclusive)",
            ),
        ])
    }

    async fn execute(&self, args: ToolArgs, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let Some(content) = read_text(&ctx.managed_path()).await? else {
            return Ok(ToolOutput::message(format!(
                "{} does not exist yet. Use write_file to create it.",
                ctx.managed_file
            ))
            .with_payload(json!({ "exists": false, "total_lines": 0 })));
        };

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start = args
            .opt_u64("start_line")
            .map(|n| n as usize)
            .unwrap_or(1)
            .saturating_sub(1)
            .min(total_lines);
        let end = args
            .opt_u64("end_line")
            .map(|n| n as usize)
            .unwrap_or(total_lines)
            .min(total_lines);

        // Ensure start <= end
        let (start, end) = if start > end { (end, start) } else { (start, end) };

        if total_lines > 0 && start >= total_lines {
            return Ok(ToolOutput::message(format!(
                "File has {} lines, requested start line {} is beyond end of file",
                total_lines,
                start + 1
            )));
        }

        let numbered: Vec<String> = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:4}| {}", start + i + 1, line))
            .collect();

        Ok(ToolOutput::message(numbered.join("\n")).with_payload(json!({
            "exists": true,
            "total_lines": total_lines,
            "start_line": start + 1,
            "end_line": end,
        })))
    }
}

/// Replace the whole managed file.
pub struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Replace the entire contents of your managed file. Creates it (and parent directories) if needed."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(vec![ParamSpec::required(
            "content",
            ParamKind::String,
            "The complete new file contents",
        )])
    }

    async fn execute(&self, args: ToolArgs, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let content = args.str("content")?;
        write_atomic(&ctx.managed_path(), content).await?;

        let mut message = format!(
            "Wrote {} bytes ({} lines) to {}",
            content.len(),
            count_lines(content),
            ctx.managed_file
        );

        // Models sometimes wrap the file body in a markdown fence
        if content.trim_start().starts_with("```") {
            message.push_str(
                "\nWarning: content starts with a markdown fence (```). If that is not part of the file, rewrite it without the fence.",
            );
        }

        tracing::debug!("write_file: {} bytes to {}", content.len(), ctx.managed_file);
        Ok(ToolOutput::message(message)
            .with_payload(json!({
                "bytes": content.len(),
                "lines": count_lines(content),
            }))
            .with_side_effects(format!("wrote {}", ctx.managed_file)))
    }
}

/// Exact-text edit of the managed file.
pub struct ReplaceInFile;

#[async_trait]
impl Tool for ReplaceInFile {
    fn name(&self) -> &str {
        "replace_in_file"
    }

    fn description(&self) -> &str {
        "Replace an exact piece of text in your managed file. Fails if the text is missing, or appears more than once unless replace_all is true."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(vec![
            ParamSpec::required("search", ParamKind::String, "Exact text to find"),
            ParamSpec::required("replace", ParamKind::String, "Replacement text"),
            ParamSpec::optional(
                "replace_all",
                ParamKind::Boolean,
                "Replace every occurrence (default: false)",
            ),
        ])
    }

    async fn execute(&self, args: ToolArgs, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let search = args.str("search")?;
        let replace = args.str("replace")?;
        let replace_all = args.opt_bool("replace_all").unwrap_or(false);

        if search.is_empty() {
            anyhow::bail!("'search' must not be empty");
        }

        let path = ctx.managed_path();
        let content = read_text(&path)
            .await?
            .ok_or_else(|| anyhow::anyhow!("{} does not exist yet", ctx.managed_file))?;

        let occurrences = content.matches(search).count();
        if occurrences == 0 {
            anyhow::bail!("Search text not found in {}", ctx.managed_file);
        }
        if occurrences > 1 && !replace_all {
            anyhow::bail!(
                "Search text appears {} times in {}; make it unique or set replace_all",
                occurrences,
                ctx.managed_file
            );
        }

        let updated = if replace_all {
            content.replace(search, replace)
        } else {
            content.replacen(search, replace, 1)
        };
        write_atomic(&path, &updated).await?;

        Ok(ToolOutput::message(format!(
            "Replaced {} occurrence(s) in {}",
            occurrences, ctx.managed_file
        ))
        .with_payload(json!({ "replacements": occurrences }))
        .with_side_effects(format!("edited {}", ctx.managed_file)))
    }
}
