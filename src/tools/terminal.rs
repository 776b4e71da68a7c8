//! Shell command execution in the workspace root.
//!
//! Lets an agent run the project's tests or linters against the file it just
//! wrote. Gated by `ENABLE_RUN_COMMAND` (off by default). Commands may only
//! write to the agent's managed file: redirections, `tee` and file-mutating
//! commands aimed at any other path are refused before the shell starts.

use std::borrow::Cow;
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tokio::process::Command;

use super::{ParamKind, ParamSpec, Tool, ToolArgs, ToolContext, ToolOutput, ToolSchema};
use crate::util::truncate_with_marker;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_OUTPUT_BYTES: usize = 10_000;

/// Drop terminal color and cursor escape sequences.
fn strip_ansi(text: &str) -> Cow<'_, str> {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    match ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").ok()) {
        Some(re) => re.replace_all(text, ""),
        None => Cow::Borrowed(text),
    }
}

/// Sanitize command output before it goes back into a prompt.
/// Removes binary garbage while preserving valid text.
fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    // If more than 10% is non-printable (excluding newlines/tabs), it's likely binary
    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    let text = String::from_utf8_lossy(bytes);
    strip_ansi(&text)
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

/// Command patterns that are refused outright.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("rm -rf /", "This would destroy the entire system"),
    ("rm -rf /*", "This would destroy the entire system"),
    ("rm -rf ~", "This would delete the home directory"),
    ("find /", "Search inside the workspace instead of the filesystem root"),
    ("grep -r /", "Search inside the workspace instead of the filesystem root"),
    ("grep -R /", "Search inside the workspace instead of the filesystem root"),
    ("> /dev/", "Writing to device files is blocked"),
    ("dd if=/dev/", "Direct disk operations are blocked"),
    ("mkfs", "Formatting filesystems is blocked"),
    ("shutdown", "Power management is blocked"),
    ("reboot", "Power management is blocked"),
    (":(){", "Fork bombs are blocked"),
];

/// Validate a command against dangerous patterns.
fn validate_command(cmd: &str) -> Result<(), String> {
    let cmd_trimmed = cmd.trim();
    let prefixes = ["", "sudo ", "time ", "nice ", "nohup "];

    for (pattern, suggestion) in DANGEROUS_PATTERNS {
        for prefix in prefixes {
            if let Some(rest) = cmd_trimmed.strip_prefix(prefix) {
                if rest.starts_with(pattern) {
                    return Err(format!(
                        "Blocked dangerous command pattern '{}'. {}",
                        pattern, suggestion
                    ));
                }
            }
        }
        // Also after a command separator
        for sep in ["&&", ";", "||", "|"] {
            if cmd_trimmed
                .split(sep)
                .skip(1)
                .any(|part| part.trim_start().starts_with(pattern))
            {
                return Err(format!(
                    "Blocked dangerous command pattern '{}'. {}",
                    pattern, suggestion
                ));
            }
        }
    }

    Ok(())
}

/// Commands that create, move, delete or re-permission files.
const MUTATING_COMMANDS: &[&str] = &[
    "rm", "mv", "cp", "touch", "truncate", "ln", "chmod", "chown", "mkdir", "rmdir", "install",
    "rsync", "dd", "tee",
];

/// Words that run the next word as the actual command.
const COMMAND_PREFIXES: &[&str] = &["sudo", "time", "nice", "nohup", "env", "xargs", "exec", "command"];

fn redirect_pattern() -> Option<&'static Regex> {
    static REDIRECT: OnceLock<Option<Regex>> = OnceLock::new();
    REDIRECT
        .get_or_init(|| Regex::new(r#">>?\|?\s*(&?[^\s;&|<>()]+)"#).ok())
        .as_ref()
}

/// Refuse commands that would write anywhere but the managed file.
fn confine_writes(cmd: &str, ctx: &ToolContext) -> Result<(), String> {
    let managed_abs = ctx.managed_path();
    let allowed = |target: &str| {
        let target = target.trim_matches(|c: char| c == '"' || c == '\'');
        target == "/dev/null"
            || target.strip_prefix("./").unwrap_or(target) == ctx.managed_file
            || managed_abs.as_path() == std::path::Path::new(target)
    };
    let refuse = |target: &str| {
        Err(format!(
            "run_command may only write to {}; '{}' is outside it",
            ctx.managed_file, target
        ))
    };

    let redirect = redirect_pattern().ok_or("Command confinement is unavailable")?;
    for caps in redirect.captures_iter(cmd) {
        let target = &caps[1];
        // 2>&1 and friends duplicate a descriptor
        if !target.starts_with('&') && !allowed(target) {
            return refuse(target);
        }
    }

    for part in cmd.split(['\n', ';', '|', '&', '(', ')']) {
        let mut words = part
            .split_whitespace()
            .skip_while(|w| COMMAND_PREFIXES.contains(w) || (w.contains('=') && !w.starts_with('-')));
        let Some(program) = words.next() else {
            continue;
        };
        let program = program.rsplit('/').next().unwrap_or(program);
        let operands: Vec<&str> = words.collect();

        if matches!(program, "sed" | "perl") && operands.iter().any(|w| w.starts_with("-i")) {
            return Err(format!(
                "In-place editing through {} is refused; use replace_in_file on {}",
                program, ctx.managed_file
            ));
        }
        if MUTATING_COMMANDS.contains(&program) {
            let targets = operands.iter().filter(|w| !w.starts_with('-') && !w.starts_with('>'));
            for &target in targets {
                let target = target.strip_prefix("of=").unwrap_or(target);
                if !allowed(target) {
                    return refuse(target);
                }
            }
        }
    }
    Ok(())
}

/// Run a shell command in the workspace root.
pub struct RunCommand;

#[async_trait]
impl Tool for RunCommand {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace root, e.g. to run tests after changing your file."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(vec![
            ParamSpec::required("command", ParamKind::String, "The shell command to execute"),
            ParamSpec::optional(
                "timeout_secs",
                ParamKind::Integer,
                "Timeout in seconds (default: 60)",
            ),
        ])
    }

    async fn execute(&self, args: ToolArgs, ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let command = args.str("command")?;

        if let Err(msg) = validate_command(command) {
            tracing::warn!("Blocked dangerous command: {}", command);
            anyhow::bail!("{}", msg);
        }
        if let Err(msg) = confine_writes(command, ctx) {
            tracing::warn!("Refused command writing outside {}: {}", ctx.managed_file, command);
            anyhow::bail!("{}", msg);
        }

        let timeout_secs = args
            .opt_u64("timeout_secs")
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .max(1);

        tracing::info!("Executing command in {:?}: {}", ctx.workspace, command);

        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            Command::new("/bin/sh")
                .arg("-c")
                .arg(command)
                .current_dir(&ctx.workspace)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::error!("Command execution failed: {}", e);
                anyhow::bail!("Failed to execute command: {}", e);
            }
            Err(_) => {
                tracing::warn!("Command timed out after {} seconds", timeout_secs);
                anyhow::bail!("Command timed out after {} seconds", timeout_secs);
            }
        };

        let stdout = sanitize_output(&output.stdout);
        let stderr = sanitize_output(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::debug!(
            "Command completed: exit={}, stdout_len={}, stderr_len={}",
            exit_code,
            stdout.len(),
            stderr.len()
        );

        let mut result = format!("Exit code: {}\n", exit_code);
        if !stdout.is_empty() {
            result.push_str("\n--- stdout ---\n");
            result.push_str(&stdout);
        }
        if !stderr.is_empty() {
            result.push_str("\n--- stderr ---\n");
            result.push_str(&stderr);
        }

        Ok(ToolOutput::message(truncate_with_marker(&result, MAX_OUTPUT_BYTES))
            .with_payload(json!({ "exit_code": exit_code })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn args(value: Value) -> ToolArgs {
        ToolArgs::new(value.as_object().cloned().unwrap_or_else(Map::new))
    }

    #[test]
    fn test_validate_command_blocks_patterns() {
        assert!(validate_command("rm -rf /").is_err());
        assert!(validate_command("sudo rm -rf /").is_err());
        assert!(validate_command("pytest && rm -rf /").is_err());
        assert!(validate_command("pytest -q tests/").is_ok());
    }

    #[test]
    fn test_confine_writes() {
        let ctx = ToolContext::new("/ws", "src/a.py");
        assert!(confine_writes("pytest -q > /dev/null 2>&1", &ctx).is_ok());
        assert!(confine_writes("black src/a.py && ruff check src/a.py", &ctx).is_ok());
        assert!(confine_writes("python gen.py > ./src/a.py", &ctx).is_ok());
        assert!(confine_writes("echo x > b.py", &ctx).is_err());
        assert!(confine_writes("echo x >>src/b.py", &ctx).is_err());
        assert!(confine_writes("cat src/a.py | tee notes.md", &ctx).is_err());
        assert!(confine_writes("cp src/a.py /ws/src/b.py", &ctx).is_err());
        assert!(confine_writes("sudo rm -f b.py", &ctx).is_err());
        assert!(confine_writes("sed -i s/a/b/ b.py", &ctx).is_err());
        assert!(confine_writes("FOO=1 /bin/mv src/a.py b.py", &ctx).is_err());
    }

    #[tokio::test]
    async fn test_write_to_other_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.py"), "owned by another agent").unwrap();
        let ctx = ToolContext::new(dir.path(), "a.py");
        let err = RunCommand
            .execute(args(serde_json::json!({"command": "echo x > b.py"})), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("b.py")).unwrap(),
            "owned by another agent"
        );
    }

    #[tokio::test]
    async fn test_write_to_managed_file_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path(), "a.py");
        RunCommand
            .execute(args(serde_json::json!({"command": "echo 'x = 1' > a.py"})), &ctx)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.py")).unwrap(),
            "x = 1\n"
        );
    }

    #[test]
    fn test_sanitize_output_strips_control_chars() {
        assert_eq!(sanitize_output(b"ok\x00\x07\n"), "ok\n");
        assert_eq!(
            sanitize_output(b"\x1b[32mPASSED\x1b[0m 3 tests\n"),
            "PASSED 3 tests\n"
        );
    }

    #[tokio::test]
    async fn test_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "hi").unwrap();
        let ctx = ToolContext::new(dir.path(), "a.py");
        let out = RunCommand
            .execute(args(serde_json::json!({"command": "cat marker.txt"})), &ctx)
            .await
            .unwrap();
        assert!(out.message.contains("hi"));
        assert_eq!(out.payload.unwrap()["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path(), "a.py");
        let err = RunCommand
            .execute(
                args(serde_json::json!({"command": "sleep 5", "timeout_secs": 1})),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
