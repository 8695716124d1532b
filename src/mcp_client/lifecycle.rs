//! Pipe server process lifecycle.
//!
//! Spawns pipe-type MCP servers as child processes wired for JSON-RPC over
//! stdio, and keeps a short tail of their stderr for diagnostics. Processes
//! are killed if their transport is dropped without a graceful close, so a
//! cancelled connect never leaks a child.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::StdioTransport;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Number of stderr lines retained per server for error context.
const STDERR_TAIL_LINES: usize = 20;

/// Per-line cap so one runaway line cannot bloat error messages.
const STDERR_LINE_MAX_CHARS: usize = 500;

// ─── Stderr Tail ─────────────────────────────────────────────────────────────

/// Rolling buffer of a child's most recent stderr lines.
///
/// A background task drains stderr (so the child never blocks on a full
/// pipe), forwards each line to `debug` logs, and keeps the last few lines.
#[derive(Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    /// Start draining `stderr` in the background.
    pub fn capture(server: &str, stderr: Option<ChildStderr>) -> Self {
        let tail = Self::default();
        let Some(stderr) = stderr else {
            return tail;
        };

        let lines = Arc::clone(&tail.lines);
        let server = server.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!(server = %server, stderr = %line, "server stderr");
                let mut buf = lines.lock().await;
                if buf.len() == STDERR_TAIL_LINES {
                    buf.pop_front();
                }
                buf.push_back(line.chars().take(STDERR_LINE_MAX_CHARS).collect());
            }
        });
        tail
    }

    /// Joined copy of the retained lines (empty if nothing was written).
    pub async fn snapshot(&self) -> String {
        let buf = self.lines.lock().await;
        buf.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a pipe server process and wrap its stdio in a transport.
///
/// `env` is layered over the inherited environment.
pub fn spawn_pipe(
    name: &str,
    command: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> Result<StdioTransport, McpError> {
    let mut cmd = Command::new(command);
    cmd.args(args);

    for (key, value) in env {
        cmd.env(key, value);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    // Wire stdio for JSON-RPC
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{command}: {e}"),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;

    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr = StderrTail::capture(name, child.stderr.take());

    tracing::debug!(
        server = name,
        command,
        pid = child.id(),
        "spawned pipe server"
    );

    Ok(StdioTransport::new(name, child, stdin, stdout, stderr))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix("  \n"), "");
        assert_eq!(
            format_stderr_suffix("Traceback\n  boom\n"),
            " | stderr: Traceback\n  boom"
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_command_fails() {
        let err = spawn_pipe(
            "ghost",
            "/definitely/not/a/real/binary",
            &[],
            &BTreeMap::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, McpError::SpawnFailed { ref name, .. } if name == "ghost"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_tail_keeps_last_lines() {
        let script = "i=0; while [ $i -lt 30 ]; do echo line$i >&2; i=$((i+1)); done";
        let transport = spawn_pipe(
            "noisy",
            "sh",
            &["-c".to_string(), script.to_string()],
            &BTreeMap::new(),
        )
        .unwrap();

        transport
            .close(std::time::Duration::from_secs(2))
            .await
            .unwrap();

        // Give the drain task a moment to observe EOF.
        let mut tail = String::new();
        for _ in 0..50 {
            tail = transport.stderr_tail().await;
            if tail.contains("line29") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(tail.contains("line29"));
        assert!(!tail.contains("line9\n"));
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
    }
}
