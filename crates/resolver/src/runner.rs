//! Running the external toolchain.

use crate::environ::Environ;
use crate::error::{ResolveError, ResolveResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::trace;

/// A fully specified child process.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory.
    pub dir: PathBuf,
    /// Complete environment; nothing is inherited.
    pub env: Environ,
}

impl Invocation {
    /// Shell-quoted command line, for diagnostics.
    pub fn command_line(&self) -> String {
        let program = self.program.to_string_lossy();
        std::iter::once(program.as_ref())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a successful invocation.
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    /// Interleaved `stdout: ...` / `stderr: ...` lines.
    pub log: String,
}

/// Runs toolchain invocations. The engine only talks to the toolchain
/// through this trait.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Run to completion. A non-zero exit status is a
    /// [`ResolveError::Command`] carrying the captured log.
    ///
    /// Dropping the returned future must stop the child process.
    async fn run(&self, invocation: &Invocation) -> ResolveResult<CommandOutput>;
}

/// Runs invocations as real child processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> ResolveResult<CommandOutput> {
        let command_line = invocation.command_line();
        trace!(command = %command_line, dir = %invocation.dir.display(), "running command");

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.dir)
            .env_clear()
            .envs(invocation.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ResolveError::Command {
                command: command_line.clone(),
                reason: format!("failed to start: {e}"),
                log: String::new(),
            })?;

        let log = Mutex::new(String::new());
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout, stderr, status) = tokio::join!(
            capture(stdout, "stdout", &log, true),
            capture(stderr, "stderr", &log, false),
            child.wait(),
        );
        let log = log.into_inner().unwrap_or_else(|p| p.into_inner());
        let io_failure = |e: std::io::Error| ResolveError::Command {
            command: command_line.clone(),
            reason: e.to_string(),
            log: log.clone(),
        };
        let stdout = stdout.map_err(io_failure)?;
        stderr.map_err(io_failure)?;
        let status = status.map_err(io_failure)?;

        if !status.success() {
            let reason = match status.code() {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            };
            return Err(ResolveError::Command {
                command: command_line,
                reason,
                log,
            });
        }
        trace!(command = %command_line, %log, "command succeeded");
        Ok(CommandOutput { stdout, log })
    }
}

/// Read a pipe line by line into the shared log, optionally keeping the raw bytes.
async fn capture<R: AsyncRead + Unpin>(
    pipe: Option<R>,
    label: &str,
    log: &Mutex<String>,
    keep: bool,
) -> std::io::Result<Vec<u8>> {
    let mut kept = Vec::new();
    let Some(pipe) = pipe else {
        return Ok(kept);
    };
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if keep {
            kept.extend_from_slice(&line);
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches('\n').trim_end_matches('\r');
        let mut log = log.lock().unwrap_or_else(|p| p.into_inner());
        log.push_str(label);
        log.push_str(": ");
        log.push_str(text);
        log.push('\n');
    }
    Ok(kept)
}

/// Quote `arg` for a POSIX shell if it contains anything beyond a safe set.
pub fn shell_quote(arg: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "@%_+=:,./-".contains(c);
    if !arg.is_empty() && arg.chars().all(safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r#"'"'"'"#))
}
