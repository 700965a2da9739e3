//! One-shot driver invocations with captured output.

use crate::error::{ReplError, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Output of a finished driver invocation.
#[derive(Debug, Clone)]
pub struct Captured {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl Captured {
    /// Whether the program exited with status zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Non-empty trimmed lines of stdout.
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Outcome of [`run_capture`] when a deadline is involved.
#[derive(Debug)]
pub enum RunOutcome {
    /// The program finished (successfully or not).
    Finished(Captured),
    /// The deadline expired and the program was killed.
    TimedOut,
}

/// Build a command from a non-empty argv.
pub(crate) fn command_for(argv: &[String]) -> Result<Command> {
    let (program, args) = argv.split_first().ok_or_else(|| ReplError::Spawn {
        program: String::new(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
    })?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Run `argv` to completion with stdin closed, capturing both output streams.
pub async fn run_capture(argv: &[String], timeout: Option<Duration>) -> Result<RunOutcome> {
    debug!(argv = ?argv, "running driver");
    let mut cmd = command_for(argv)?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn().map_err(|source| ReplError::Spawn {
        program: argv[0].clone(),
        source,
    })?;

    let output = child.wait_with_output();
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, output).await {
            Ok(res) => res?,
            Err(_) => return Ok(RunOutcome::TimedOut),
        },
        None => output.await?,
    };

    Ok(RunOutcome::Finished(Captured {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }))
}
