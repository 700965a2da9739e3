//! Pipe execution of a sender into a receiver.
//!
//! The sender always runs locally. Its stdout is relayed into the stdin of
//! either a local receiver or a remote-shell client that runs the receiver on
//! the remote host. The engine is the only holder of the two pipe ends in
//! between, and it drops both as soon as either side stops: sender EOF closes
//! the receiver's stdin, and a receiver that exits early breaks the relay,
//! which closes the sender's stdout so the sender gets a broken pipe instead
//! of blocking forever.
//!
//! Both exit codes are checked. The receiver is authoritative and reported
//! first; a non-zero sender with a successful receiver is still a failure,
//! since the receiver may have accepted a truncated stream.

use crate::config::EngineConfig;
use crate::error::{ReplError, Result, TransferStage};
use crate::job::ReplicationType;
use crate::process::command_for;
use crate::remote::{RemoteTarget, SshCommand};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tracing::{debug, info, warn};

const RELAY_BUF_SIZE: usize = 128 * 1024;

/// Result of a completed transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes relayed from the sender to the receiver.
    pub bytes_transferred: u64,
    /// Diagnostic output of both sides.
    pub log_output: String,
}

/// A failed transfer and whatever it produced before failing.
#[derive(Debug)]
pub struct TransferFailure {
    /// The classified failure.
    pub error: ReplError,
    /// Bytes relayed before the failure.
    pub bytes_transferred: u64,
    /// Diagnostic output of the side that did not fail.
    pub log_output: String,
}

impl From<ReplError> for TransferFailure {
    fn from(error: ReplError) -> Self {
        Self {
            error,
            bytes_transferred: 0,
            log_output: String::new(),
        }
    }
}

#[derive(Debug)]
struct RelayOutcome {
    bytes: u64,
    error: Option<io::Error>,
}

async fn relay<R, W>(mut reader: R, mut writer: W) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut bytes = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return RelayOutcome { bytes, error: Some(e) },
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return RelayOutcome { bytes, error: Some(e) };
        }
        bytes += n as u64;
    }
    let error = writer.shutdown().await.err();
    RelayOutcome { bytes, error }
}

async fn drain<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn failure_message(stderr: &str, status: &ExitStatus) -> String {
    if stderr.trim().is_empty() {
        format!("exited with {status}")
    } else {
        stderr.to_string()
    }
}

fn join_logs(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_end())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs sender | receiver pipes, locally or with the receiver behind the remote shell.
#[derive(Debug, Clone)]
pub struct PipeExecutor {
    config: Arc<EngineConfig>,
}

impl PipeExecutor {
    /// New executor using the remote-shell settings and deadline in `config`.
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Receiver-side argv as actually spawned, and the stage its failure maps to.
    pub fn receiver_argv(
        &self,
        receive_argv: &[String],
        direction: ReplicationType,
        remote: Option<&RemoteTarget>,
    ) -> Result<(Vec<String>, TransferStage)> {
        if !direction.is_remote() {
            return Ok((receive_argv.to_vec(), TransferStage::Receive));
        }
        let target = remote.ok_or_else(|| ReplError::MissingRemoteHost {
            direction: direction.to_string(),
        })?;
        let argv = SshCommand::new(&self.config.ssh_binary, target)?
            .connect_timeout(self.config.ssh_connect_timeout_secs)
            .argv(receive_argv);
        Ok((argv, TransferStage::RemoteReceive))
    }

    fn spawn(argv: &[String], stdin: Stdio) -> Result<Child> {
        let mut cmd = command_for(argv)?;
        cmd.stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn().map_err(|source| ReplError::Spawn {
            program: argv[0].clone(),
            source,
        })
    }

    /// Run `send_argv | receive_argv` and classify the outcome.
    ///
    /// No retries are attempted here.
    pub async fn execute(
        &self,
        send_argv: &[String],
        receive_argv: &[String],
        direction: ReplicationType,
        remote: Option<&RemoteTarget>,
    ) -> Result<TransferOutcome> {
        self.transfer(send_argv, receive_argv, direction, remote)
            .await
            .map_err(|failure| failure.error)
    }

    /// Like [`execute`](Self::execute), but a failure keeps the byte count
    /// and the output of the side that did not fail.
    pub async fn transfer(
        &self,
        send_argv: &[String],
        receive_argv: &[String],
        direction: ReplicationType,
        remote: Option<&RemoteTarget>,
    ) -> std::result::Result<TransferOutcome, TransferFailure> {
        let (receiver_argv, receive_stage) = self.receiver_argv(receive_argv, direction, remote)?;
        info!(send = ?send_argv, receive = ?receiver_argv, %direction, "starting transfer pipe");

        let mut sender = Self::spawn(send_argv, Stdio::null())?;
        let mut receiver = Self::spawn(&receiver_argv, Stdio::piped())?;

        let broken = |what: &str| {
            ReplError::Io(io::Error::new(io::ErrorKind::BrokenPipe, what.to_string()))
        };
        let sender_out = sender.stdout.take().ok_or_else(|| broken("sender stdout missing"))?;
        let receiver_in = receiver.stdin.take().ok_or_else(|| broken("receiver stdin missing"))?;

        let sender_err = tokio::spawn(drain(sender.stderr.take()));
        let receiver_err = tokio::spawn(drain(receiver.stderr.take()));
        let receiver_out = tokio::spawn(drain(receiver.stdout.take()));

        let finished = {
            // The relay owns both pipe ends and drops them when it returns.
            let run = async {
                tokio::join!(
                    relay(sender_out, receiver_in),
                    sender.wait(),
                    receiver.wait()
                )
            };
            match self.config.transfer_timeout() {
                Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                None => Some(run.await),
            }
        };

        let Some((relayed, send_status, recv_status)) = finished else {
            warn!(send = ?send_argv, "transfer deadline expired; killing sender and receiver");
            let _ = sender.start_kill();
            let _ = receiver.start_kill();
            let _ = sender.wait().await;
            let _ = receiver.wait().await;
            sender_err.abort();
            receiver_err.abort();
            receiver_out.abort();
            let secs = self.config.transfer_timeout_secs.unwrap_or_default();
            return Err(ReplError::transfer(
                TransferStage::Timeout,
                format!("transfer exceeded {secs}s; sender and receiver were killed"),
            )
            .into());
        };

        let send_status = send_status.map_err(ReplError::from)?;
        let recv_status = recv_status.map_err(ReplError::from)?;
        let sender_stderr = sender_err.await.unwrap_or_default();
        let receiver_stderr = receiver_err.await.unwrap_or_default();
        let receiver_stdout = receiver_out.await.unwrap_or_default();

        debug!(
            bytes = relayed.bytes,
            sender = %send_status,
            receiver = %recv_status,
            "transfer pipe finished"
        );

        let failed = |error: ReplError, others: &[&str]| TransferFailure {
            error,
            bytes_transferred: relayed.bytes,
            log_output: join_logs(others),
        };

        if !recv_status.success() {
            return Err(failed(
                ReplError::transfer(receive_stage, failure_message(&receiver_stderr, &recv_status)),
                &[sender_stderr.as_str(), receiver_stdout.as_str()],
            ));
        }
        if !send_status.success() {
            return Err(failed(
                ReplError::transfer(TransferStage::Send, failure_message(&sender_stderr, &send_status)),
                &[receiver_stdout.as_str(), receiver_stderr.as_str()],
            ));
        }
        if let Some(e) = &relayed.error {
            return Err(failed(
                ReplError::transfer(
                    TransferStage::Pipe,
                    format!("stream relay failed after {} bytes: {e}", relayed.bytes),
                ),
                &[sender_stderr.as_str(), receiver_stdout.as_str(), receiver_stderr.as_str()],
            ));
        }

        Ok(TransferOutcome {
            bytes_transferred: relayed.bytes,
            log_output: join_logs(&[&sender_stderr, &receiver_stdout, &receiver_stderr]),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn executor(timeout: Option<u64>) -> PipeExecutor {
        PipeExecutor::new(Arc::new(EngineConfig {
            transfer_timeout_secs: timeout,
            ..EngineConfig::default()
        }))
    }

    mod local {
        use super::*;

        #[tokio::test]
        async fn test_bytes_are_counted() {
            let out = executor(None)
                .execute(
                    &sh("printf 'hello world'"),
                    &sh("cat >/dev/null; echo received >&2"),
                    ReplicationType::Local,
                    None,
                )
                .await
                .unwrap();
            assert_eq!(out.bytes_transferred, 11);
            assert_eq!(out.log_output, "received");
        }

        #[tokio::test]
        async fn test_receiver_failure_is_receive_stage() {
            let err = executor(None)
                .execute(
                    &sh("printf data"),
                    &sh("cat >/dev/null; echo 'cannot receive: dataset already exists, use -F' >&2; exit 1"),
                    ReplicationType::Local,
                    None,
                )
                .await
                .unwrap_err();
            match err {
                ReplError::Transfer { stage, message } => {
                    assert_eq!(stage, TransferStage::Receive);
                    assert!(message.contains("already exists"));
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_failure_keeps_partial_progress() {
            let failure = executor(None)
                .transfer(
                    &sh("printf 12345; echo 'sender note' >&2"),
                    &sh("cat >/dev/null; echo 'receiver says no' >&2; exit 1"),
                    ReplicationType::Local,
                    None,
                )
                .await
                .unwrap_err();
            assert_eq!(failure.error.transfer_stage(), Some(TransferStage::Receive));
            assert_eq!(failure.bytes_transferred, 5);
            assert_eq!(failure.log_output, "sender note");
            assert!(failure.error.to_string().contains("receiver says no"));
        }

        #[tokio::test]
        async fn test_sender_failure_surfaces_even_if_receiver_ok() {
            let err = executor(None)
                .execute(
                    &sh("printf partial; echo 'send broke' >&2; exit 2"),
                    &sh("cat >/dev/null"),
                    ReplicationType::Local,
                    None,
                )
                .await
                .unwrap_err();
            assert_eq!(err.transfer_stage(), Some(TransferStage::Send));
            assert!(err.to_string().contains("send broke"));
        }

        #[tokio::test]
        async fn test_early_receiver_exit_does_not_hang_sender() {
            // The sender would write forever if its stdout stayed open.
            let err = executor(Some(20))
                .execute(
                    &sh("exec yes"),
                    &sh("head -c 10 >/dev/null; echo 'stream rejected' >&2; exit 1"),
                    ReplicationType::Local,
                    None,
                )
                .await
                .unwrap_err();
            assert_eq!(err.transfer_stage(), Some(TransferStage::Receive));
        }

        #[tokio::test]
        async fn test_empty_stderr_reports_status() {
            let err = executor(None)
                .execute(&sh("true"), &sh("exit 4"), ReplicationType::Local, None)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("exited with"));
        }

        #[tokio::test]
        async fn test_timeout_kills_both() {
            let err = executor(Some(1))
                .execute(&sh("exec sleep 30"), &sh("exec cat"), ReplicationType::Local, None)
                .await
                .unwrap_err();
            assert_eq!(err.transfer_stage(), Some(TransferStage::Timeout));
        }

        #[tokio::test]
        async fn test_missing_sender_program() {
            let err = executor(None)
                .execute(
                    &["/nonexistent/zfs".to_string()],
                    &sh("cat"),
                    ReplicationType::Local,
                    None,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, ReplError::Spawn { .. }));
        }
    }

    mod remote {
        use super::*;

        #[test]
        fn test_receiver_wrapped_in_ssh() {
            let exec = executor(None);
            let target = RemoteTarget::new("backup.example");
            let (argv, stage) = exec
                .receiver_argv(
                    &["zfs".into(), "receive".into(), "p/d".into()],
                    ReplicationType::Push,
                    Some(&target),
                )
                .unwrap();
            assert_eq!(stage, TransferStage::RemoteReceive);
            assert_eq!(argv[0], "ssh");
            assert!(argv.contains(&"BatchMode=yes".to_string()));
            assert!(argv.contains(&"StrictHostKeyChecking=no".to_string()));
            assert!(argv.contains(&"ConnectTimeout=10".to_string()));
            assert_eq!(&argv[argv.len() - 3..], &["zfs", "receive", "p/d"]);
        }

        #[test]
        fn test_remote_without_target_rejected() {
            let exec = executor(None);
            let err = exec
                .receiver_argv(&["zfs".into()], ReplicationType::Pull, None)
                .unwrap_err();
            assert!(matches!(err, ReplError::MissingRemoteHost { .. }));
        }

        #[test]
        fn test_option_like_host_never_reaches_argv() {
            let exec = executor(None);
            let target = RemoteTarget::new("-oProxyCommand=touch /tmp/x");
            let err = exec
                .receiver_argv(&["zfs".into()], ReplicationType::Push, Some(&target))
                .unwrap_err();
            assert!(matches!(err, ReplError::InvalidName { .. }));
        }

        #[tokio::test]
        async fn test_remote_client_failure_is_remote_receive_stage() {
            let exec = PipeExecutor::new(Arc::new(EngineConfig {
                ssh_binary: "/bin/false".into(),
                ..EngineConfig::default()
            }));
            let target = RemoteTarget::new("h");
            let err = exec
                .execute(
                    &sh("printf x"),
                    &["zfs".into(), "receive".into(), "p/d".into()],
                    ReplicationType::Push,
                    Some(&target),
                )
                .await
                .unwrap_err();
            assert_eq!(err.transfer_stage(), Some(TransferStage::RemoteReceive));
        }
    }
}
