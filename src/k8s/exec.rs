//! Remote command execution over the cluster exec protocol.
//!
//! [`exec_stream`] drives an interactive session: it puts the local
//! terminal in raw mode, multiplexes stdin/stdout over the exec
//! websocket, propagates terminal resizes and returns the remote exit
//! code. [`exec_once`] runs a one-shot command with a fixed stdin.

use std::io::IsTerminal;

use futures::SinkExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::AttachParams;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::client::{classify, ClusterClient};

/// Restores the terminal mode when an interactive session ends, on any
/// exit path.
struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    fn enable() -> Self {
        if std::io::stdin().is_terminal() {
            match crossterm::terminal::enable_raw_mode() {
                Ok(()) => return Self { enabled: true },
                Err(e) => info!("failed to enable raw mode: {e}"),
            }
        }
        Self { enabled: false }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            debug!("restoring terminal");
            if let Err(e) = crossterm::terminal::disable_raw_mode() {
                info!("failed to restore terminal: {e}");
            }
        }
    }
}

/// Runs an interactive command in the dev container, wiring the local
/// stdin/stdout to the remote process.
///
/// # Errors
///
/// Returns an error if the exec stream cannot be established or is
/// cancelled; a non-zero remote exit is returned as
/// [`Error::CommandFailed`].
pub async fn exec_stream(
    client: &ClusterClient,
    namespace: &str,
    pod: &str,
    container: &str,
    command: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    info!("executing {command:?} in {namespace}/{pod}/{container}");

    let tty = std::io::stdin().is_terminal();
    let params = AttachParams::default()
        .container(container)
        .stdin(true)
        .stdout(true)
        .stderr(!tty)
        .tty(tty);

    let mut attached = client
        .pods(namespace)
        .exec(pod, command.to_vec(), &params)
        .await
        .map_err(|e| Error::Cluster(classify(&e, "pod", pod)))?;

    let _raw = if tty { Some(RawModeGuard::enable()) } else { None };

    let mut remote_stdin = attached
        .stdin()
        .ok_or_else(|| Error::internal("exec stream has no stdin"))?;
    let mut remote_stdout = attached
        .stdout()
        .ok_or_else(|| Error::internal("exec stream has no stdout"))?;
    let status = attached
        .take_status()
        .ok_or_else(|| Error::internal("exec stream has no status channel"))?;

    #[cfg(unix)]
    let resize_task = attached.terminal_size().map(|resizes| {
        tokio::spawn(async move {
            forward_terminal_size(resizes).await;
        })
    });

    let stdin_task = tokio::spawn(async move {
        let mut local_stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match local_stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if remote_stdin.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    let _ = remote_stdin.flush().await;
                }
            }
        }
    });

    let stdout_task = tokio::spawn(async move {
        let mut local_stdout = tokio::io::stdout();
        let _ = tokio::io::copy(&mut remote_stdout, &mut local_stdout).await;
        let _ = local_stdout.flush().await;
    });

    let status = tokio::select! {
        status = status => status,
        () = cancel.cancelled() => {
            stdin_task.abort();
            stdout_task.abort();
            return Err(Error::internal("command cancelled"));
        }
    };

    let _ = stdout_task.await;
    stdin_task.abort();
    #[cfg(unix)]
    if let Some(task) = resize_task {
        task.abort();
    }

    match exit_code(status.as_ref()) {
        0 => Ok(()),
        exit_code => Err(Error::CommandFailed { exit_code }),
    }
}

/// Runs a one-shot, non-interactive command with a fixed stdin,
/// discarding its output.
///
/// # Errors
///
/// Returns an error if the exec stream cannot be established.
pub async fn exec_once(
    client: &ClusterClient,
    namespace: &str,
    pod: &str,
    container: &str,
    command: &[String],
    input: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    debug!("executing one-shot command in {namespace}/{pod}/{container}");

    let params = AttachParams::default()
        .container(container)
        .stdin(true)
        .stdout(true)
        .stderr(true)
        .tty(false);

    let mut attached = client
        .pods(namespace)
        .exec(pod, command.to_vec(), &params)
        .await
        .map_err(|e| Error::Cluster(classify(&e, "pod", pod)))?;

    if let Some(mut stdin) = attached.stdin() {
        let _ = stdin.write_all(input.as_bytes()).await;
        let _ = stdin.shutdown().await;
    }

    let drain = async {
        if let Some(mut stdout) = attached.stdout() {
            let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
        }
        if let Some(mut stderr) = attached.stderr() {
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
        }
    };

    tokio::select! {
        () = drain => Ok(()),
        () = cancel.cancelled() => Err(Error::internal("command cancelled")),
    }
}

/// Sends the current terminal size on SIGWINCH, plus once at startup.
#[cfg(unix)]
async fn forward_terminal_size(mut resizes: futures::channel::mpsc::Sender<kube::api::TerminalSize>) {
    let Ok(mut signals) =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
    else {
        return;
    };

    if let Some(size) = current_size() {
        let _ = resizes.send(size).await;
    }

    while signals.recv().await.is_some() {
        if let Some(size) = current_size() {
            if resizes.send(size).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(unix)]
fn current_size() -> Option<kube::api::TerminalSize> {
    crossterm::terminal::size()
        .ok()
        .map(|(width, height)| kube::api::TerminalSize { width, height })
}

/// Extracts the remote exit code from the exec status.
fn exit_code(status: Option<&Status>) -> i32 {
    let Some(status) = status else {
        return 0;
    };

    if status.status.as_deref() == Some("Success") {
        return 0;
    }

    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_ref())
        .and_then(|message| message.parse().ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    #[test]
    fn test_exit_code_success() {
        let status = Status {
            status: Some(String::from("Success")),
            ..Status::default()
        };
        assert_eq!(exit_code(Some(&status)), 0);
        assert_eq!(exit_code(None), 0);
    }

    #[test]
    fn test_exit_code_non_zero() {
        let status = Status {
            status: Some(String::from("Failure")),
            reason: Some(String::from("NonZeroExitCode")),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some(String::from("ExitCode")),
                    message: Some(String::from("127")),
                    ..StatusCause::default()
                }]),
                ..StatusDetails::default()
            }),
            ..Status::default()
        };
        assert_eq!(exit_code(Some(&status)), 127);
    }

    #[test]
    fn test_exit_code_failure_without_details() {
        let status = Status {
            status: Some(String::from("Failure")),
            ..Status::default()
        };
        assert_eq!(exit_code(Some(&status)), 1);
    }
}
