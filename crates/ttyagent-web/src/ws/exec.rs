//! Upstream `pods/exec` bridge.
//!
//! The bridge owns the Kubernetes side of a session: it builds a client
//! from the ticket's kubeconfig, attaches to the target container with a
//! TTY, walks the shell-candidate list when no explicit command was
//! given, and pumps bytes between the exec streams and the session task.
//!
//! Kubernetes upgrades the exec connection before the process is
//! spawned, so a successful attach does not yet prove the candidate
//! executable exists. Each candidate therefore goes through a startup
//! probe: the first stdout bytes establish the attempt (the session gets
//! `started`), while an exec status resolving first is classified. A
//! "command not found" failure falls through to the next candidate; any
//! other outcome ends the session.

use axum::extract::ws::close_code;
use bytes::Bytes;
use futures::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, AttachedProcess, TerminalSize};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use ttyagent_core::kubeconfig;
use ttyagent_core::protocol::TermSize;
use ttyagent_core::target::ExecTarget;

const OUTPUT_BUF_SIZE: usize = 4096;

/// Shell argv vectors attempted in order when the target carries no
/// explicit command.
const SHELL_CANDIDATES: &[&[&str]] = &[
    &["/bin/bash", "-il"],
    &["/usr/bin/bash", "-il"],
    &["bash", "-il"],
    &["/bin/sh", "-i"],
    &["/usr/bin/sh", "-i"],
    &["sh", "-i"],
    &["/bin/ash", "-i"],
    &["/usr/bin/ash", "-i"],
    &["ash", "-i"],
];

/// Error substrings meaning "the executable does not exist", the only
/// failure class that falls through to the next shell candidate.
const SHELL_MISSING_MARKERS: &[&str] = &[
    "executable file not found",
    "no such file or directory",
    "not found",
    "stat /",
];

#[derive(Debug)]
pub enum BridgeEvent {
    /// The upstream exec is established; the session emits `started`.
    Started,
    /// Merged stdout/stderr bytes for the client.
    Output(Bytes),
    /// An upstream status object, forwarded verbatim.
    Status(serde_json::Value),
    /// Session-fatal failure: `error` frame, then close.
    Fatal {
        message: String,
        close_code: u16,
        reason: &'static str,
    },
    /// Orderly end of the exec: close without an `error` frame.
    Finished {
        close_code: u16,
        reason: &'static str,
    },
}

enum Attempt {
    /// The attempt ran to an end state; events were delivered.
    Done,
    /// The candidate executable is absent; try the next one.
    ShellMissing,
    /// The session side dropped its channels; stop silently.
    SessionGone,
}

pub fn spawn(
    session: Uuid,
    kubeconfig: String,
    target: ExecTarget,
    size_rx: watch::Receiver<TermSize>,
    stdin_rx: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<BridgeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(session, kubeconfig, target, size_rx, stdin_rx, events).await;
    })
}

async fn run(
    session: Uuid,
    kubeconfig: String,
    target: ExecTarget,
    mut size_rx: watch::Receiver<TermSize>,
    stdin_rx: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<BridgeEvent>,
) {
    // Candidate attempts that fail before establishment never touch
    // stdin, so the receiver survives until one of them succeeds.
    let mut stdin_slot = Some(stdin_rx);
    let client = match build_client(&kubeconfig).await {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(session = %session, "kubernetes client setup failed: {e:#}");
            let _ = events
                .send(BridgeEvent::Fatal {
                    message: format!("Failed to connect to cluster: {e}"),
                    close_code: close_code::ERROR,
                    reason: "exec failed",
                })
                .await;
            return;
        }
    };
    let pods: Api<Pod> = Api::namespaced(client, &target.namespace);

    let (candidates, fallback): (Vec<Vec<String>>, bool) = match &target.command {
        Some(command) => (vec![command.clone()], false),
        None => (
            SHELL_CANDIDATES
                .iter()
                .map(|argv| argv.iter().map(|s| s.to_string()).collect())
                .collect(),
            true,
        ),
    };

    let mut tried: Vec<String> = Vec::new();
    for argv in &candidates {
        tried.push(argv[0].clone());
        tracing::debug!(session = %session, argv = ?argv, "attempting exec");

        let mut params = AttachParams::default()
            .stdin(true)
            .stdout(true)
            .stderr(false)
            .tty(true);
        if let Some(container) = &target.container {
            params = params.container(container);
        }

        let proc = match pods.exec(&target.pod, argv.clone(), &params).await {
            Ok(proc) => proc,
            Err(e) => {
                let text = e.to_string();
                // Some runtimes reject the upgrade itself for a missing
                // executable.
                if fallback && is_shell_missing(&text) {
                    tracing::debug!(session = %session, argv = ?argv, "candidate missing at attach");
                    continue;
                }
                tracing::warn!(session = %session, "exec attach failed: {text}");
                let _ = events
                    .send(BridgeEvent::Fatal {
                        message: format!("Failed to start exec: {text}"),
                        close_code: close_code::ERROR,
                        reason: "exec failed",
                    })
                    .await;
                return;
            }
        };

        match run_attached(session, proc, fallback, &mut size_rx, &mut stdin_slot, &events).await {
            Attempt::Done | Attempt::SessionGone => return,
            Attempt::ShellMissing => {
                tracing::debug!(session = %session, argv = ?argv, "candidate missing; falling through");
            }
        }
    }

    let list = tried.join(", ");
    tracing::warn!(session = %session, "no shell found in container; tried: {list}");
    let _ = events
        .send(BridgeEvent::Fatal {
            message: format!("No shell found in container. Tried: {list}"),
            close_code: close_code::POLICY,
            reason: "no shell",
        })
        .await;
}

async fn build_client(kubeconfig: &str) -> anyhow::Result<Client> {
    let parsed = kubeconfig::parse_and_inline(kubeconfig)?;
    let config = Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

/// Runs one attached exec attempt to completion.
async fn run_attached(
    session: Uuid,
    mut proc: AttachedProcess,
    fallback: bool,
    size_rx: &mut watch::Receiver<TermSize>,
    stdin_slot: &mut Option<mpsc::Receiver<Bytes>>,
    events: &mpsc::Sender<BridgeEvent>,
) -> Attempt {
    let (Some(stdin), Some(mut stdout), Some(mut size_tx), Some(status_fut)) = (
        proc.stdin(),
        proc.stdout(),
        proc.terminal_size(),
        proc.take_status(),
    ) else {
        let _ = events
            .send(BridgeEvent::Fatal {
                message: "Exec channel is missing streams.".to_string(),
                close_code: close_code::ERROR,
                reason: "exec failed",
            })
            .await;
        return Attempt::Done;
    };
    tokio::pin!(status_fut);

    // The first resize fixed the initial window before the attach.
    let initial = *size_rx.borrow_and_update();
    let _ = size_tx
        .send(TerminalSize {
            height: initial.rows,
            width: initial.cols,
        })
        .await;

    let mut buf = vec![0u8; OUTPUT_BUF_SIZE];

    if fallback {
        // Startup probe: first output establishes the candidate; a status
        // resolving first is classified instead.
        tokio::select! {
            status = &mut status_fut => {
                if shell_missing_status(&status) {
                    return Attempt::ShellMissing;
                }
                return conclude_pre_started(session, events, status).await;
            }
            result = stdout.read(&mut buf) => match result {
                Ok(0) | Err(_) => {
                    let status = (&mut status_fut).await;
                    if shell_missing_status(&status) {
                        return Attempt::ShellMissing;
                    }
                    return conclude_pre_started(session, events, status).await;
                }
                Ok(n) => {
                    if events.send(BridgeEvent::Started).await.is_err() {
                        return Attempt::SessionGone;
                    }
                    if events
                        .send(BridgeEvent::Output(Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        return Attempt::SessionGone;
                    }
                }
            }
        }
    } else if events.send(BridgeEvent::Started).await.is_err() {
        return Attempt::SessionGone;
    }

    // Established. Stdin gets its own pump so that a full output channel
    // can never stall stdin delivery (and vice versa); anything the
    // client sent before this point is still queued in the receiver.
    let stdin_pump = stdin_slot
        .take()
        .map(|rx| tokio::spawn(pump_stdin(session, stdin, rx)));

    let outcome = loop {
        tokio::select! {
            status = &mut status_fut => {
                break deliver_status(session, events, status).await;
            }
            result = stdout.read(&mut buf) => match result {
                Ok(0) => {
                    let status = (&mut status_fut).await;
                    break deliver_status(session, events, status).await;
                }
                Ok(n) => {
                    // Awaited send into the bounded channel: client-side
                    // backpressure pauses this read.
                    if events
                        .send(BridgeEvent::Output(Bytes::copy_from_slice(&buf[..n])))
                        .await
                        .is_err()
                    {
                        break Attempt::SessionGone;
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %session, "exec stdout read error: {e}");
                    let _ = events
                        .send(BridgeEvent::Finished {
                            close_code: close_code::ERROR,
                            reason: "exec stream error",
                        })
                        .await;
                    break Attempt::Done;
                }
            },
            changed = size_rx.changed() => {
                if changed.is_err() {
                    break Attempt::SessionGone;
                }
                let size = *size_rx.borrow_and_update();
                let _ = size_tx
                    .send(TerminalSize {
                        height: size.rows,
                        width: size.cols,
                    })
                    .await;
            }
        }
    };

    if let Some(pump) = stdin_pump {
        pump.abort();
    }
    outcome
}

/// Forwards client stdin chunks into the exec stream. Runs as its own
/// task from establishment until the session or the stream goes away.
async fn pump_stdin(
    session: Uuid,
    mut stdin: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
    mut rx: mpsc::Receiver<Bytes>,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            tracing::warn!(session = %session, "exec stdin write error: {e}");
            break;
        }
    }
}

/// Final status arriving before the attempt was established. A non-shell
/// failure skips `started`; an immediate clean exit still gets the full
/// `started` → `status` → close sequence.
async fn conclude_pre_started(
    session: Uuid,
    events: &mpsc::Sender<BridgeEvent>,
    status: Option<Status>,
) -> Attempt {
    let failed = matches!(&status, Some(s) if s.status.as_deref() == Some("Failure"));
    if !failed && events.send(BridgeEvent::Started).await.is_err() {
        return Attempt::SessionGone;
    }
    deliver_status(session, events, status).await
}

/// Forwards the terminal exec status and translates it into the session
/// close: `Success` ends normally, `Failure` is surfaced as an error.
async fn deliver_status(
    session: Uuid,
    events: &mpsc::Sender<BridgeEvent>,
    status: Option<Status>,
) -> Attempt {
    let Some(status) = status else {
        // Stream ended without a terminal status object.
        let _ = events
            .send(BridgeEvent::Finished {
                close_code: close_code::NORMAL,
                reason: "exec finished",
            })
            .await;
        return Attempt::Done;
    };

    let value = serde_json::to_value(&status).unwrap_or(serde_json::Value::Null);
    if events.send(BridgeEvent::Status(value)).await.is_err() {
        return Attempt::SessionGone;
    }

    match status.status.as_deref() {
        Some("Failure") => {
            tracing::info!(session = %session, message = ?status.message, "exec failed");
            let _ = events
                .send(BridgeEvent::Fatal {
                    message: status.message.unwrap_or_else(|| "exec failed".to_string()),
                    close_code: close_code::ERROR,
                    reason: "exec failed",
                })
                .await;
        }
        _ => {
            tracing::info!(session = %session, "exec finished");
            let _ = events
                .send(BridgeEvent::Finished {
                    close_code: close_code::NORMAL,
                    reason: "exec finished",
                })
                .await;
        }
    }
    Attempt::Done
}

fn is_shell_missing(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    SHELL_MISSING_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

fn shell_missing_status(status: &Option<Status>) -> bool {
    match status {
        Some(status) if status.status.as_deref() == Some("Failure") => status
            .message
            .as_deref()
            .map(is_shell_missing)
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure_status(message: &str) -> Option<Status> {
        Some(Status {
            status: Some("Failure".to_string()),
            message: Some(message.to_string()),
            ..Status::default()
        })
    }

    #[test]
    fn candidate_order_prefers_bash() {
        assert_eq!(SHELL_CANDIDATES.len(), 9);
        assert_eq!(SHELL_CANDIDATES[0], ["/bin/bash", "-il"]);
        assert_eq!(SHELL_CANDIDATES[3], ["/bin/sh", "-i"]);
        assert_eq!(SHELL_CANDIDATES[8], ["ash", "-i"]);
    }

    #[test]
    fn missing_markers_match() {
        assert!(is_shell_missing(
            "OCI runtime exec failed: exec failed: unable to start container process: \
             exec: \"/bin/bash\": executable file not found in $PATH: unknown"
        ));
        assert!(is_shell_missing("stat /bin/ash: no such file or directory"));
        assert!(is_shell_missing("sh: not found"));
        assert!(!is_shell_missing("connection refused"));
        assert!(!is_shell_missing("pods \"gone\" is forbidden"));
    }

    #[test]
    fn marker_match_is_case_insensitive() {
        assert!(is_shell_missing("Executable File Not Found in $PATH"));
    }

    #[test]
    fn shell_missing_requires_failure_status() {
        assert!(shell_missing_status(&failure_status(
            "executable file not found in $PATH"
        )));
        assert!(!shell_missing_status(&failure_status("permission denied")));
        assert!(!shell_missing_status(&Some(Status {
            status: Some("Success".to_string()),
            message: Some("not found".to_string()),
            ..Status::default()
        })));
        assert!(!shell_missing_status(&None));
    }
}
