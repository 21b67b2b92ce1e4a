//! Worker process lifecycle.
//!
//! The worker is started once with piped stdio. Its stdout/stdin become an
//! [`RpcChannel`], its stderr is forwarded to the log, and a monitor task
//! logs the exit. A crashed worker is not restarted: the channel closes and
//! every later request fails with [`RpcError::WorkerUnavailable`].
//!
//! [`RpcError::WorkerUnavailable`]: crate::ipc::RpcError::WorkerUnavailable

use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::WorkerCommand;
use crate::ipc::{ChannelConfig, RpcChannel};

/// Handle to a running worker process.
///
/// Dropping the handle leaves the worker running until the runtime shuts
/// down; the child is killed when its monitor task is dropped.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    /// OS process id, if the process had not already exited at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, once the worker has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit_rx.borrow()
    }

    /// Wait for the worker to exit.
    ///
    /// Returns `None` if the exit status could not be collected.
    pub async fn wait_for_exit(&mut self) -> Option<ExitStatus> {
        if let Ok(status) = self.exit_rx.wait_for(Option::is_some).await {
            return *status;
        }
        *self.exit_rx.borrow()
    }

    /// Kill the worker if it is still running and wait for it to exit.
    pub async fn shutdown(mut self) -> Option<ExitStatus> {
        if self.exit_status().is_none() {
            if let Some(kill_tx) = self.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }
        self.wait_for_exit().await
    }
}

/// Start the worker and connect a channel to its stdio.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if the process cannot be spawned or its pipes cannot be
/// taken.
pub fn spawn_worker(
    command: &WorkerCommand,
    config: ChannelConfig,
) -> Result<(RpcChannel, WorkerHandle)> {
    info!("Starting worker: {}", command);

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn worker process: {}", command))?;

    let pid = child.id();
    let stdin = child
        .stdin
        .take()
        .context("Failed to get stdin handle for worker")?;
    let stdout = child
        .stdout
        .take()
        .context("Failed to get stdout handle for worker")?;
    let stderr = child
        .stderr
        .take()
        .context("Failed to get stderr handle for worker")?;

    tokio::spawn(forward_stderr(stderr));

    let channel = RpcChannel::new(stdout, stdin, config);

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = oneshot::channel();
    tokio::spawn(watch_exit(child, exit_tx, kill_rx));

    info!("Worker started (pid {:?})", pid);

    Ok((
        channel,
        WorkerHandle {
            pid,
            exit_rx,
            kill_tx: Some(kill_tx),
        },
    ))
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!("[worker] {}", line),
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read worker stderr: {}", e);
                break;
            }
        }
    }
    debug!("Worker stderr closed");
}

async fn watch_exit(
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    kill_rx: oneshot::Receiver<()>,
) {
    // A dropped kill sender disables the kill branch.
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = kill_rx => None,
    };

    let status = match exited {
        Some(status) => {
            match &status {
                Ok(status) => error!("Worker process exited with {}", status),
                Err(e) => error!("Failed to wait for worker process: {}", e),
            }
            status
        }
        None => {
            info!("Stopping worker process");
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill worker process: {}", e);
            }
            let status = child.wait().await;
            if let Ok(status) = &status {
                info!("Worker process stopped ({})", status);
            }
            status
        }
    };

    exit_tx.send_replace(status.ok());
}
