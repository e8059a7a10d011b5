//! 4.A Process Runner: spawn a child in its own process group, capture
//! output, enforce a hard timeout, and guarantee no zombie survives.

use std::os::unix::process::ExitStatusExt;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::PROCESS_KILL_GRACE;
use crate::error::CoreError;

/// Result of running one child process to completion, timeout, or
/// cancellation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Run `executable` with `args`, merging `env_overrides` into the inherited
/// environment. Returns `Ok` with `timed_out = true` when `timeout` elapses
/// before the child exits; returns `Err(Cancelled)` when `cancel` resolves
/// first; returns `Err(DependencyMissing)` when the executable cannot be
/// spawned at all.
pub async fn run(
    executable: &str,
    args: &[String],
    env_overrides: &[(String, String)],
    timeout: Duration,
    stdin_data: Option<&[u8]>,
    cancel: Option<tokio::sync::oneshot::Receiver<()>>,
) -> Result<ProcessOutput, CoreError> {
    let started = Instant::now();

    let mut command = Command::new(executable);
    command.args(args);
    for (k, v) in env_overrides {
        command.env(k, v);
    }
    command.process_group(0);
    command.stdin(std::process::Stdio::piped());
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());

    let mut child = command.spawn().map_err(|e| {
        CoreError::dependency_missing(format!("failed to start {executable}: {e}"))
    })?;

    let pid = child.id().ok_or_else(|| CoreError::dependency_missing(format!("no pid for {executable}")))?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            let _ = stdin.write_all(data).await;
            let _ = stdin.shutdown().await;
        }
    } else {
        drop(child.stdin.take());
    }

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let cancel_fut = async move {
        match cancel {
            Some(rx) => {
                let _ = rx.await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(cancel_fut);
    let sleep = tokio::time::sleep(timeout);
    tokio::pin!(sleep);

    enum Outcome {
        Exited(std::process::ExitStatus),
        TimedOut,
        Cancelled,
    }

    let outcome = tokio::select! {
        res = child.wait() => match res {
            Ok(status) => Outcome::Exited(status),
            Err(_) => Outcome::TimedOut,
        },
        _ = &mut sleep => Outcome::TimedOut,
        _ = &mut cancel_fut => Outcome::Cancelled,
    };

    let (exit_code, timed_out, was_cancelled) = match outcome {
        Outcome::Exited(status) => (status.code(), false, false),
        Outcome::TimedOut => {
            terminate_group(pid).await;
            let final_status = child.wait().await.ok();
            (final_status.and_then(|s| s.code().or_else(|| s.signal().map(|_| -1))), true, false)
        }
        Outcome::Cancelled => {
            terminate_group(pid).await;
            let _ = child.wait().await;
            (None, false, true)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    if was_cancelled {
        return Err(CoreError::Cancelled);
    }

    Ok(ProcessOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        timed_out,
        duration: started.elapsed(),
    })
}

async fn terminate_group(pid: u32) {
    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);
    tokio::time::sleep(PROCESS_KILL_GRACE).await;
    let _ = killpg(pgid, Signal::SIGKILL);
}

pub use crate::util::BoxFuture;

/// Indirection over [`run`] so every component that spawns helper binaries
/// (Mount Table Inspector, Unmount Service, Mount Manager) can be exercised
/// in tests against a fake executor instead of real subprocesses.
pub trait ProcessExecutor: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn run<'a>(
        &'a self,
        executable: &'a str,
        args: &'a [String],
        env_overrides: &'a [(String, String)],
        timeout: Duration,
        stdin_data: Option<&'a [u8]>,
        cancel: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> BoxFuture<'a, Result<ProcessOutput, CoreError>>;
}

/// Executor backed by real `tokio::process::Command` spawns.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealProcessExecutor;

impl ProcessExecutor for RealProcessExecutor {
    fn run<'a>(
        &'a self,
        executable: &'a str,
        args: &'a [String],
        env_overrides: &'a [(String, String)],
        timeout: Duration,
        stdin_data: Option<&'a [u8]>,
        cancel: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> BoxFuture<'a, Result<ProcessOutput, CoreError>> {
        Box::pin(run(executable, args, env_overrides, timeout, stdin_data, cancel))
    }
}
