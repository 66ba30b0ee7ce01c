//! Worker process lifecycle.
//!
//! [`ProcessSupervisor`] owns exactly one OS process. A reaper task owns the
//! child handle, publishes the status on a watch channel and hands the exit
//! result to the single [`Supervisor::wait`] caller.

use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWrite;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use crate::error::SupervisorError;

/// Boxed sink for the child's stdout or stderr.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    NotStarted,
    Running,
    /// Exited with status 0, or was terminated by a signal.
    Complete,
    /// Exited with a non-zero status.
    Crashed,
    StartFailed,
}

impl SupervisorStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupervisorStatus::Complete | SupervisorStatus::Crashed | SupervisorStatus::StartFailed
        )
    }
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn start(&self) -> Result<(), SupervisorError>;

    /// Graceful stop: SIGTERM, then SIGKILL once the stop timeout passes.
    /// Stopping a process that is not running is a no-op.
    async fn stop(&self) -> Result<(), SupervisorError>;

    fn kill(&self) -> Result<(), SupervisorError>;

    fn signal(&self, signal: Signal) -> Result<(), SupervisorError>;

    /// Resolves when the process exits. `Ok` for exit status 0,
    /// `TerminatedBySignal` or `Crashed` otherwise.
    async fn wait(&self) -> Result<(), SupervisorError>;

    fn status(&self) -> SupervisorStatus;
}

/// Builds a fresh supervisor for each start cycle; `env` is overlaid on the
/// host environment.
pub trait SupervisorFactory: Send + Sync {
    fn create(&self, env: BTreeMap<String, String>) -> Arc<dyn Supervisor>;
}

pub struct ProcessSupervisor {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    stop_timeout: Duration,
    stdout: Mutex<Option<OutputSink>>,
    stderr: Mutex<Option<OutputSink>>,
    status: watch::Sender<SupervisorStatus>,
    pid: Mutex<Option<Pid>>,
    exit: Mutex<Option<oneshot::Receiver<Result<(), SupervisorError>>>>,
}

impl ProcessSupervisor {
    pub fn new(command: impl Into<String>, args: Vec<String>, env: BTreeMap<String, String>) -> Self {
        let (status, _) = watch::channel(SupervisorStatus::NotStarted);
        Self {
            command: command.into(),
            args,
            env,
            stop_timeout: Duration::from_secs(5),
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
            status,
            pid: Mutex::new(None),
            exit: Mutex::new(None),
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Redirects the child's stdout; the host's stdout is used otherwise.
    pub fn with_stdout(self, sink: OutputSink) -> Self {
        set_slot(&self.stdout, Some(sink));
        self
    }

    /// Redirects the child's stderr; the host's stderr is used otherwise.
    pub fn with_stderr(self, sink: OutputSink) -> Self {
        set_slot(&self.stderr, Some(sink));
        self
    }

    fn current_pid(&self) -> Option<Pid> {
        *lock(&self.pid)
    }

    async fn wait_terminal(&self, timeout: Duration) -> bool {
        let mut rx = self.status.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(SupervisorStatus::is_terminal))
            .await
            .is_ok();
        reached
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start(&self) -> Result<(), SupervisorError> {
        if *self.status.borrow() != SupervisorStatus::NotStarted {
            return Err(SupervisorError::AlreadyStarted);
        }

        let stdout_sink = take_slot(&self.stdout);
        let stderr_sink = take_slot(&self.stderr);

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(if stdout_sink.is_some() { Stdio::piped() } else { Stdio::inherit() })
            .stderr(if stderr_sink.is_some() { Stdio::piped() } else { Stdio::inherit() })
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.status.send_replace(SupervisorStatus::StartFailed);
                return Err(SupervisorError::SpawnFailed {
                    command: self.command.clone(),
                    source,
                });
            }
        };

        if let (Some(mut pipe), Some(mut sink)) = (child.stdout.take(), stdout_sink) {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut pipe, &mut sink).await;
            });
        }
        if let (Some(mut pipe), Some(mut sink)) = (child.stderr.take(), stderr_sink) {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut pipe, &mut sink).await;
            });
        }

        let pid = child.id().map(|id| Pid::from_raw(id as i32));
        *lock(&self.pid) = pid;
        tracing::info!(command = %self.command, pid = ?pid.map(Pid::as_raw), "worker process started");

        let (exit_tx, exit_rx) = oneshot::channel();
        *lock(&self.exit) = Some(exit_rx);
        self.status.send_replace(SupervisorStatus::Running);

        let status = self.status.clone();
        tokio::spawn(async move {
            let (next, result) = match child.wait().await {
                Ok(exit) => classify_exit(exit),
                Err(err) => (SupervisorStatus::Crashed, Err(SupervisorError::Wait(err))),
            };
            tracing::debug!(status = ?next, "worker process reaped");
            status.send_replace(next);
            let _ = exit_tx.send(result);
        });

        Ok(())
    }

    async fn stop(&self) -> Result<(), SupervisorError> {
        if *self.status.borrow() != SupervisorStatus::Running {
            return Ok(());
        }

        match self.signal(Signal::SIGTERM) {
            Ok(()) | Err(SupervisorError::NotRunning) => {}
            Err(err) => return Err(err),
        }
        if self.wait_terminal(self.stop_timeout).await {
            return Ok(());
        }

        tracing::warn!(
            command = %self.command,
            timeout_ms = self.stop_timeout.as_millis() as u64,
            "worker ignored SIGTERM, killing",
        );
        match self.kill() {
            Ok(()) | Err(SupervisorError::NotRunning) => {}
            Err(err) => return Err(err),
        }
        self.wait_terminal(self.stop_timeout).await;
        Ok(())
    }

    fn kill(&self) -> Result<(), SupervisorError> {
        self.signal(Signal::SIGKILL)
    }

    fn signal(&self, sig: Signal) -> Result<(), SupervisorError> {
        if *self.status.borrow() != SupervisorStatus::Running {
            return Err(SupervisorError::NotRunning);
        }
        let Some(pid) = self.current_pid() else {
            return Err(SupervisorError::NotRunning);
        };
        match signal::kill(pid, sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SupervisorError::NotRunning),
            Err(err) => Err(err.into()),
        }
    }

    async fn wait(&self) -> Result<(), SupervisorError> {
        let exit = lock(&self.exit).take();
        match exit {
            Some(rx) => rx.await.unwrap_or(Err(SupervisorError::NotRunning)),
            None => Err(SupervisorError::NotRunning),
        }
    }

    fn status(&self) -> SupervisorStatus {
        *self.status.borrow()
    }
}

fn classify_exit(exit: ExitStatus) -> (SupervisorStatus, Result<(), SupervisorError>) {
    if exit.success() {
        return (SupervisorStatus::Complete, Ok(()));
    }
    match exit.code() {
        Some(code) => (SupervisorStatus::Crashed, Err(SupervisorError::Crashed { code: Some(code) })),
        None => match exit.signal() {
            Some(sig) => (SupervisorStatus::Complete, Err(SupervisorError::TerminatedBySignal(sig))),
            None => (SupervisorStatus::Crashed, Err(SupervisorError::Crashed { code: None })),
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn take_slot(slot: &Mutex<Option<OutputSink>>) -> Option<OutputSink> {
    lock(slot).take()
}

fn set_slot(slot: &Mutex<Option<OutputSink>>, value: Option<OutputSink>) {
    *lock(slot) = value;
}

/// Creates [`ProcessSupervisor`]s for one worker command.
#[derive(Debug, Clone)]
pub struct ProcessSupervisorFactory {
    pub command: String,
    pub args: Vec<String>,
    pub stop_timeout: Duration,
}

impl ProcessSupervisorFactory {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            stop_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

impl SupervisorFactory for ProcessSupervisorFactory {
    fn create(&self, env: BTreeMap<String, String>) -> Arc<dyn Supervisor> {
        Arc::new(
            ProcessSupervisor::new(self.command.clone(), self.args.clone(), env)
                .with_stop_timeout(self.stop_timeout),
        )
    }
}
