//! Spawning, piping and teardown of the password-change program.
//!
//! The program runs with `LC_ALL` forced (so prompt matching is
//! locale-independent), stderr merged into stdout, and `SIGPIPE` ignored.
//! A watcher task forwards stdout chunks and, after EOF, the exit status as
//! [`BackendEvent`]s. Every spawn gets a new generation number and events from
//! older generations are discarded, so nothing is delivered after teardown.

use std::io::{self, PipeWriter, Write};
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::BackendConfig;
use crate::passwd::SecretSink;

/// Backoff bounds for retrying failed output reads.
const READ_RETRY_BASE: Duration = Duration::from_millis(10);
const READ_RETRY_MAX: Duration = Duration::from_secs(1);

/// Error type for backend spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The program was not found.
    #[error("passwd program not found")]
    NotFound,
    /// Permission denied when spawning.
    #[error("Permission denied")]
    PermissionDenied,
    /// Other I/O error, including pipe setup.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(err),
        }
    }
}

/// Notification from a running backend.
#[derive(Debug)]
pub enum BackendEvent {
    /// Bytes read from the merged stdout/stderr stream.
    Output { generation: u64, bytes: Vec<u8> },
    /// The child was reaped. Always the last event of a generation.
    Exited { generation: u64, status: ExitStatus },
}

impl BackendEvent {
    #[must_use]
    pub fn generation(&self) -> u64 {
        match self {
            Self::Output { generation, .. } | Self::Exited { generation, .. } => *generation,
        }
    }
}

/// Exit code of the backend, logging statuses that indicate a crash.
#[must_use]
pub fn exit_code(status: ExitStatus) -> Option<i32> {
    match status.code() {
        Some(code) if code >= 255 => {
            tracing::warn!(code, "passwd exited unexpectedly");
            Some(code)
        }
        Some(code) => Some(code),
        None => {
            tracing::warn!(%status, "passwd terminated by signal");
            None
        }
    }
}

#[derive(Debug)]
struct RunningBackend {
    pid: u32,
    stdin: PipeWriter,
    watcher: JoinHandle<()>,
}

/// Owner of at most one running password-change process.
#[derive(Debug)]
pub struct PasswdBackend {
    config: BackendConfig,
    generation: u64,
    running: Option<RunningBackend>,
    events_tx: UnboundedSender<BackendEvent>,
    events_rx: UnboundedReceiver<BackendEvent>,
}

impl PasswdBackend {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            generation: 0,
            running: None,
            events_tx,
            events_rx,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Process ID of the running backend, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|r| r.pid)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Generation of the current (or most recent) process instance.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Spawn the backend, stopping any previous instance first.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the pipes cannot be created or the program
    /// fails to start. Nothing is left running in that case.
    pub fn spawn(&mut self) -> Result<(), SpawnError> {
        self.stop();

        let (stdin_reader, stdin_writer) = io::pipe()?;
        let (stdout_reader, stdout_writer) = io::pipe()?;
        // 2>&1
        let stderr_writer = stdout_writer.try_clone()?;

        let mut child = {
            let mut cmd = Command::new(&self.config.program);
            cmd.args(&self.config.args)
                .env("LC_ALL", &self.config.locale)
                .stdin(Stdio::from(stdin_reader))
                .stdout(Stdio::from(stdout_writer))
                .stderr(Stdio::from(stderr_writer))
                .kill_on_drop(true);
            ignore_sigpipe_in_child(&mut cmd);
            // The command holds the child's pipe ends; it drops here so EOF
            // is seen once the child exits.
            cmd.spawn().map_err(SpawnError::from_io)?
        };

        let Some(pid) = child.id() else {
            return Err(SpawnError::Io(io::Error::other("passwd exited during spawn")));
        };

        let stdout = match pipe::Receiver::from_owned_fd(OwnedFd::from(stdout_reader)) {
            Ok(stdout) => stdout,
            Err(e) => {
                let _ = child.start_kill();
                return Err(SpawnError::Io(e));
            }
        };

        self.generation += 1;
        let watcher = tokio::spawn(watch_backend(
            child,
            stdout,
            self.config.read_chunk.max(1),
            self.generation,
            self.events_tx.clone(),
        ));

        tracing::debug!(
            pid,
            generation = self.generation,
            program = %self.config.program.display(),
            "Spawned passwd backend"
        );

        self.running = Some(RunningBackend {
            pid,
            stdin: stdin_writer,
            watcher,
        });
        Ok(())
    }

    /// Kill the backend and release it. A no-op when nothing is running.
    pub fn stop(&mut self) {
        if let Some(running) = &self.running {
            // A finished watcher has already reaped the child; its pid may be reused.
            if !running.watcher.is_finished() {
                send_sigkill(running.pid);
            }
        }
        self.release();
    }

    /// Release the watcher and both pipes without signalling the child.
    /// Used once the child has already been reaped. A no-op when nothing is running.
    pub fn release(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        // Dropping the watcher's Child kills and reaps anything still alive.
        running.watcher.abort();
        drop(running.stdin);
        tracing::debug!(
            pid = running.pid,
            generation = self.generation,
            "Released passwd backend"
        );
    }

    /// Wait for the next event of the running instance.
    ///
    /// Returns `None` immediately when nothing is running. Events left over
    /// from earlier instances are skipped.
    pub async fn next_event(&mut self) -> Option<BackendEvent> {
        loop {
            if self.running.is_none() {
                return None;
            }
            let event = self.events_rx.recv().await?;
            if event.generation() == self.generation {
                return Some(event);
            }
            tracing::trace!(
                stale = event.generation(),
                current = self.generation,
                "Dropping event from a stopped backend"
            );
        }
    }
}

impl SecretSink for PasswdBackend {
    fn write_secret(&mut self, line: &[u8]) -> io::Result<()> {
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "passwd is not running"))?;
        // Lines are far below PIPE_BUF, so the write is atomic and does not block.
        running.stdin.write_all(line)?;
        running.stdin.flush()
    }
}

impl Drop for PasswdBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(unsafe_code)]
fn ignore_sigpipe_in_child(cmd: &mut Command) {
    use nix::sys::signal::{signal, SigHandler, Signal};

    let ignore_sigpipe = || -> io::Result<()> {
        // SAFETY: installs SIG_IGN, no handler code runs.
        let previous = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) };
        previous?;
        Ok(())
    };

    // SAFETY: the hook makes a single sigaction call, which is
    // async-signal-safe between fork and exec.
    unsafe {
        cmd.pre_exec(ignore_sigpipe);
    }
}

fn send_sigkill(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
    match kill(nix_pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "Could not kill passwd backend"),
    }
}

/// Backoff before retrying a failed read: doubles from `READ_RETRY_BASE` and
/// saturates at `READ_RETRY_MAX`.
fn read_retry_delay(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    READ_RETRY_BASE
        .saturating_mul(1 << shift)
        .min(READ_RETRY_MAX)
}

/// Forward output chunks, then reap the child and report its status.
/// Read errors never end the conversation; only EOF does.
async fn watch_backend(
    mut child: Child,
    mut stdout: pipe::Receiver,
    read_chunk: usize,
    generation: u64,
    events: UnboundedSender<BackendEvent>,
) {
    let mut buf = vec![0u8; read_chunk];
    let mut failures = 0u32;

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                failures = 0;
                let event = BackendEvent::Output {
                    generation,
                    bytes: buf[..n].to_vec(),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = read_retry_delay(failures);
                tracing::warn!(error = %e, generation, failures, ?delay, "passwd output read error");
                if events.is_closed() {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
        }
    }

    match child.wait().await {
        Ok(status) => {
            let _ = events.send(BackendEvent::Exited { generation, status });
        }
        Err(e) => tracing::warn!(error = %e, generation, "Could not reap passwd backend"),
    }
}
