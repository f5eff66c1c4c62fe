//! Supervision of one external command
//!
//! [`ManagedProcess`] launches a command, drains its output through caller
//! supplied line consumers and restarts it after a fixed delay whenever it
//! exits. Stopping closes the child's stdin, sends a soft terminate and
//! escalates to a kill once the grace period is over.
//!
//! Successive generations never overlap: a new child is spawned only after
//! the previous one has been reaped and its output fully drained.

use crate::error::ProcessError;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod graceful;
mod launcher;

use launcher::{Generation, Launcher};
pub use launcher::LineConsumer;

/// Delay between an unexpected exit and the next spawn
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Time a child gets to exit after the soft terminate before it is killed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// State shared between the handle and its supervise loop
struct Shared {
    restarts: AtomicU64,
    running: AtomicBool,
}

/// A command kept alive by a background supervise loop
///
/// # Example
///
/// ```rust,no_run
/// use procshim::process::ManagedProcess;
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), procshim::error::ProcessError> {
/// let mut process = ManagedProcess::new(["my-plugin", "--config", "plugin.toml"])?
///     .with_stdout_consumer(|line| println!("{}", line))
///     .with_restart_delay(Duration::from_secs(1));
///
/// process.start().await?;
/// process.write_line("").await?;
/// process.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct ManagedProcess {
    launcher: Launcher,
    restart_delay: Duration,
    grace_period: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    exited: CancellationToken,
    supervisor: Option<JoinHandle<Result<(), ProcessError>>>,
}

impl ManagedProcess {
    /// Create a supervisor for `command`, the program followed by its arguments
    ///
    /// Nothing is spawned until [`start`](Self::start) is called. The child's
    /// stdin is always piped; stdout and stderr are piped only when a consumer
    /// is configured and discarded otherwise.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::EmptyCommand` if `command` is empty.
    pub fn new<I, S>(command: I) -> Result<Self, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command: Arc<[String]> = command.into_iter().map(Into::into).collect();
        if command.is_empty() || command[0].is_empty() {
            return Err(ProcessError::EmptyCommand);
        }

        Ok(Self {
            launcher: Launcher {
                command,
                stdout: None,
                stderr: None,
                stdin: Arc::new(Mutex::new(None)),
            },
            restart_delay: DEFAULT_RESTART_DELAY,
            grace_period: DEFAULT_GRACE_PERIOD,
            shared: Arc::new(Shared {
                restarts: AtomicU64::new(0),
                running: AtomicBool::new(false),
            }),
            cancel: CancellationToken::new(),
            exited: CancellationToken::new(),
            supervisor: None,
        })
    }

    /// Receive every line the child writes to stdout
    pub fn with_stdout_consumer<F>(mut self, consumer: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.launcher.stdout = Some(Arc::new(consumer));
        self
    }

    /// Receive every line the child writes to stderr
    pub fn with_stderr_consumer<F>(mut self, consumer: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.launcher.stderr = Some(Arc::new(consumer));
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Spawn the command and start supervising it
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::Spawn` if the first spawn fails, in which case no
    /// supervise loop is started, or `ProcessError::AlreadyStarted` if a loop
    /// is already running.
    pub async fn start(&mut self) -> Result<(), ProcessError> {
        if self.supervisor.is_some() {
            return Err(ProcessError::AlreadyStarted);
        }

        let generation = self.launcher.spawn().await?;

        self.cancel = CancellationToken::new();
        self.exited = CancellationToken::new();
        self.shared.running.store(true, Ordering::SeqCst);

        let supervise = Supervise {
            launcher: self.launcher.clone(),
            restart_delay: self.restart_delay,
            grace_period: self.grace_period,
            shared: self.shared.clone(),
            cancel: self.cancel.clone(),
        };
        let exited = self.exited.clone();
        self.supervisor = Some(tokio::spawn(async move {
            let result = supervise.run(generation).await;
            exited.cancel();
            result
        }));
        Ok(())
    }

    /// Stop the command and wait for the supervise loop to finish
    ///
    /// When this returns no child and no drain task is left behind.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the loop early, if a restart failed to
    /// spawn, or `ProcessError::LoopPanicked` if the loop task panicked.
    pub async fn stop(&mut self) -> Result<(), ProcessError> {
        self.cancel.cancel();
        let Some(handle) = self.supervisor.take() else {
            return Ok(());
        };
        let result = handle.await.map_err(|e| {
            error!("Supervise loop for {} failed: {}", self.launcher.display(), e);
            ProcessError::LoopPanicked
        })?;
        info!("Stopped {}", self.launcher.display());
        result
    }

    /// Resolves once the supervise loop has ended, whether stopped or failed
    ///
    /// Never resolves if the process was not started.
    pub async fn wait_exited(&self) {
        self.exited.cancelled().await
    }

    /// Write one line to the current child's stdin
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::NotRunning` between generations or before start.
    pub async fn write_line(&self, line: &str) -> Result<(), ProcessError> {
        let mut stdin = self.launcher.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(ProcessError::NotRunning)?;
        pipe.write_all(line.as_bytes()).await?;
        pipe.write_all(b"\n").await?;
        pipe.flush().await?;
        Ok(())
    }

    /// Number of restarts performed so far
    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::SeqCst)
    }

    /// Whether the supervise loop is active
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The supervised command line
    pub fn command(&self) -> &[String] {
        &self.launcher.command
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        // The loop shuts the child down on its own once cancelled
        self.cancel.cancel();
    }
}

/// The background half of a [`ManagedProcess`]
struct Supervise {
    launcher: Launcher,
    restart_delay: Duration,
    grace_period: Duration,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Supervise {
    async fn run(self, mut generation: Generation) -> Result<(), ProcessError> {
        let name = self.launcher.display();

        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.shutdown(&mut generation).await;
                    break Ok(());
                }
                status = generation.wait() => match status {
                    Ok(status) => info!("{} exited: {}", name, status),
                    Err(e) => warn!("Error waiting for {}: {}", name, e),
                },
            }
            self.launcher.close_stdin().await;

            if self.cancel.is_cancelled() {
                debug!("{} exited during shutdown, not restarting", name);
                break Ok(());
            }

            debug!("Restarting {} in {:?}", name, self.restart_delay);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.restart_delay) => {}
            }

            generation = match self.launcher.spawn().await {
                Ok(next) => next,
                Err(e) => {
                    error!("Failed to restart {}: {}", name, e);
                    break Err(e);
                }
            };
            let restarts = self.shared.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            info!("Restarted {} ({} restarts)", name, restarts);
        };

        self.shared.running.store(false, Ordering::SeqCst);
        result
    }

    /// Close stdin, terminate the child, then collect what is left of its output
    async fn shutdown(&self, generation: &mut Generation) {
        self.launcher.close_stdin().await;
        match graceful::terminate(&mut generation.child, self.grace_period).await {
            Ok(status) => info!("{} stopped: {}", self.launcher.display(), status),
            Err(e) => warn!("Error stopping {}: {}", self.launcher.display(), e),
        }
        generation.join_drains(self.grace_period).await;
    }
}
