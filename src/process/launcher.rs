//! Spawning one generation of the supervised command

use crate::error::ProcessError;
use log::{debug, info, warn};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Callback receiving each line a child writes, without its line terminator
pub type LineConsumer = Arc<dyn Fn(String) + Send + Sync>;

/// Slot holding the live generation's stdin, empty between generations
pub(crate) type StdinSlot = Arc<Mutex<Option<ChildStdin>>>;

/// Everything needed to start the command again
#[derive(Clone)]
pub(crate) struct Launcher {
    pub(crate) command: Arc<[String]>,
    pub(crate) stdout: Option<LineConsumer>,
    pub(crate) stderr: Option<LineConsumer>,
    pub(crate) stdin: StdinSlot,
}

/// One running child together with the tasks draining its output
pub(crate) struct Generation {
    pub(crate) child: Child,
    drains: Vec<Option<JoinHandle<()>>>,
}

impl Launcher {
    /// Command line for log messages
    pub(crate) fn display(&self) -> String {
        self.command.join(" ")
    }

    /// Spawn a new child and start draining the streams that have a consumer
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::Spawn` if the command cannot be started, or
    /// `ProcessError::Pipe` if one of the requested pipes is missing.
    pub(crate) async fn spawn(&self) -> Result<Generation, ProcessError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(ProcessError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(piped_if(self.stdout.is_some()))
            .stderr(piped_if(self.stderr.is_some()))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: self.display(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(ProcessError::Pipe("stdin"))?;
        *self.stdin.lock().await = Some(stdin);

        let mut drains = Vec::with_capacity(2);
        if let Some(consumer) = &self.stdout {
            let stdout = child.stdout.take().ok_or(ProcessError::Pipe("stdout"))?;
            drains.push(Some(tokio::spawn(drain(stdout, consumer.clone(), "stdout"))));
        }
        if let Some(consumer) = &self.stderr {
            let stderr = child.stderr.take().ok_or(ProcessError::Pipe("stderr"))?;
            drains.push(Some(tokio::spawn(drain(stderr, consumer.clone(), "stderr"))));
        }

        info!("Started {} (pid {:?})", self.display(), child.id());
        Ok(Generation { child, drains })
    }

    /// Close the child's stdin, if still open
    pub(crate) async fn close_stdin(&self) {
        if self.stdin.lock().await.take().is_some() {
            debug!("Closed stdin of {}", self.display());
        }
    }
}

fn piped_if(wanted: bool) -> Stdio {
    if wanted {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

impl Generation {
    /// Wait until every drain has reached end of stream, then reap the child
    ///
    /// Cancel safe: finished drains are forgotten, so polling again after a
    /// dropped call resumes where it stopped.
    pub(crate) async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        for slot in self.drains.iter_mut() {
            if let Some(handle) = slot.as_mut() {
                if let Err(e) = handle.await {
                    warn!("Output drain task failed: {}", e);
                }
                *slot = None;
            }
        }
        self.child.wait().await
    }

    /// Give the drains up to `limit` to finish after the child is gone
    pub(crate) async fn join_drains(&mut self, limit: Duration) {
        for slot in self.drains.iter_mut() {
            let Some(mut handle) = slot.take() else {
                continue;
            };
            if tokio::time::timeout(limit, &mut handle).await.is_err() {
                // A grandchild can keep the pipe open after the child dies
                warn!("Output drain did not finish within {:?}, aborting", limit);
                handle.abort();
            }
        }
    }
}

/// Feed every line of `stream` to `consumer` until end of stream
async fn drain<R>(stream: R, consumer: LineConsumer, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                consumer(line.trim_end_matches(['\n', '\r']).to_string());
            }
            Err(e) => {
                warn!("Error reading child {}: {}", name, e);
                break;
            }
        }
    }
    debug!("Child {} closed", name);
}
