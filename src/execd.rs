//! Host side of an external plugin
//!
//! [`Execd`] runs a plugin binary under a [`ManagedProcess`] and speaks the
//! line protocol with it: metrics the child prints are decoded and delivered
//! on a channel, metrics written to it are encoded onto its stdin, and an
//! empty line asks an input plugin for an immediate collection pass.

use crate::codec;
use crate::error::ProcessError;
use crate::metric::Metric;
use crate::process::ManagedProcess;
use log::{debug, warn};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct Execd {
    process: ManagedProcess,
    metrics: mpsc::UnboundedReceiver<Metric>,
}

impl Execd {
    /// Build a bridge for `command`; nothing runs until [`start`](Self::start)
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::EmptyCommand` if `command` is empty.
    pub fn new<I, S>(command: I) -> Result<Self, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, metrics) = mpsc::unbounded_channel();
        let process = ManagedProcess::new(command)?;
        let name = process.command().first().cloned().unwrap_or_default();
        let stderr_name = name.clone();

        let process = process
            .with_stdout_consumer(move |line| {
                if line.trim().is_empty() {
                    return;
                }
                match codec::decode(&line) {
                    Ok(metric) => {
                        // The receiver only goes away together with this bridge
                        let _ = tx.send(metric);
                    }
                    Err(e) => warn!("{}: failed to parse metric {:?}: {}", name, line, e),
                }
            })
            .with_stderr_consumer(move |line| warn!("{}: {}", stderr_name, line));

        Ok(Self { process, metrics })
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.process = self.process.with_restart_delay(delay);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.process = self.process.with_grace_period(grace);
        self
    }

    pub async fn start(&mut self) -> Result<(), ProcessError> {
        self.process.start().await
    }

    pub async fn stop(&mut self) -> Result<(), ProcessError> {
        self.process.stop().await
    }

    /// Send one metric to an output or processor plugin
    pub async fn write_metric(&self, metric: &Metric) -> Result<(), ProcessError> {
        let line = codec::encode(metric);
        self.process
            .write_line(line.trim_end_matches('\n'))
            .await
    }

    /// Ask an input plugin to collect now
    pub async fn request_collect(&self) -> Result<(), ProcessError> {
        debug!("Requesting collection from {}", self.process.command().join(" "));
        self.process.write_line("").await
    }

    /// Next metric produced by the plugin; `None` once the bridge is gone
    pub async fn recv(&mut self) -> Option<Metric> {
        self.metrics.recv().await
    }

    pub fn process(&self) -> &ManagedProcess {
        &self.process
    }
}
