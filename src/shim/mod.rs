//! Shim exposing one embedded plugin over standard streams
//!
//! A [`Shim`] holds exactly one plugin: an input, an output or a processor.
//! Running it turns the current process into something a parent supervisor
//! can manage like any external plugin:
//!
//! - input: metrics are collected on a timer or on demand and written to
//!   stdout as wire lines; every line read from stdin, and SIGHUP/SIGUSR1/SIGUSR2
//!   on unix, requests an immediate pass; stdin EOF ends the session
//! - output: wire lines read from stdin are decoded and written to the sink
//! - processor: wire lines read from stdin are decoded, transformed and
//!   written back to stdout
//!
//! Standard streams are injected through [`Shim::with_io`] so sessions can be
//! driven from in-memory pipes.

use crate::error::{PluginError, ShimError};
use crate::plugins::{Input, Output, Processor};
use log::{debug, info};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

mod accumulator;
mod input;
mod output;
mod processor;
pub mod signals;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The single plugin a shim session owns
pub enum Plugin {
    Input(Box<dyn Input>),
    Output(Box<dyn Output>),
    Processor(Box<dyn Processor>),
}

impl Plugin {
    pub fn kind(&self) -> &'static str {
        match self {
            Plugin::Input(_) => "input",
            Plugin::Output(_) => "output",
            Plugin::Processor(_) => "processor",
        }
    }
}

/// Handle that requests one collection pass
///
/// Backed by a single-slot channel: while a request is pending, further
/// requests are dropped, so bursts collapse into one pass.
#[derive(Debug, Clone)]
pub struct CollectTrigger {
    tx: mpsc::Sender<()>,
}

impl CollectTrigger {
    /// Request a pass; returns `false` if one was already pending or the
    /// session is gone
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!("Collect request already pending, coalescing");
                false
            }
            Err(TrySendError::Closed(())) => false,
        }
    }
}

/// A shim session around one plugin
pub struct Shim {
    plugin: Option<Plugin>,
    stdin: BoxedReader,
    stdout: BoxedWriter,
    stderr: BoxedWriter,
    trigger: CollectTrigger,
    requests: mpsc::Receiver<()>,
    shutdown: CancellationToken,
}

impl Default for Shim {
    fn default() -> Self {
        Self::new()
    }
}

impl Shim {
    /// Create a session bound to the process's standard streams
    pub fn new() -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr())
    }

    /// Create a session bound to the given streams
    pub fn with_io<R, W, E>(stdin: R, stdout: W, stderr: E) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, requests) = mpsc::channel(1);
        Self {
            plugin: None,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            trigger: CollectTrigger { tx },
            requests,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that ends the session when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handle for requesting collection passes from outside the session
    pub fn collect_trigger(&self) -> CollectTrigger {
        self.trigger.clone()
    }

    /// Kind of the registered plugin, if any
    pub fn plugin_kind(&self) -> Option<&'static str> {
        self.plugin.as_ref().map(Plugin::kind)
    }

    /// Register the session's input, running its init hook
    pub fn add_input(&mut self, mut input: Box<dyn Input>) -> Result<(), ShimError> {
        self.ensure_vacant()?;
        input.init().map_err(ShimError::Init)?;
        self.plugin = Some(Plugin::Input(input));
        Ok(())
    }

    /// Register the session's output, running its init hook
    pub fn add_output(&mut self, mut output: Box<dyn Output>) -> Result<(), ShimError> {
        self.ensure_vacant()?;
        output.init().map_err(ShimError::Init)?;
        self.plugin = Some(Plugin::Output(output));
        Ok(())
    }

    /// Register the session's processor, running its init hook
    pub fn add_processor(&mut self, mut processor: Box<dyn Processor>) -> Result<(), ShimError> {
        self.ensure_vacant()?;
        processor.init().map_err(ShimError::Init)?;
        self.plugin = Some(Plugin::Processor(processor));
        Ok(())
    }

    fn ensure_vacant(&self) -> Result<(), ShimError> {
        match &self.plugin {
            Some(plugin) => Err(ShimError::PluginAlreadyRegistered(plugin.kind())),
            None => Ok(()),
        }
    }

    /// Run the session until stdin closes or the shutdown token is cancelled
    ///
    /// `interval` only applies to inputs; zero disables the timer so passes
    /// happen on request only.
    pub async fn run(self, interval: Duration) -> Result<(), ShimError> {
        let Shim {
            plugin,
            stdin,
            stdout,
            stderr,
            trigger,
            requests,
            shutdown,
        } = self;

        let plugin = plugin.ok_or(ShimError::NoPlugin)?;
        info!("Running shim with {} plugin", plugin.kind());

        match plugin {
            Plugin::Input(plugin) => {
                input::run(
                    plugin,
                    interval,
                    input::Session {
                        stdin,
                        stdout,
                        stderr,
                        trigger,
                        requests,
                        shutdown,
                    },
                )
                .await
            }
            Plugin::Output(plugin) => output::run(plugin, stdin, stderr, shutdown).await,
            Plugin::Processor(plugin) => {
                processor::run(plugin, stdin, stdout, stderr, shutdown).await
            }
        }
    }
}

/// Reads stdin line by line, replacing invalid UTF-8 instead of failing
///
/// Cancel safe: bytes of a partially read line stay buffered until the next
/// call completes it.
pub(crate) struct LineReader {
    reader: BufReader<BoxedReader>,
    buf: Vec<u8>,
}

impl LineReader {
    pub(crate) fn new(stdin: BoxedReader) -> Self {
        Self {
            reader: BufReader::new(stdin),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator; `None` at end of stream
    pub(crate) async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        self.buf.clear();
        Ok(Some(line))
    }
}

/// Write a diagnostic line to the session's stderr
async fn report(stderr: &mut BoxedWriter, message: &str) -> std::io::Result<()> {
    debug!("{}", message);
    stderr.write_all(format!("{}\n", message).as_bytes()).await?;
    stderr.flush().await
}

async fn report_plugin_error(stderr: &mut BoxedWriter, error: &PluginError) -> std::io::Result<()> {
    report(stderr, &error.to_string()).await
}
