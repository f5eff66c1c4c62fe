use super::accumulator::{Emitted, StreamingAccumulator};
use super::{report_plugin_error, signals, BoxedReader, BoxedWriter, CollectTrigger, LineReader};
use crate::error::ShimError;
use crate::plugins::Input;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Everything an input session needs besides the plugin
pub(super) struct Session {
    pub(super) stdin: BoxedReader,
    pub(super) stdout: BoxedWriter,
    pub(super) stderr: BoxedWriter,
    pub(super) trigger: CollectTrigger,
    pub(super) requests: mpsc::Receiver<()>,
    pub(super) shutdown: CancellationToken,
}

/// Source-mode run loop
pub(super) async fn run(
    mut input: Box<dyn Input>,
    interval: Duration,
    session: Session,
) -> Result<(), ShimError> {
    let Session {
        stdin,
        mut stdout,
        mut stderr,
        trigger,
        mut requests,
        shutdown,
    } = session;

    // Helpers stop with the loop even when the caller's token stays live
    let helpers = shutdown.child_token();
    let stdin_closed = CancellationToken::new();
    let listener = signals::listen_for_collect_signals(trigger.clone(), helpers.clone());
    let watcher = tokio::spawn(watch_stdin(
        stdin,
        trigger,
        stdin_closed.clone(),
        helpers.clone(),
    ));

    let mut ticker = new_ticker(interval);
    info!("Input shim running, interval {:?}", interval);

    let result = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Input shim shutting down");
                break Ok(());
            }
            Some(()) = requests.recv() => debug!("Collect request received"),
            _ = next_tick(&mut ticker) => {}
            _ = stdin_closed.cancelled() => {
                info!("stdin closed, stopping collection");
                break Ok(());
            }
        }

        match collect_pass(input, &mut stdout, &mut stderr).await {
            Ok(returned) => input = returned,
            Err(e) => break Err(e),
        }
    };

    helpers.cancel();
    if let Err(e) = listener.await {
        warn!("Signal listener task failed: {}", e);
    }
    if let Err(e) = watcher.await {
        warn!("stdin watcher task failed: {}", e);
    }
    result
}

fn new_ticker(interval: Duration) -> Option<Interval> {
    if interval.is_zero() {
        return None;
    }
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Run one gather call on the blocking pool, writing each encoded line to
/// stdout as soon as the plugin produces it
///
/// Hands the plugin back once the pass has finished, so passes never overlap.
async fn collect_pass(
    input: Box<dyn Input>,
    stdout: &mut BoxedWriter,
    stderr: &mut BoxedWriter,
) -> Result<Box<dyn Input>, ShimError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pass = tokio::task::spawn_blocking(move || {
        let mut input = input;
        let mut acc = StreamingAccumulator::new(tx);
        let result = input.gather(&mut acc);
        (input, result)
    });

    while let Some(emitted) = rx.recv().await {
        match emitted {
            Emitted::Line(line) => {
                stdout.write_all(line.as_bytes()).await?;
                stdout.flush().await?;
            }
            Emitted::Error(e) => report_plugin_error(stderr, &e).await?,
        }
    }

    let (input, result) = pass
        .await
        .map_err(|e| ShimError::PluginTask(e.to_string()))?;
    if let Err(e) = result {
        report_plugin_error(stderr, &e).await?;
    }
    Ok(input)
}

/// Every line on stdin is an external wake, whatever its content; EOF marks
/// the end of the session
async fn watch_stdin(
    stdin: BoxedReader,
    trigger: CollectTrigger,
    closed: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut lines = LineReader::new(stdin);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(_)) => {
                    trigger.request();
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed reading stdin: {}", e);
                    break;
                }
            },
        }
    }
    closed.cancel();
}
