use super::{report, BoxedReader, BoxedWriter, LineReader};
use crate::codec;
use crate::error::{PluginError, ShimError};
use crate::metric::Metric;
use crate::plugins::Output;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

/// Closes the wrapped output when dropped, whichever way the loop ended
struct CloseGuard {
    output: Option<Box<dyn Output>>,
}

impl CloseGuard {
    /// Write one metric on the blocking pool so a slow sink never stalls the runtime
    async fn write(&mut self, metric: Metric) -> Result<Result<(), PluginError>, ShimError> {
        let mut output = self
            .output
            .take()
            .ok_or_else(|| ShimError::PluginTask("output was lost by an earlier write".to_string()))?;
        let (output, result) = tokio::task::spawn_blocking(move || {
            let result = output.write(std::slice::from_ref(&metric));
            (output, result)
        })
        .await
        .map_err(|e| ShimError::PluginTask(e.to_string()))?;
        self.output = Some(output);
        Ok(result)
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let Some(mut output) = self.output.take() else {
            return;
        };
        match output.close() {
            Ok(()) => debug!("Output closed"),
            Err(e) => error!("Failed to close output: {}", e),
        }
    }
}

/// Sink-mode run loop: every stdin line becomes one single-metric write
pub(super) async fn run(
    mut output: Box<dyn Output>,
    stdin: BoxedReader,
    mut stderr: BoxedWriter,
    shutdown: CancellationToken,
) -> Result<(), ShimError> {
    output.connect().map_err(ShimError::Connect)?;
    let mut output = CloseGuard {
        output: Some(output),
    };
    info!("Output shim connected, reading metrics from stdin");

    let mut lines = LineReader::new(stdin);
    let mut written = 0u64;
    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Output shim shutting down");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("stdin closed after {} metrics", written);
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let metric = match codec::decode(&line) {
            Ok(metric) => metric,
            Err(e) => {
                report(&mut stderr, &format!("Failed to parse metric: {}", e)).await?;
                continue;
            }
        };

        match output.write(metric).await? {
            Ok(()) => written += 1,
            Err(e) => report(&mut stderr, &format!("Failed to write metric: {}", e)).await?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::Shim;
    use crate::error::{PluginError, ShimError};
    use crate::metric::Metric;
    use crate::plugins::{MockOutput, Output};
    use mockall::Sequence;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_output_shim_writes_valid_lines_and_closes_once() {
        let stdin: &'static [u8] = b"cpu value=1i 1\n\
            not a metric\n\
            cpu value=2i 2\n\
            \n\
            cpu,host=a value=3i 3\n\
            mem\n";

        let mut output = MockOutput::new();
        output.expect_init().returning(|| Ok(()));
        output.expect_connect().times(1).returning(|| Ok(()));
        output
            .expect_write()
            .withf(|metrics| metrics.len() == 1 && metrics[0].name() == "cpu")
            .times(3)
            .returning(|_| Ok(()));
        output.expect_close().times(1).returning(|| Ok(()));

        let (stderr, mut stderr_reader) = tokio::io::duplex(4096);
        let mut shim = Shim::with_io(stdin, tokio::io::sink(), stderr);
        shim.add_output(Box::new(output)).unwrap();
        shim.run(Duration::ZERO).await.unwrap();

        let mut diagnostics = String::new();
        stderr_reader.read_to_string(&mut diagnostics).await.unwrap();
        assert_eq!(diagnostics.matches("Failed to parse metric").count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_line_between_valid_lines_is_skipped() {
        let stdin: &'static [u8] = b"first value=1i 1\n===\nsecond value=2i 2\n";

        let mut seq = Sequence::new();
        let mut output = MockOutput::new();
        output.expect_init().returning(|| Ok(()));
        output.expect_connect().returning(|| Ok(()));
        output
            .expect_write()
            .withf(|metrics| metrics[0].name() == "first")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        output
            .expect_write()
            .withf(|metrics| metrics[0].name() == "second")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        output.expect_close().times(1).returning(|| Ok(()));

        let mut shim = Shim::with_io(stdin, tokio::io::sink(), tokio::io::sink());
        shim.add_output(Box::new(output)).unwrap();
        shim.run(Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_is_reported_and_loop_continues() {
        let stdin: &'static [u8] = b"cpu value=1i 1\ncpu value=2i 2\n";

        let mut output = MockOutput::new();
        output.expect_init().returning(|| Ok(()));
        output.expect_connect().returning(|| Ok(()));
        output
            .expect_write()
            .times(2)
            .returning(|_| Err(PluginError::Write("broken pipe".to_string())));
        output.expect_close().times(1).returning(|| Ok(()));

        let (stderr, mut stderr_reader) = tokio::io::duplex(4096);
        let mut shim = Shim::with_io(stdin, tokio::io::sink(), stderr);
        shim.add_output(Box::new(output)).unwrap();
        shim.run(Duration::ZERO).await.unwrap();

        let mut diagnostics = String::new();
        stderr_reader.read_to_string(&mut diagnostics).await.unwrap();
        assert_eq!(
            diagnostics,
            "Failed to write metric: Failed to write metrics: broken pipe\n\
             Failed to write metric: Failed to write metrics: broken pipe\n"
        );
    }

    #[tokio::test]
    async fn test_connect_failure_consumes_nothing() {
        let stdin: &'static [u8] = b"cpu value=1i 1\n";

        let mut output = MockOutput::new();
        output.expect_init().returning(|| Ok(()));
        output
            .expect_connect()
            .times(1)
            .returning(|| Err(PluginError::Connect("refused".to_string())));
        output.expect_write().never();
        output.expect_close().never();

        let mut shim = Shim::with_io(stdin, tokio::io::sink(), tokio::io::sink());
        shim.add_output(Box::new(output)).unwrap();

        let result = shim.run(Duration::ZERO).await;
        assert!(matches!(result, Err(ShimError::Connect(_))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_output_while_stdin_is_open() {
        let (mut stdin_writer, stdin) = tokio::io::duplex(64);

        let mut output = MockOutput::new();
        output.expect_init().returning(|| Ok(()));
        output.expect_connect().returning(|| Ok(()));
        output.expect_write().times(1).returning(|_| Ok(()));
        output.expect_close().times(1).returning(|| Ok(()));

        let mut shim = Shim::with_io(stdin, tokio::io::sink(), tokio::io::sink());
        shim.add_output(Box::new(output)).unwrap();
        let shutdown = shim.shutdown_token();
        let run = tokio::spawn(shim.run(Duration::ZERO));

        stdin_writer.write_all(b"cpu value=1i 1\n").await.unwrap();
        // Give the loop a moment to forward the line before cancelling
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        assert!(run.await.unwrap().is_ok());
        drop(stdin_writer);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped() {
        let stdin: &'static [u8] = b"cpu value=1i 1\n\xff\xfe bad\ncpu value=2i 2\n";

        let mut output = MockOutput::new();
        output.expect_init().returning(|| Ok(()));
        output.expect_connect().returning(|| Ok(()));
        output.expect_write().times(2).returning(|_| Ok(()));
        output.expect_close().times(1).returning(|| Ok(()));

        let (stderr, mut stderr_reader) = tokio::io::duplex(4096);
        let mut shim = Shim::with_io(stdin, tokio::io::sink(), stderr);
        shim.add_output(Box::new(output)).unwrap();
        shim.run(Duration::ZERO).await.unwrap();

        let mut diagnostics = String::new();
        stderr_reader.read_to_string(&mut diagnostics).await.unwrap();
        assert_eq!(diagnostics.matches("Failed to parse metric").count(), 1);
    }

    /// Output whose write blocks its thread, recording how far a runtime
    /// ticker advanced meanwhile
    struct SlowOutput {
        ticks: Arc<AtomicUsize>,
        ticks_during_write: Arc<AtomicUsize>,
    }

    impl Output for SlowOutput {
        fn connect(&mut self) -> Result<(), PluginError> {
            Ok(())
        }

        fn write(&mut self, _metrics: &[Metric]) -> Result<(), PluginError> {
            let before = self.ticks.load(Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            let after = self.ticks.load(Ordering::SeqCst);
            self.ticks_during_write.store(after - before, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_write_does_not_block_the_runtime() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_during_write = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let stdin: &'static [u8] = b"cpu value=1i 1\n";
        let mut shim = Shim::with_io(stdin, tokio::io::sink(), tokio::io::sink());
        shim.add_output(Box::new(SlowOutput {
            ticks,
            ticks_during_write: ticks_during_write.clone(),
        }))
        .unwrap();
        shim.run(Duration::ZERO).await.unwrap();
        ticker.abort();

        // The test runtime has a single thread, so ticks only advance if the
        // write ran elsewhere
        assert!(ticks_during_write.load(Ordering::SeqCst) >= 5);
    }
}
