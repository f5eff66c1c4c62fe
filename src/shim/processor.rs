use super::{report, BoxedReader, BoxedWriter, LineReader};
use crate::codec;
use crate::error::ShimError;
use crate::plugins::Processor;
use log::{debug, info};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Processor-mode run loop: decode, transform, re-encode
pub(super) async fn run(
    mut processor: Box<dyn Processor>,
    stdin: BoxedReader,
    mut stdout: BoxedWriter,
    mut stderr: BoxedWriter,
    shutdown: CancellationToken,
) -> Result<(), ShimError> {
    info!("Processor shim reading metrics from stdin");
    let mut lines = LineReader::new(stdin);
    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Processor shim shutting down");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("stdin closed");
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

        for processed in processor.apply(metric) {
            stdout.write_all(codec::encode(&processed).as_bytes()).await?;
        }
        stdout.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::Shim;
    use crate::metric::{FieldValue, Metric};
    use crate::plugins::Processor;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    /// Drops metrics named `drop`, duplicates the rest with a `copy` tag
    struct Duplicate;

    impl Processor for Duplicate {
        fn apply(&mut self, metric: Metric) -> Vec<Metric> {
            if metric.name() == "drop" {
                return Vec::new();
            }
            let mut tags = metric.tags().clone();
            tags.insert("copy".to_string(), "yes".to_string());
            let copy = Metric::from_nanos(
                metric.name(),
                tags,
                metric.fields().clone(),
                metric.timestamp_nanos(),
            )
            .unwrap();
            vec![metric, copy]
        }
    }

    #[tokio::test]
    async fn test_processor_shim_transforms_stream() {
        let stdin: &'static [u8] = b"cpu value=1i 10\ngarbage\ndrop value=2i 20\n";
        let (stdout, mut stdout_reader) = tokio::io::duplex(4096);
        let (stderr, mut stderr_reader) = tokio::io::duplex(4096);

        let mut shim = Shim::with_io(stdin, stdout, stderr);
        shim.add_processor(Box::new(Duplicate)).unwrap();
        shim.run(Duration::ZERO).await.unwrap();

        let mut out = String::new();
        stdout_reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "cpu value=1i 10\ncpu,copy=yes value=1i 10\n");

        let mut diagnostics = String::new();
        stderr_reader.read_to_string(&mut diagnostics).await.unwrap();
        assert!(diagnostics.starts_with("Failed to parse metric"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_end_stream() {
        let stdin: &'static [u8] = b"cpu value=1i 10\n\xff\xfe bad\nmem value=2i 20\n";
        let (stdout, mut stdout_reader) = tokio::io::duplex(4096);

        let mut shim = Shim::with_io(stdin, stdout, tokio::io::sink());
        shim.add_processor(Box::new(Duplicate)).unwrap();
        shim.run(Duration::ZERO).await.unwrap();

        let mut out = String::new();
        stdout_reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(
            out,
            "cpu value=1i 10\ncpu,copy=yes value=1i 10\nmem value=2i 20\nmem,copy=yes value=2i 20\n"
        );
    }

    #[test]
    fn test_duplicate_keeps_fields() {
        let mut fields = crate::metric::Fields::new();
        fields.insert("v".to_string(), FieldValue::Boolean(true));
        let metric = Metric::from_nanos("m", Default::default(), fields, 1).unwrap();

        let out = Duplicate.apply(metric);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].fields().get("v"), Some(&FieldValue::Boolean(true)));
    }
}
