use crate::codec;
use crate::error::PluginError;
use crate::metric::{Fields, Metric, Tags, Timestamp};
use crate::plugins::Accumulator;
use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;

/// What a collection pass hands back to the run loop
#[derive(Debug)]
pub(crate) enum Emitted {
    /// One encoded, newline-terminated wire line
    Line(String),
    Error(PluginError),
}

/// Accumulator encoding every point the moment it is added
///
/// Lives on the blocking thread running `gather`; the run loop receives the
/// encoded lines while the pass is still in progress.
pub(crate) struct StreamingAccumulator {
    tx: UnboundedSender<Emitted>,
}

impl StreamingAccumulator {
    pub(crate) fn new(tx: UnboundedSender<Emitted>) -> Self {
        Self { tx }
    }

    fn emit(&self, emitted: Emitted) {
        // The receiver only disappears if the run loop failed writing stdout
        let _ = self.tx.send(emitted);
    }
}

impl Accumulator for StreamingAccumulator {
    fn add_fields(
        &mut self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<Timestamp>,
    ) {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        match Metric::new(measurement, tags, fields, timestamp) {
            Ok(metric) => self.add_metric(metric),
            Err(e) => self.add_error(e),
        }
    }

    fn add_metric(&mut self, metric: Metric) {
        self.emit(Emitted::Line(codec::encode(&metric)));
    }

    fn add_error(&mut self, error: PluginError) {
        self.emit(Emitted::Error(error));
    }
}
