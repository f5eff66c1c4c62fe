//! Plugin contracts the shim hosts, plus two small built-in plugins
//!
//! Plugin calls are synchronous. The shim runs input collection passes on the
//! blocking pool, so a slow `gather` never stalls the run loop's timers.

use crate::error::PluginError;
use crate::metric::{Fields, Metric, Tags, Timestamp};

/// Heartbeat input that counts collection passes
pub mod heartbeat;

/// Output that appends wire lines to a file
pub mod file;

pub use file::FileOutput;
pub use heartbeat::Heartbeat;

/// Sink for the data points an input produces during one collection pass
pub trait Accumulator {
    /// Add a data point; `None` stamps it with the current time
    fn add_fields(
        &mut self,
        measurement: &str,
        fields: Fields,
        tags: Tags,
        timestamp: Option<Timestamp>,
    );

    /// Add an already-built metric
    fn add_metric(&mut self, metric: Metric);

    /// Report a non-fatal error that happened during collection
    fn add_error(&mut self, error: PluginError);
}

/// Data source plugin
pub trait Input: Send {
    /// Optional initialization hook, invoked once at registration
    fn init(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Run one collection pass, handing every data point to `acc`
    fn gather(&mut self, acc: &mut dyn Accumulator) -> Result<(), PluginError>;
}

/// Data sink plugin
#[cfg_attr(test, mockall::automock)]
pub trait Output: Send {
    /// Optional initialization hook, invoked once at registration
    fn init(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn connect(&mut self) -> Result<(), PluginError>;

    fn write(&mut self, metrics: &[Metric]) -> Result<(), PluginError>;

    fn close(&mut self) -> Result<(), PluginError>;
}

/// Stream transformer plugin: one metric in, zero or more out
pub trait Processor: Send {
    /// Optional initialization hook, invoked once at registration
    fn init(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn apply(&mut self, metric: Metric) -> Vec<Metric>;
}
