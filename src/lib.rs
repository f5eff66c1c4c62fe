/// Error types for the supervisor, the shim and the codec
pub mod error;

/// Metric data model
pub mod metric;

/// Line protocol encoder and decoder
pub mod codec;

/// Plugin traits and built-in plugins
pub mod plugins;

/// Supervision of external commands
pub mod process;

/// Exposing one in-process plugin over standard streams
pub mod shim;

/// Host-side bridge to an external plugin process
pub mod execd;

/// Configuration management
pub mod config;

// Re-export commonly used types
pub use error::{CodecError, ConfigError, PluginError, ProcessError, ShimError};
pub use execd::Execd;
pub use metric::{FieldValue, Metric};
pub use process::ManagedProcess;
pub use shim::{CollectTrigger, Shim};
