use thiserror::Error;

/// Errors raised by the process supervisor
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Empty command: nothing to execute")]
    EmptyCommand,

    #[error("Error opening {0} pipe")]
    Pipe(&'static str),

    #[error("Error starting process {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process is already running")]
    AlreadyStarted,

    #[error("Process is not running")]
    NotRunning,

    #[error("Supervise loop panicked")]
    LoopPanicked,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors returned by plugin implementations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    #[error("Failed to initialize plugin: {0}")]
    Init(String),

    #[error("Failed to gather metrics: {0}")]
    Gather(String),

    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Failed to write metrics: {0}")]
    Write(String),

    #[error("Failed to close: {0}")]
    Close(String),

    #[error("Invalid metric: {0}")]
    InvalidMetric(String),
}

/// Errors produced while decoding a wire line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty line")]
    EmptyLine,

    #[error("Missing measurement name")]
    MissingMeasurement,

    #[error("Missing fields")]
    MissingFields,

    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Unexpected trailing data: {0}")]
    TrailingData(String),

    #[error("Invalid metric: {0}")]
    InvalidMetric(String),
}

/// Errors that can occur while running a shim session
#[derive(Error, Debug)]
pub enum ShimError {
    #[error("No plugin registered")]
    NoPlugin,

    #[error("A plugin is already registered ({0})")]
    PluginAlreadyRegistered(&'static str),

    #[error("Failed to init plugin: {0}")]
    Init(#[source] PluginError),

    #[error("Failed to connect output: {0}")]
    Connect(#[source] PluginError),

    #[error("Plugin task failed: {0}")]
    PluginTask(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
