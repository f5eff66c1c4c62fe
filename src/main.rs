use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use procshim::config::{Config, SupervisorConfig};
use procshim::plugins::{FileOutput, Heartbeat};
use procshim::{ManagedProcess, Shim};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    name = "procshim",
    about = "Run external plugins under supervision, or expose a built-in plugin over stdio",
    long_about = "Supervises an external command, restarting it when it exits and stopping it \
                  with SIGTERM then SIGKILL, or runs a built-in plugin as a line protocol shim \
                  on stdin/stdout."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        global = true,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command and keep it alive until interrupted
    Supervise {
        /// Delay before restarting an exited command, in milliseconds
        #[arg(long)]
        restart_delay_ms: Option<u64>,

        /// Time between SIGTERM and SIGKILL on stop, in milliseconds
        #[arg(long)]
        grace_period_ms: Option<u64>,

        /// Command and its arguments
        #[arg(
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            value_name = "COMMAND"
        )]
        command: Vec<String>,
    },

    /// Expose a built-in plugin over stdin/stdout
    Shim {
        /// Input plugin to run
        #[arg(long, value_enum)]
        input: Option<InputKind>,

        /// Output plugin to run
        #[arg(long, value_enum)]
        output: Option<OutputKind>,

        /// Target file for the file output
        #[arg(long, value_name = "FILE")]
        path: Option<PathBuf>,

        /// Collection interval in milliseconds, 0 collects on request only
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Value of the heartbeat's source tag
        #[arg(long, default_value = "procshim")]
        source: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum InputKind {
    Heartbeat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputKind {
    File,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        // Missing files fall back to defaults, directories do not
        if let Some(ref config_path) = self.config {
            if config_path.exists() && !config_path.is_file() {
                return Err(format!(
                    "Configuration path is not a file: {}",
                    config_path.display()
                ));
            }
        }

        if let Commands::Shim {
            input,
            output,
            path,
            ..
        } = &self.command
        {
            match (input, output) {
                (Some(_), Some(_)) => {
                    return Err("A shim runs exactly one plugin: pass --input or --output, not both"
                        .to_string())
                }
                (None, None) => return Err("Pass one of --input or --output".to_string()),
                (None, Some(OutputKind::File)) if path.is_none() => {
                    return Err("The file output requires --path".to_string())
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Apply command line overrides on top of file values
fn supervisor_settings(
    config: &Config,
    restart_delay_ms: Option<u64>,
    grace_period_ms: Option<u64>,
) -> Result<SupervisorConfig, String> {
    let mut merged = config.clone();
    if let Some(ms) = restart_delay_ms {
        merged.supervisor.restart_delay_ms = ms;
    }
    if let Some(ms) = grace_period_ms {
        merged.supervisor.grace_period_ms = ms;
    }
    merged.validate().map_err(|e| e.to_string())?;
    Ok(merged.supervisor)
}

async fn supervise(
    command: Vec<String>,
    settings: SupervisorConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut process = ManagedProcess::new(command)?
        .with_stdout_consumer(|line| println!("{}", line))
        .with_stderr_consumer(|line| warn!("child: {}", line))
        .with_restart_delay(settings.restart_delay())
        .with_grace_period(settings.grace_period());

    process
        .start()
        .await
        .with_context(|| format!("Failed to start {}", process.command().join(" ")))?;
    info!(
        "Supervising {}. Press Ctrl+C to stop.",
        process.command().join(" ")
    );

    tokio::select! {
        _ = shutdown.cancelled() => info!("Shutdown requested"),
        _ = process.wait_exited() => warn!("Supervise loop ended"),
    }

    process.stop().await?;
    info!("Stopped after {} restarts", process.restarts());
    Ok(())
}

async fn shim(
    input: Option<InputKind>,
    output: Option<OutputKind>,
    path: Option<PathBuf>,
    source: String,
    interval: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut shim = Shim::new();
    match (input, output, path) {
        (Some(InputKind::Heartbeat), None, _) => shim.add_input(Box::new(Heartbeat::new(source)))?,
        (None, Some(OutputKind::File), Some(path)) => {
            shim.add_output(Box::new(FileOutput::new(path)))?
        }
        _ => bail!("Invalid plugin selection"),
    }

    let session = shim.shutdown_token();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        session.cancel();
    });

    shim.run(interval).await?;
    Ok(())
}

async fn run(command: Commands, config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        interrupt.cancel();
    })
    .context("Error setting SIGINT handler for graceful shutdown")?;

    match command {
        Commands::Supervise {
            restart_delay_ms,
            grace_period_ms,
            command,
        } => {
            let settings = supervisor_settings(&config, restart_delay_ms, grace_period_ms)
                .map_err(anyhow::Error::msg)?;
            supervise(command, settings, shutdown).await
        }
        Commands::Shim {
            input,
            output,
            path,
            interval_ms,
            source,
        } => {
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.shim.interval());
            shim(input, output, path, source, interval, shutdown).await
        }
    }
}

fn main() {
    // Parse command-line arguments
    let cli = Cli::parse();

    // Initialize logging based on verbosity; env_logger writes to stderr,
    // which keeps stdout free for the line protocol
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(run(cli.command, config));
    // A blocking stdin read can outlive the session
    runtime.shutdown_background();

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
