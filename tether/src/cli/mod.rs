//! Command line entry point of the `tether` controller.
//!
//! # Examples
//!
//! ```bash
//! # Run the controller against the current kubeconfig context
//! tether
//!
//! # Run with debug logging and a one minute resync
//! tether --log-level debug run --resync-interval 60
//!
//! # Print the default configuration
//! tether default-config > ~/.config/tether/config.yaml
//! ```

pub mod error;
mod run;

use std::{io::Write, path::PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use snafu::ResultExt;
use tether_base::CLI_PROGRAM_NAME;
use tokio::runtime::Runtime;

pub use self::error::Error;
use self::run::RunCommand;
use crate::{config::Config, shadow};

#[derive(Parser)]
#[command(
    name = CLI_PROGRAM_NAME,
    author,
    version,
    long_version = shadow::CLAP_LONG_VERSION,
    about = "Tether: binds Kubernetes services to workloads through synthetic selector labels.",
    long_about = "Tether watches services annotated with target workloads, labels the pods \
                  of those workloads with a per-service label and keeps that label in the \
                  service selector. DNS-record services are re-reconciled whenever the \
                  endpoints they depend on change.",
    color = clap::ColorChoice::Always
)]
pub struct Cli {
    #[clap(subcommand)]
    commands: Option<Commands>,

    #[clap(
        long = "config",
        short = 'c',
        env = "TETHER_CONFIG_FILE_PATH",
        help = "Specify a configuration file. Defaults to ~/.config/tether/config.yaml or \
                TETHER_CONFIG_FILE_PATH env var."
    )]
    config_file: Option<PathBuf>,

    #[clap(
        long = "log-level",
        env = "TETHER_LOG_LEVEL",
        help = "Set the logging level (e.g., info, debug, trace)."
    )]
    log_level: Option<tracing::Level>,
}

#[derive(Clone, Subcommand)]
pub enum Commands {
    #[command(about = "Display client and server version information")]
    Version {
        #[clap(long = "client", help = "If true, shows client version only (no server required).")]
        client: bool,
    },

    #[command(about = "Generate shell completion script for the specified shell (bash, zsh, fish)")]
    Completions { shell: clap_complete::Shell },

    #[command(about = "Output the default configuration in YAML format")]
    DefaultConfig,

    /// Runs the controller until it receives SIGINT or SIGTERM.
    #[command(about = "Run the controller (default)")]
    Run(RunCommand),
}

impl Default for Cli {
    fn default() -> Self { Self::parse() }
}

impl Cli {
    /// Loads the configuration file, falling back to defaults when none
    /// exists in the default locations, and applies the `--log-level`
    /// override.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly given or discovered file cannot be
    /// read or parsed.
    fn load_config(&self) -> Result<Config, Error> {
        let mut config = match self.config_file.clone().or_else(Config::search_config_file_path) {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(log_level) = self.log_level {
            config.log.level = log_level;
        }

        Ok(config)
    }

    /// Dispatches the parsed command and returns the process exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded, the Kubernetes
    /// client or the Tokio runtime cannot be initialized, or the controller
    /// fails.
    pub fn run(self) -> Result<i32, Error> {
        let client_version = Self::command().get_version().unwrap_or_default().to_string();
        match self.commands {
            Some(Commands::Version { client }) if client => {
                let mut stdout = std::io::stdout();
                stdout
                    .write_all(Self::command().render_long_version().as_bytes())
                    .context(error::WriteStdoutSnafu)?;
                stdout
                    .write_all(format!("Client Version: {client_version}\n").as_bytes())
                    .context(error::WriteStdoutSnafu)?;
                return Ok(0);
            }
            Some(Commands::Completions { shell }) => {
                let mut app = Self::command();
                let bin_name = app.get_name().to_string();
                clap_complete::generate(shell, &mut app, bin_name, &mut std::io::stdout());
                return Ok(0);
            }
            Some(Commands::DefaultConfig) => {
                std::io::stdout()
                    .write_all(Config::template_basic()?.as_bytes())
                    .context(error::WriteStdoutSnafu)?;
                return Ok(0);
            }
            _ => {}
        }

        let config = self.load_config()?;
        config.log.registry();

        let fut = async move {
            let kube_client = kube::Client::try_default().await.context(error::KubeConfigSnafu)?;
            match self.commands {
                Some(Commands::Version { .. }) => {
                    let server_version = kube_client.apiserver_version().await.map_or_else(
                        |_| "unknown".to_string(),
                        |info| format!("{}.{}", info.major, info.minor),
                    );
                    let info = format!(
                        "Client Version: {client_version}\nServer Version: {server_version}\n",
                    );
                    let mut stdout = std::io::stdout();
                    stdout
                        .write_all(Self::command().render_long_version().as_bytes())
                        .context(error::WriteStdoutSnafu)?;
                    stdout.write_all(info.as_bytes()).context(error::WriteStdoutSnafu)?;
                }
                Some(Commands::Run(cmd)) => cmd.run(kube_client, config).await?,
                _ => RunCommand::default().run(kube_client, config).await?,
            }

            Ok(0)
        };

        Runtime::new().context(error::InitializeTokioRuntimeSnafu)?.block_on(fut)
    }
}
