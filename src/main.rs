//! openplant - Command-line client for the OpenPlant real-time database
//!
//! Provides both a SQL REPL and one-shot command execution. Results are
//! printed as JSON lines.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use openplant_client::{Client, ClientConfig};
use openplant_protocol::CompressMode;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "openplant")]
#[command(about = "Command-line client for the OpenPlant real-time database")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "OPENPLANT_CONFIG")]
    config: Option<PathBuf>,

    /// Server host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// User name
    #[arg(short, long)]
    user: Option<String>,

    /// Password
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// Outbound compression (raw, lz4-frame, lz4-block)
    #[arg(long)]
    compress: Option<CompressMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive SQL shell
    Repl,

    /// Check the connection with a heartbeat
    Ping,

    /// Run a SQL statement
    Sql {
        /// Statement text
        query: String,
    },

    /// Read realtime values
    Read {
        /// Point ids, comma separated
        #[arg(value_delimiter = ',', required = true)]
        ids: Vec<i32>,
    },

    /// Write a realtime value
    Write {
        /// Point id
        id: i32,

        /// Value
        value: f64,

        /// Status word
        #[arg(short, long, default_value = "0")]
        status: i16,

        /// Timestamp (defaults to now)
        #[arg(short, long)]
        time: Option<String>,
    },

    /// Read archived values
    Archive {
        /// Point ids, comma separated
        #[arg(value_delimiter = ',', required = true)]
        ids: Vec<i32>,

        /// Range start (timestamp or relative, e.g. -1h)
        #[arg(short, long, default_value = "-1h")]
        begin: String,

        /// Range end (timestamp or relative)
        #[arg(short, long, default_value = "now")]
        end: String,

        /// Sampling mode
        #[arg(short, long, default_value = "raw")]
        mode: String,

        /// Sampling interval in seconds
        #[arg(short, long, default_value = "0")]
        interval: i64,
    },

    /// Read interval statistics
    Stat {
        /// Point ids, comma separated
        #[arg(value_delimiter = ',', required = true)]
        ids: Vec<i32>,

        /// Range start (timestamp or relative, e.g. -1h)
        #[arg(short, long, default_value = "-1h")]
        begin: String,

        /// Range end (timestamp or relative)
        #[arg(short, long, default_value = "now")]
        end: String,

        /// Aggregation interval in seconds
        #[arg(short, long, default_value = "60")]
        interval: i64,
    },

    /// Stream realtime changes until Ctrl+C
    Subscribe {
        /// Point ids, comma separated
        #[arg(value_delimiter = ',', required = true)]
        ids: Vec<i32>,

        /// Skip the initial snapshot
        #[arg(long)]
        no_snapshot: bool,
    },
}

impl Commands {
    /// Subcommand name for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Repl => "repl",
            Commands::Ping => "ping",
            Commands::Sql { .. } => "sql",
            Commands::Read { .. } => "read",
            Commands::Write { .. } => "write",
            Commands::Archive { .. } => "archive",
            Commands::Stat { .. } => "stat",
            Commands::Subscribe { .. } => "subscribe",
        }
    }
}

impl Cli {
    /// Loads the configuration and applies command-line overrides.
    fn client_config(&self) -> Result<ClientConfig, Box<dyn std::error::Error>> {
        let mut config = ClientConfig::load(self.config.as_deref())?;
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(mode) = self.compress {
            config.compress = mode;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.client_config().map_err(|e| {
        eprintln!("{}: {}", "Configuration error".red(), e);
        e
    })?;

    let addr = format!("{}:{}", config.host, config.port);
    tracing::debug!(%addr, user = %config.user, compress = ?config.compress, "connecting");
    let client = Client::from_config(&config).await.map_err(|e| {
        eprintln!("{} to {}: {}", "Connection failed".red(), addr, e);
        e
    })?;

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, &addr).await?;
        }
        Some(Commands::Subscribe { ids, no_snapshot }) => {
            commands::stream_subscription(&client, &config, &ids, !no_snapshot).await?;
            client.close().await?;
        }
        Some(cmd) => {
            let result = commands::execute(&client, cmd).await;
            match result {
                Ok(output) => {
                    if !output.is_empty() {
                        println!("{}", output);
                    }
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
            client.close().await?;
        }
    }

    Ok(())
}
