//! pullci CLI.

use clap::{Parser, Subcommand, ValueEnum};
use pullci_core::TestMethod;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "pullci")]
#[command(about = "Pull request CI pipeline", long_about = None)]
struct Cli {
    /// Deployment configuration file
    #[arg(
        long,
        short,
        global = true,
        env = "PULLCI_CONFIG",
        default_value = "pullci.kdl"
    )]
    config: PathBuf,

    /// Redis URL, overriding the configuration file
    #[arg(long, global = true, env = "PULLCI_REDIS_URL")]
    redis_url: Option<String>,

    /// NATS URL, overriding the configuration file
    #[arg(long, global = true, env = "PULLCI_NATS_URL")]
    nats_url: Option<String>,

    /// Log output format
    #[arg(
        long,
        global = true,
        value_enum,
        env = "PULLCI_LOG_FORMAT",
        default_value = "text"
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume builds from the queue and run them
    Worker {
        /// Test method this worker builds (binary, test, test-integration, cross)
        #[arg(long, env = "PULLCI_METHOD")]
        method: Option<TestMethod>,
        /// Builds to run at once
        #[arg(long, env = "PULLCI_CONCURRENCY")]
        concurrency: Option<usize>,
        /// Name used in logs; defaults to the method and process id
        #[arg(long, env = "PULLCI_WORKER_ID")]
        id: Option<String>,
    },
    /// Admit a pull request event and enqueue its build
    Admit {
        /// Event JSON file; reads stdin when omitted or `-`
        path: Option<PathBuf>,
    },
    /// Enqueue a pending commit's saved event again
    Retry {
        /// Repository (owner/name)
        repository: String,
        /// Head commit
        sha: String,
    },
    /// Show the state and results of a commit
    Status {
        /// Repository (owner/name)
        repository: String,
        /// Head commit
        sha: String,
        /// Print the full build output
        #[arg(long)]
        output: bool,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a deployment configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "pullci.kdl")]
        path: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let overrides = commands::Overrides {
        redis_url: cli.redis_url,
        nats_url: cli.nats_url,
    };

    match cli.command {
        Commands::Worker {
            method,
            concurrency,
            id,
        } => {
            let mut config = commands::load_config(&cli.config, &overrides)?;
            if let Some(method) = method {
                config.worker.method = method;
            }
            if let Some(concurrency) = concurrency {
                config.worker.concurrency = concurrency;
            }
            config.validate()?;
            commands::worker::run(&config, id).await?;
        }
        Commands::Admit { path } => {
            let config = commands::load_config(&cli.config, &overrides)?;
            commands::admit::admit(&config, path.as_deref()).await?;
        }
        Commands::Retry { repository, sha } => {
            let config = commands::load_config(&cli.config, &overrides)?;
            commands::admit::retry(&config, &repository, &sha).await?;
        }
        Commands::Status {
            repository,
            sha,
            output,
            json,
        } => {
            let config = commands::load_config(&cli.config, &overrides)?;
            commands::status::show(&config, &repository, &sha, output, json).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
