//! keel CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Declarative stack orchestration for a homelab cluster", long_about = None)]
struct Cli {
    /// Workspace settings file
    #[arg(long, env = "KEEL_WORKSPACE", default_value = "keel.kdl", global = true)]
    workspace: PathBuf,

    /// Keep state as JSON files in this directory
    #[arg(long, env = "KEEL_STATE_DIR", global = true, conflicts_with = "database_url")]
    state_dir: Option<PathBuf>,

    /// Keep state in PostgreSQL
    #[arg(long, env = "KEEL_DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
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
    /// Validate a stack definition
    Validate {
        /// Path to the stack definition
        stack: PathBuf,
    },
    /// Show the changes an apply would make
    Preview {
        stack: PathBuf,
        /// Compare recorded state with the cluster first
        #[arg(long)]
        refresh: bool,
    },
    /// Apply a stack
    Up {
        stack: PathBuf,
        /// Apply without asking, including pending drift
        #[arg(short, long)]
        yes: bool,
        /// Compare recorded state with the cluster first
        #[arg(long)]
        refresh: bool,
        /// Maximum concurrent applies
        #[arg(long)]
        parallel: Option<usize>,
    },
    /// Delete every resource of a stack
    Destroy {
        stack: PathBuf,
        #[arg(short, long)]
        yes: bool,
    },
    /// Re-read resources and report drift
    Refresh { stack: PathBuf },
    /// Show the published outputs of a stack
    Outputs {
        /// Stack name
        stack: String,
        /// Print secret outputs in plaintext
        #[arg(long)]
        show_secrets: bool,
    },
    /// Inspect and repair recorded state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Prepare bare-metal hosts
    Bootstrap {
        /// Path to the bootstrap plan
        plan: PathBuf,
        /// Run every step on this machine instead of the plan's hosts
        #[arg(long)]
        local: bool,
        /// Only bootstrap the named host
        #[arg(long)]
        host: Option<String>,
        /// Config store supplying `${config.*}` and `${secret.*}` values
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// List stacks with recorded state
    List,
    /// Break the lock left by an interrupted run
    Unlock {
        /// Stack name
        stack: String,
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

    let backend = commands::BackendOverride {
        state_dir: cli.state_dir,
        database_url: cli.database_url,
    };

    match cli.command {
        Commands::Validate { stack } => {
            commands::validate(&stack)?;
        }
        Commands::Preview { stack, refresh } => {
            commands::stack::preview(&cli.workspace, &backend, &stack, refresh).await?;
        }
        Commands::Up {
            stack,
            yes,
            refresh,
            parallel,
        } => {
            commands::stack::up(&cli.workspace, &backend, &stack, yes, refresh, parallel).await?;
        }
        Commands::Destroy { stack, yes } => {
            commands::stack::destroy(&cli.workspace, &backend, &stack, yes).await?;
        }
        Commands::Refresh { stack } => {
            commands::stack::refresh(&cli.workspace, &backend, &stack).await?;
        }
        Commands::Outputs {
            stack,
            show_secrets,
        } => {
            commands::stack::outputs(&cli.workspace, &backend, &stack, show_secrets).await?;
        }
        Commands::State { command } => match command {
            StateCommands::List => {
                commands::state::list(&cli.workspace, &backend).await?;
            }
            StateCommands::Unlock { stack } => {
                commands::state::unlock(&cli.workspace, &backend, &stack).await?;
            }
        },
        Commands::Bootstrap {
            plan,
            local,
            host,
            config,
        } => {
            commands::bootstrap::run(&plan, local, host.as_deref(), config.as_deref()).await?;
        }
    }

    Ok(())
}
