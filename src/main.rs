use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;
use pathpilot::commands::{
    approval_for, ask, build_index, run_session, search_paths, show_index_status, update_index,
};
use pathpilot::config::{Config, get_config_dir, run_interactive_config, show_config};
use pathpilot::{PilotError, Result};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pathpilot")]
#[command(about = "Turn natural-language requests into safe filesystem actions")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml and the index (default: ~/.pathpilot)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure models, indexed directories and confirmation
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Manage the path index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Show the indexed paths closest to a query
    Search {
        query: String,
        /// Number of results (default: index.top_k)
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Handle a single request
    Ask {
        request: String,
        /// Execute without asking for confirmation
        #[arg(long, conflicts_with = "dry_run")]
        yes: bool,
        /// Show the synthesized action without executing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Start an interactive session (default)
    Run {
        /// Execute without asking for confirmation
        #[arg(long, conflicts_with = "dry_run")]
        yes: bool,
        /// Show synthesized actions without executing them
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Scan the configured directories and rebuild the index
    Build,
    /// Index paths added since the last build
    Update,
    /// Show the persisted index
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            eprintln!("{} {}", style("Error:").red().bold(), e.user_message());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => get_config_dir()?,
    };

    let command = cli.command.unwrap_or(Commands::Run {
        yes: false,
        dry_run: false,
    });

    if let Commands::Config { show } = command {
        if show {
            show_config(&config_dir)?;
        } else {
            run_interactive_config(&config_dir)?;
        }
        return Ok(());
    }

    let config = Config::load(&config_dir).map_err(PilotError::Other)?;

    match command {
        Commands::Config { .. } => {}
        Commands::Index { action } => match action {
            IndexAction::Build => build_index(&config)?,
            IndexAction::Update => update_index(&config)?,
            IndexAction::Status => show_index_status(&config)?,
        },
        Commands::Search { query, k } => search_paths(&config, &query, k)?,
        Commands::Ask {
            request,
            yes,
            dry_run,
        } => {
            config.require_credentials()?;
            ask(&config, request, approval_for(&config, yes, dry_run)).await?;
        }
        Commands::Run { yes, dry_run } => {
            config.require_credentials()?;
            run_session(&config, approval_for(&config, yes, dry_run)).await?;
        }
    }

    Ok(())
}
