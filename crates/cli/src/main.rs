//! Chatline CLI — the main entry point.
//!
//! Commands:
//! - `chat`     — Interactive or single-message chat in a session
//! - `consume`  — Run the persistence consumer until Ctrl-C
//! - `sessions` — List (or delete) a user's sessions
//! - `history`  — Print a session's messages
//! - `config`   — Show, validate or generate configuration

use chatline_config::AppConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod runtime;
mod shutdown;

#[derive(Parser)]
#[command(
    name = "chatline",
    about = "Chatline — streaming chat backend with queued persistence",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.chatline/config.toml)
    #[arg(short, long, global = true, env = "CHATLINE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the assistant
    Chat {
        /// Continue an existing session instead of starting a new one
        #[arg(short, long)]
        session: Option<i64>,

        /// Owner of a newly created session
        #[arg(short, long, default_value_t = 1)]
        user: i64,

        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Persist queued messages until interrupted
    Consume,

    /// List a user's sessions
    Sessions {
        #[arg(short, long, default_value_t = 1)]
        user: i64,

        /// Delete this session (and its messages) instead of listing
        #[arg(long)]
        delete: Option<i64>,
    },

    /// Print the messages of a session
    History {
        session: i64,

        /// Only the newest N messages
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the default configuration as TOML
    Default,
    /// Print the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Print the config file path
    Path,
}

fn config_path(cli_path: Option<PathBuf>) -> PathBuf {
    cli_path.unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

fn init_tracing(verbose: bool, config: Option<&AppConfig>) {
    let level = match (verbose, config) {
        (true, _) => "debug".to_string(),
        (false, Some(c)) => c.logging.level.clone(),
        (false, None) => "info".to_string(),
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.is_some_and(|c| c.logging.json) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let path = config_path(cli.config);

    let command = match cli.command {
        // `config` must work even when the file is broken.
        Commands::Config { action } => {
            init_tracing(cli.verbose, None);
            return match action.unwrap_or(ConfigAction::Default) {
                ConfigAction::Default => commands::config_cmd::print_default(),
                ConfigAction::Show => commands::config_cmd::show(&path),
                ConfigAction::Validate => commands::config_cmd::validate(&path),
                ConfigAction::Path => commands::config_cmd::path(&path),
            };
        }
        other => other,
    };

    let config = AppConfig::load_with_env(&path).map_err(|e| format!("Failed to load config: {e}"))?;
    init_tracing(cli.verbose, Some(&config));

    match command {
        Commands::Chat {
            session,
            user,
            message,
        } => commands::chat::run(config, session, user, message).await?,
        Commands::Consume => commands::consume::run(config).await?,
        Commands::Sessions { user, delete } => commands::sessions::run(config, user, delete).await?,
        Commands::History { session, limit } => commands::history::run(config, session, limit).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
