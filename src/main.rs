use anyhow::Result;
use clap::{Parser, Subcommand};
use promptopt::config::Config;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;

/// Environment variable holding the log filter directive.
const LOG_ENV: &str = "PROMPTOPT_LOG";

#[derive(Parser)]
#[command(name = "popt")]
#[command(about = "Prompt optimization engines with an LLM judge")]
#[command(version)]
struct Cli {
    /// Path to a config file (default: .promptopt/config.toml, then ~/.config/promptopt/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging unless PROMPTOPT_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Output as JSON for machine consumption
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available optimization engines
    Engines,

    /// Run an engine against the configured seed prompt and test bench
    Run {
        /// Engine name (iterative, induction, evolutionary, context-filter)
        #[arg(long, short)]
        engine: String,

        /// Maximum number of steps (default: run.max_steps from config)
        #[arg(long)]
        steps: Option<u32>,

        /// Where to write the session (default: .promptopt/sessions/<id>.json)
        #[arg(long, short)]
        out: Option<PathBuf>,
    },

    /// Show a saved session: ranked candidates and trajectory
    Show {
        /// Session file
        file: PathBuf,
    },

    /// Apply or clear a human score override in a saved session
    Override {
        /// Session file
        file: PathBuf,

        /// Candidate ID
        id: String,

        /// Score (0-100)
        score: Option<f64>,

        /// Why the score was overridden
        #[arg(long)]
        reason: Option<String>,

        /// Remove the override instead of setting one
        #[arg(long)]
        clear: bool,
    },

    /// Check connectivity and credentials against the gateway
    Health,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(explicit: Option<&std::path::Path>) -> Result<Config> {
    let (config, path) = Config::resolve(explicit)?;
    match path {
        Some(path) => debug!(path = %path.display(), "loaded config"),
        None => debug!("no config file found, using defaults"),
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Engines => commands::engines::run(cli.json),
        Commands::Show { file } => commands::show::run(&file, cli.json),
        Commands::Override {
            file,
            id,
            score,
            reason,
            clear,
        } => commands::override_cmd::run(&file, &id, score, reason.as_deref(), clear),
        Commands::Run { engine, steps, out } => {
            let config = load_config(cli.config.as_deref())?;
            commands::run::run(&config, &engine, steps, out.as_deref(), cli.json)
        }
        Commands::Health => {
            let config = load_config(cli.config.as_deref())?;
            commands::health::run(&config)
        }
    }
}
