//! # Parley CLI (`parley`)
//!
//! ## Usage
//!
//! ```bash
//! parley --config ./config/parley.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `parley init` | Create the SQLite database and run schema migrations |
//! | `parley serve` | Start the HTTP server |
//! | `parley analyze <file> --client-id <id>` | Analyze one transcript locally |
//! | `parley usage [--date YYYY-MM-DD]` | Show the token ledger |
//! | `parley get <id>` | Print a stored analysis as JSON |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use parley::analyze_cmd::{self, AnalyzeArgs};
use parley::report::ProgressMode;
use parley::{config, get, logging, migrate, server, usage};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley Lens: streaming manipulation and bias highlights for negotiation transcripts",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./config/parley.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and run migrations.
    Init,

    /// Start the HTTP server.
    Serve,

    /// Analyze a transcript (.txt, .md or .docx) and print the result as JSON.
    Analyze {
        file: PathBuf,

        #[arg(long)]
        client_id: String,

        /// Speaker to focus on; repeat for several.
        #[arg(long = "participant")]
        participants: Vec<String>,

        /// JSON file with profile context for the model.
        #[arg(long)]
        profile: Option<PathBuf>,

        /// Event rendering on stderr. Defaults to human on a TTY, otherwise off.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show token usage for today or a given day.
    Usage {
        #[arg(long)]
        date: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Print a stored analysis.
    Get { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Analyze {
            file,
            client_id,
            participants,
            profile,
            progress,
        } => {
            let args = AnalyzeArgs {
                file: &file,
                client_id: &client_id,
                participants,
                profile: profile.as_deref(),
                progress: progress.unwrap_or_else(ProgressMode::default_for_tty),
            };
            analyze_cmd::run_analyze(&cfg, args).await?;
        }
        Commands::Usage { date, json } => {
            usage::run_usage(&cfg, date.as_deref(), json).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &id).await?;
        }
    }

    Ok(())
}
