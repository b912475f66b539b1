//! # Main: CLI Entry Point
//!
//! ## Subcommands
//!
//! - `serve`: run migrations and start the HTTP/WebSocket server.
//! - `migrate`: apply pending migrations and exit.
//! - `create-admin`: create an ACTIVE admin account.
//! - `tariffs`: print the effective tariff table.
//!
//! ## Global Options
//!
//! - `--database-url` / `DATABASE_URL`: PostgreSQL connection.
//! - `LOG_FORMAT=json` switches logs to JSON lines; `RUST_LOG` sets the filter.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use svmontaj::config::ConfigArgs;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "svmontaj", about = "Installation services marketplace backend")]
struct Cli {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value_t = 5000)]
        port: u16,
        /// Directory to serve static files from (prebuilt frontend)
        #[arg(long)]
        static_dir: Option<PathBuf>,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Apply database migrations and exit
    Migrate,
    /// Create an administrator account
    CreateAdmin {
        /// Phone number, any common Russian format
        #[arg(long)]
        phone: String,
        #[arg(long, env = "ADMIN_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long, default_value = "Администратор")]
        name: String,
    },
    /// Print the tariff table
    Tariffs {
        /// TOML file overriding the built-in tariff table
        #[arg(long, env = "TARIFFS_FILE")]
        tariffs_file: Option<PathBuf>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // LOG_FORMAT=json for log shippers, human-readable otherwise
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Serve {
            port,
            static_dir,
            config,
        } => cli::run_serve(&cli, *port, static_dir.as_deref(), config),
        Commands::Migrate => cli::run_migrate(&cli),
        Commands::CreateAdmin {
            phone,
            password,
            name,
        } => cli::run_create_admin(&cli, phone, password, name),
        Commands::Tariffs { tariffs_file, json } => {
            cli::run_tariffs(tariffs_file.as_deref(), *json)
        }
    }
}
