use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use mlwio_catalog::{
    catalog::CatalogStore,
    config::{DEFAULT_CONFIG_PATH, load_server_config_from},
};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Maintenance tasks for the MLWIO catalog.")]
struct Args {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the env file")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a user that can log in to the admin panel.
    AddUser {
        username: String,
        #[arg(long, env = "MLWIO_NEW_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Rewrite stored absolute Alist URLs into bare paths.
    FixAlistPaths,
    /// Show the most recent uploads.
    Uploads {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = load_server_config_from(&args.config, std::env::vars())?;
    let store = CatalogStore::open(&config.database_path)?;

    match args.command {
        Command::AddUser { username, password } => {
            if password.is_empty() {
                bail!("password must not be empty");
            }
            if !store.ensure_user(&username, &password)? {
                bail!("user {username:?} already exists");
            }
            info!(%username, "user created");
        }
        Command::FixAlistPaths => {
            let report = store.fix_alist_paths(&config.alist.host_markers)?;
            for error in &report.errors {
                eprintln!("error: {error}");
            }
            println!("rewrote {} link(s)", report.updated);
        }
        Command::Uploads { limit } => {
            for entry in store.list_uploads(limit)? {
                println!("{}  {}", entry.uploaded_at.to_rfc3339(), entry.content_title);
            }
        }
    }

    Ok(())
}
