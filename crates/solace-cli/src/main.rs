//! Solace CLI - offline-first wellness journal from the terminal

mod auth;
mod cli;
mod commands;
mod error;


use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::add::run_add;
use crate::commands::auth_cmd::run_auth;
use crate::commands::common::App;
use crate::commands::completions::run_completions;
use crate::commands::delete::run_delete;
use crate::commands::edit::run_edit;
use crate::commands::list::run_list;
use crate::commands::queue::run_queue;
use crate::commands::sync::run_sync;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("solace=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let app = App::open(cli.config, cli.db_path).await?;
    match cli.command {
        Commands::Auth { command } => run_auth(&app, command).await,
        Commands::Add {
            content,
            ratings,
            lists,
        } => run_add(&app, &content, ratings, lists).await,
        Commands::Edit {
            id,
            content,
            ratings,
        } => run_edit(&app, &id, &content, ratings).await,
        Commands::Delete { id } => run_delete(&app, &id).await,
        Commands::List {
            refresh,
            limit,
            json,
        } => run_list(&app, refresh, limit, json).await,
        Commands::Sync => run_sync(&app).await,
        Commands::Queue { command } => run_queue(&app, command).await,
        Commands::Completions { .. } => Ok(()),
    }
}
