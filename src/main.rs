/// argosy: DAG workflow engine
///
/// Main entry point. `argosy server` runs the engine and HTTP API; every other
/// subcommand is a thin client over that API.

use anyhow::Result;
use argosy::{config::Config, server::start_server};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod client;
mod commands;

use commands::{archive::ArchiveCommand, cron::CronCommand, Context};

/// argosy - DAG workflow engine with cron triggers and a workflow archive
#[derive(Parser)]
#[command(name = "argosy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Server URL
    #[arg(long, global = true, env = "ARGOSY_SERVER")]
    pub server: Option<String>,

    /// Namespace to operate in
    #[arg(short, long, global = true, env = "ARGOSY_NAMESPACE")]
    pub namespace: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine and HTTP API
    Server,

    /// Submit a workflow manifest (JSON or YAML)
    Submit {
        file: PathBuf,
        /// Wait for the workflow to complete
        #[arg(long)]
        wait: bool,
    },

    /// Show a workflow and its nodes
    Get { name: String },

    /// Delete a workflow
    Delete { name: String },

    /// Stop a workflow; the exit handler still runs
    Stop { name: String },

    /// Terminate a workflow immediately
    Terminate { name: String },

    /// Manage cron workflows
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },

    /// Manage archived workflows
    Archive {
        #[command(subcommand)]
        command: ArchiveCommand,
    },

    /// Print a shell completion script
    Completion {
        #[arg(value_parser = ["bash"])]
        shell: String,
    },

    /// Print the API token
    Token,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argosy=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::default();

    let ctx = Context {
        client: client::Client::new(
            cli.server.as_deref().unwrap_or(&config.auth.server_url),
            config.auth.token.clone(),
        ),
        namespace: cli
            .namespace
            .clone()
            .unwrap_or_else(|| config.server.default_namespace.clone()),
    };

    match cli.command {
        Commands::Server => start_server(config).await,
        Commands::Submit { file, wait } => commands::workflow::submit(&ctx, file, wait).await,
        Commands::Get { name } => commands::workflow::get(&ctx, &name).await,
        Commands::Delete { name } => commands::workflow::delete(&ctx, &name).await,
        Commands::Stop { name } => commands::workflow::shutdown(&ctx, &name, "stop").await,
        Commands::Terminate { name } => commands::workflow::shutdown(&ctx, &name, "terminate").await,
        Commands::Cron { command } => commands::cron::run(&ctx, command).await,
        Commands::Archive { command } => commands::archive::run(&ctx, command).await,
        Commands::Completion { .. } => {
            print!("{}", commands::completion::bash(&Cli::command()));
            Ok(())
        }
        Commands::Token => match config.auth.token {
            Some(token) => {
                println!("{}", token);
                Ok(())
            }
            None => anyhow::bail!("ARGOSY_TOKEN is not set"),
        },
    }
}
