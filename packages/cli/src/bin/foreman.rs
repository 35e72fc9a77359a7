use clap::Parser;
use colored::*;
use foreman_config::ProcessSettings;
use std::process;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match handle_command(cli.command).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<i32> {
    let settings = ProcessSettings::from_env()?;

    match command {
        Commands::Ports(ports_command) => cli::ports::handle(ports_command, &settings).await,
        Commands::KillTree { pid } => cli::ports::kill_tree(pid, &settings).await,
        Commands::Run(args) => cli::jobs::run(args, &settings).await,
    }
}
