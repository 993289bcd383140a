mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use treadi::config::ConfigLoader;
use treadi::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load(cli.config.as_deref())?;
    logging::init(&config.logging)?;

    let token = cli
        .github_token
        .context("GitHub token is required. Set GITHUB_TOKEN env var or use --github-token")?;
    let source = cli.repos.source();

    match cli.command {
        Commands::Repos => {
            commands::repos(&source, &token).await?;
        }

        Commands::Feed { count } => {
            commands::feed(&source, &token, &config.sync, count).await?;
        }

        Commands::Watch { count } => {
            commands::watch(&source, &token, &config.sync, count).await?;
        }
    }

    Ok(())
}
