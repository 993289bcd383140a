use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use treadi::repos::RepoSource;

#[derive(Parser, Debug)]
#[command(name = "treadi")]
#[command(about = "Follow the most recently updated issues and pull requests across many GitHub repositories", long_about = None)]
pub struct Cli {
    /// Path to a YAML configuration file (defaults to ./treadi.yaml if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// GitHub access token (can be set via GITHUB_TOKEN env var)
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    #[command(flatten)]
    pub repos: RepoArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which repositories to follow. Defaults to the current user's repositories.
#[derive(Args, Debug)]
#[group(multiple = false)]
pub struct RepoArgs {
    /// Follow the public repositories of an organization
    #[arg(long, global = true)]
    pub org: Option<String>,

    /// Follow the repositories listed in a file, one owner/name per line
    #[arg(long, global = true)]
    pub repo_file: Option<PathBuf>,

    /// Follow the GitHub repositories of a vcstool .repos manifest
    #[arg(long, global = true)]
    pub manifest: Option<PathBuf>,
}

impl RepoArgs {
    pub fn source(&self) -> RepoSource {
        if let Some(org) = &self.org {
            RepoSource::Organization(org.clone())
        } else if let Some(path) = &self.repo_file {
            RepoSource::File(path.clone())
        } else if let Some(path) = &self.manifest {
            RepoSource::Manifest(path.clone())
        } else {
            RepoSource::CurrentUser
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the repositories that would be followed
    Repos,

    /// Load all open issues once and print the most recently updated
    Feed {
        /// Number of issues to show
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },

    /// Load all open issues, then keep polling and reprint on updates
    Watch {
        /// Number of issues to show
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
}
