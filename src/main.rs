use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use depbot::config::Config;
use depbot::github::{EnsureIssue, PlatformClient, RepoSession};
use depbot::remote::HttpClient;
use depbot::report;
use tracing::{info, info_span};
use tracing_subscriber::EnvFilter;

/// depbot: inspect and reconcile the GitHub side of dependency-update PRs.
#[derive(Parser, Debug)]
#[command(name = "depbot", version, about)]
struct Cli {
    /// Config file (defaults to .depbot.toml in the current directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show repository settings and the bot's pull requests
    Inspect {
        /// Repository as owner/name
        repo: String,

        /// Work through the bot's fork of the repository
        #[arg(long)]
        fork: bool,

        /// Write a markdown summary to this file instead of the terminal
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the aggregated CI status of a branch
    BranchStatus { repo: String, branch: String },
    /// Create or update an issue with the given title and body
    EnsureIssue {
        repo: String,

        #[arg(long)]
        title: String,

        #[arg(long)]
        body: String,

        /// Never reopen the issue once it has been closed
        #[arg(long)]
        once: bool,
    },
    /// Merge a pull request, falling back across merge methods
    Merge {
        repo: String,
        number: u64,

        #[arg(long)]
        branch: String,
    },
}

impl Command {
    fn repo(&self) -> &str {
        match self {
            Command::Inspect { repo, .. }
            | Command::BranchStatus { repo, .. }
            | Command::EnsureIssue { repo, .. }
            | Command::Merge { repo, .. } => repo,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("loading configuration");
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let _main_span = info_span!("depbot", repository = %cli.command.repo()).entered();

    let remote = Arc::new(HttpClient::new(config.endpoint(), config.github_token())?);
    let mut platform = PlatformClient::init(remote, config.platform_settings()).await?;
    let force_fork = matches!(cli.command, Command::Inspect { fork: true, .. });
    let mut session = platform
        .init_repo(config.repo_options(cli.command.repo(), force_fork))
        .await?;

    run(cli.command, &mut session).await?;
    info!("done");
    Ok(())
}

async fn run(command: Command, session: &mut RepoSession) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Inspect { output, .. } => {
            let pull_requests = session.get_pr_list().await?;
            info!(count = pull_requests.len(), "fetched bot pull requests");
            let summary = report::build(session.config(), pull_requests);
            report::output(&summary, output.as_deref())?;
        }
        Command::BranchStatus { branch, .. } => {
            let status = session.get_branch_status(&branch).await?;
            println!("{}", report::render_branch_status(&branch, status));
        }
        Command::EnsureIssue {
            title, body, once, ..
        } => {
            let mut request = EnsureIssue::new(&title, &body);
            request.once = once;
            let outcome = session.ensure_issue(request).await;
            println!("{}", report::render_issue_outcome(&title, outcome));
        }
        Command::Merge { number, branch, .. } => {
            let merged = session.merge_pr(&branch, number).await;
            println!("{}", report::render_merge(number, merged));
        }
    }
    Ok(())
}
