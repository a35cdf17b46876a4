pub mod types;

pub use types::Summary;

use crate::github::{BranchStatus, IssueOutcome, PrState, PullRequestRecord, RepoConfig};
use colored::Colorize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    FileWrite(#[from] std::io::Error),
}

/// Build a Summary from the session settings and the bot's PRs.
pub fn build(config: &RepoConfig, mut pull_requests: Vec<PullRequestRecord>) -> Summary {
    pull_requests.sort_by(|a, b| b.number.cmp(&a.number));
    Summary {
        config: config.clone(),
        pull_requests,
    }
}

/// Output the summary to terminal (default) or to a markdown file.
#[instrument(skip(summary), fields(repository = %summary.config.repository()))]
pub fn output(summary: &Summary, output_path: Option<&Path>) -> Result<(), ReportError> {
    match output_path {
        None => {
            debug!("writing summary to terminal");
            print!("{}", render_terminal(summary));
            Ok(())
        }
        Some(path) => {
            debug!(path = %path.display(), "writing summary to file");
            std::fs::write(path, render_markdown(summary))?;
            Ok(())
        }
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

/// Terminal layout:
///
/// octo/widgets (fork of upstream/widgets)
/// Default branch: main | Merge method: rebase | Issues: yes
///
/// ═══ Pull Requests (2 open, 1 merged, 0 closed) ═══
///   #12 OPEN   deps/serde  Update serde to 1.0.200
pub fn render_terminal(summary: &Summary) -> String {
    let config = &summary.config;
    let mut out = String::from("\n");
    match config.parent_repository() {
        Some(parent) => out.push_str(&format!(
            "{} (fork of {})\n",
            config.repository().to_string().bold(),
            parent
        )),
        None => out.push_str(&format!("{}\n", config.repository().to_string().bold())),
    }
    out.push_str(&format!(
        "Default branch: {} | Merge method: {} | Issues: {}\n",
        config.default_branch,
        config
            .merge_method
            .map(|m| m.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        yes_no(config.issues_enabled)
    ));
    out.push_str(&format!(
        "Reviews required: {} | Force rebase: {} | Push protected: {}\n\n",
        yes_no(config.reviews_required),
        yes_no(config.force_rebase),
        yes_no(config.push_protected)
    ));

    out.push_str(&format!(
        "═══ Pull Requests ({} open, {} merged, {} closed) ═══\n",
        summary.count(PrState::Open),
        summary.count(PrState::Merged),
        summary.count(PrState::Closed)
    ));
    if summary.pull_requests.is_empty() {
        out.push_str("  No pull requests.\n");
    }
    for pr in &summary.pull_requests {
        out.push_str(&format!(
            "  #{} {} {}  {}\n",
            pr.number,
            colorize_state(pr.state),
            pr.source_branch.cyan(),
            pr.title
        ));
    }
    out.push('\n');
    out
}

pub fn render_markdown(summary: &Summary) -> String {
    let config = &summary.config;
    let mut md = format!("# {}\n\n", config.repository());
    if let Some(parent) = config.parent_repository() {
        md.push_str(&format!("Fork of **{parent}**\n\n"));
    }
    md.push_str(&format!(
        "**Default branch:** {} | **Issues:** {} | **Reviews required:** {}\n\n",
        config.default_branch,
        yes_no(config.issues_enabled),
        yes_no(config.reviews_required)
    ));
    md.push_str("## Pull Requests\n\n");
    if summary.pull_requests.is_empty() {
        md.push_str("No pull requests.\n");
    }
    for pr in &summary.pull_requests {
        md.push_str(&format!(
            "- **#{}** [{}] `{}` {}\n",
            pr.number, pr.state, pr.source_branch, pr.title
        ));
    }
    md
}

pub fn render_branch_status(branch: &str, status: BranchStatus) -> String {
    format!("{} {}", branch.cyan(), colorize_status(status))
}

pub fn render_issue_outcome(title: &str, outcome: Option<IssueOutcome>) -> String {
    let outcome = match outcome {
        Some(IssueOutcome::Created) => "created".green(),
        Some(IssueOutcome::Updated) => "updated".yellow(),
        None => "unchanged".normal(),
    };
    format!("Issue \"{title}\": {outcome}")
}

pub fn render_merge(number: u64, merged: bool) -> String {
    let result = if merged {
        "merged".green().bold()
    } else {
        "not merged".red().bold()
    };
    format!("PR #{number}: {result}")
}

fn colorize_state(state: PrState) -> colored::ColoredString {
    match state {
        PrState::Open => "OPEN  ".green(),
        PrState::Merged => "MERGED".magenta(),
        PrState::Closed => "CLOSED".red(),
    }
}

fn colorize_status(status: BranchStatus) -> colored::ColoredString {
    match status {
        BranchStatus::Green => "GREEN".green().bold(),
        BranchStatus::Yellow => "YELLOW".yellow().bold(),
        BranchStatus::Red => "RED".red().bold(),
    }
}
