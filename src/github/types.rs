use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// `owner/name` identifier of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: &str, name: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// GitHub treats repository names case-insensitively.
    pub fn matches(&self, full_name: &str) -> bool {
        self.full_name().eq_ignore_ascii_case(full_name)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

impl fmt::Display for PrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrState::Open => write!(f, "open"),
            PrState::Closed => write!(f, "closed"),
            PrState::Merged => write!(f, "merged"),
        }
    }
}

impl FromStr for PrState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(PrState::Open),
            "closed" => Ok(PrState::Closed),
            "merged" => Ok(PrState::Merged),
            other => Err(other.to_string()),
        }
    }
}

/// State predicate used by `find_pr`: `all`, `open`, or `!closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFilter {
    All,
    Is(PrState),
    Not(PrState),
}

impl StateFilter {
    pub fn matches(&self, state: PrState) -> bool {
        match self {
            StateFilter::All => true,
            StateFilter::Is(wanted) => state == *wanted,
            StateFilter::Not(excluded) => state != *excluded,
        }
    }
}

impl FromStr for StateFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(StateFilter::All);
        }
        match s.strip_prefix('!') {
            Some(negated) => negated.parse().map(StateFilter::Not),
            None => s.parse().map(StateFilter::Is),
        }
    }
}

/// Normalized pull request, whichever API it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequestRecord {
    pub number: u64,
    pub display_number: String,
    pub source_branch: String,
    pub target_branch: Option<String>,
    pub sha: Option<String>,
    pub title: String,
    /// Only present when the PR was fetched individually.
    pub body: Option<String>,
    pub state: PrState,
    pub can_merge: bool,
    pub can_merge_reason: Option<String>,
    pub is_conflicted: bool,
    pub labels: Vec<String>,
    pub has_assignees: bool,
    pub has_reviewers: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub source_repo: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    #[serde(alias = "OPEN")]
    Open,
    #[serde(alias = "CLOSED")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssueRecord {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: IssueState,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommentRecord {
    pub id: u64,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMethod {
    Rebase,
    Squash,
    Merge,
}

impl MergeMethod {
    /// Order tried when no method was detected or the detected one is refused.
    pub const FALLBACK: [MergeMethod; 3] =
        [MergeMethod::Rebase, MergeMethod::Squash, MergeMethod::Merge];

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::Rebase => "rebase",
            MergeMethod::Squash => "squash",
            MergeMethod::Merge => "merge",
        }
    }
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStatus {
    Green,
    Yellow,
    Red,
}

impl BranchStatus {
    /// State string for `POST /statuses/{sha}`.
    pub fn as_github_state(&self) -> &'static str {
        match self {
            BranchStatus::Green => "success",
            BranchStatus::Yellow => "pending",
            BranchStatus::Red => "failure",
        }
    }

    pub fn from_github_state(state: &str) -> Self {
        match state {
            "success" => BranchStatus::Green,
            "failure" | "error" => BranchStatus::Red,
            _ => BranchStatus::Yellow,
        }
    }
}

impl fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchStatus::Green => write!(f, "green"),
            BranchStatus::Yellow => write!(f, "yellow"),
            BranchStatus::Red => write!(f, "red"),
        }
    }
}

/// Open security alert reported by Dependabot's vulnerability graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulnerabilityAlert {
    pub package_name: String,
    pub ecosystem: String,
    pub manifest_path: Option<String>,
    pub vulnerable_range: Option<String>,
    pub first_patched_version: Option<String>,
    pub severity: Option<String>,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_id_parse() {
        let id: RepoId = "octo/widgets".parse().unwrap();
        assert_eq!(id, RepoId::new("octo", "widgets"));
        assert_eq!(id.to_string(), "octo/widgets");
        assert!(id.matches("Octo/Widgets"));
        assert!("octo".parse::<RepoId>().is_err());
        assert!("octo/".parse::<RepoId>().is_err());
        assert!("a/b/c".parse::<RepoId>().is_err());
    }

    #[test]
    fn test_state_filter_negation() {
        let filter: StateFilter = "!closed".parse().unwrap();
        assert_eq!(filter, StateFilter::Not(PrState::Closed));
        assert!(filter.matches(PrState::Open));
        assert!(filter.matches(PrState::Merged));
        assert!(!filter.matches(PrState::Closed));
    }

    #[test]
    fn test_state_filter_exact_and_all() {
        let open: StateFilter = "open".parse().unwrap();
        assert!(open.matches(PrState::Open));
        assert!(!open.matches(PrState::Merged));
        let all: StateFilter = "all".parse().unwrap();
        assert!(all.matches(PrState::Closed));
        assert!("!bogus".parse::<StateFilter>().is_err());
    }

    #[test]
    fn test_branch_status_mapping() {
        assert_eq!(BranchStatus::from_github_state("success"), BranchStatus::Green);
        assert_eq!(BranchStatus::from_github_state("error"), BranchStatus::Red);
        assert_eq!(BranchStatus::from_github_state("pending"), BranchStatus::Yellow);
        assert_eq!(BranchStatus::Yellow.as_github_state(), "pending");
    }
}
