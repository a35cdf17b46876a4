//! Decoding of the two pull request shapes (GraphQL nodes and REST objects)
//! into [`PullRequestRecord`]. Nothing downstream of [`normalize`] looks at
//! the source shape.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::types::{PrState, PullRequestRecord};

/// Merge states in which GitHub will accept a merge.
const MERGEABLE_STATES: [&str; 4] = ["BEHIND", "CLEAN", "HAS_HOOKS", "UNSTABLE"];

#[derive(Debug, Default, Deserialize)]
pub struct Nodes<T> {
    #[serde(default = "Vec::new")]
    pub nodes: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Count {
    #[serde(default)]
    pub total_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct Named {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoRef {
    pub name_with_owner: String,
}

/// Pull request node from the `pullRequests` GraphQL connection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphPrNode {
    pub number: u64,
    pub state: String,
    pub head_ref_name: String,
    #[serde(default)]
    pub base_ref_name: Option<String>,
    #[serde(default)]
    pub head_ref_oid: Option<String>,
    pub title: String,
    #[serde(default)]
    pub merge_state_status: Option<String>,
    #[serde(default)]
    pub labels: Option<Nodes<Named>>,
    #[serde(default)]
    pub assignees: Option<Count>,
    #[serde(default)]
    pub review_requests: Option<Count>,
    /// Only `CHANGES_REQUESTED` reviews are requested.
    #[serde(default)]
    pub reviews: Option<Nodes<Value>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub head_repository: Option<RepoRef>,
}

#[derive(Debug, Deserialize)]
pub struct RestRef {
    #[serde(rename = "ref")]
    pub name: String,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub repo: Option<RestRepo>,
}

#[derive(Debug, Deserialize)]
pub struct RestRepo {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct RestLabel {
    pub name: String,
}

/// Pull request object from `GET /repos/{repo}/pulls[/{number}]`.
#[derive(Debug, Deserialize)]
pub struct RestPr {
    pub number: u64,
    pub state: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub head: RestRef,
    #[serde(default)]
    pub base: Option<RestRef>,
    #[serde(default)]
    pub mergeable: Option<bool>,
    #[serde(default)]
    pub mergeable_state: Option<String>,
    #[serde(default)]
    pub merged_at: Option<String>,
    #[serde(default)]
    pub labels: Vec<RestLabel>,
    #[serde(default)]
    pub assignees: Vec<Value>,
    #[serde(default)]
    pub requested_reviewers: Vec<Value>,
    #[serde(default)]
    pub requested_teams: Vec<Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

pub enum PrSource {
    Graph(GraphPrNode),
    Rest(RestPr),
}

/// Collapse either source shape into one record. `fork_mode` matters only
/// for GraphQL merge-state classification.
pub fn normalize(source: PrSource, fork_mode: bool) -> PullRequestRecord {
    match source {
        PrSource::Graph(node) => from_graph(node, fork_mode),
        PrSource::Rest(pr) => from_rest(pr),
    }
}

fn display_number(number: u64) -> String {
    format!("Pull Request #{number}")
}

fn from_graph(node: GraphPrNode, fork_mode: bool) -> PullRequestRecord {
    // Merged is only derivable from REST data.
    let state = if node.state.eq_ignore_ascii_case("open") {
        PrState::Open
    } else {
        PrState::Closed
    };

    let has_negative_review = node
        .reviews
        .as_ref()
        .is_some_and(|reviews| !reviews.nodes.is_empty());
    let merge_state = node.merge_state_status.as_deref();

    let (can_merge, can_merge_reason) = if has_negative_review {
        (false, Some("hasNegativeReview".to_string()))
    } else {
        match merge_state {
            Some(s) if MERGEABLE_STATES.contains(&s) => (true, None),
            // The fork's own token may still be allowed to merge.
            Some("BLOCKED") if fork_mode => (true, None),
            other => (false, other.map(str::to_string)),
        }
    };

    PullRequestRecord {
        number: node.number,
        display_number: display_number(node.number),
        source_branch: node.head_ref_name,
        target_branch: node.base_ref_name,
        sha: node.head_ref_oid,
        title: node.title,
        body: None,
        state,
        can_merge,
        can_merge_reason,
        is_conflicted: merge_state == Some("DIRTY"),
        labels: node
            .labels
            .map(|l| l.nodes.into_iter().map(|n| n.name).collect())
            .unwrap_or_default(),
        has_assignees: node.assignees.is_some_and(|a| a.total_count > 0),
        has_reviewers: node.review_requests.is_some_and(|r| r.total_count > 0),
        created_at: node.created_at,
        closed_at: node.closed_at,
        source_repo: node.head_repository.map(|r| r.name_with_owner),
    }
}

fn from_rest(pr: RestPr) -> PullRequestRecord {
    let merged = pr.merged_at.as_deref().is_some_and(|m| !m.is_empty());
    let state = match pr.state.as_str() {
        "open" => PrState::Open,
        _ if merged => PrState::Merged,
        _ => PrState::Closed,
    };

    let (can_merge, can_merge_reason) = match pr.mergeable {
        Some(true) => (true, None),
        Some(false) => (false, Some("mergeable = false".to_string())),
        None => (false, Some("mergeable = null".to_string())),
    };

    PullRequestRecord {
        number: pr.number,
        display_number: display_number(pr.number),
        source_branch: pr.head.name,
        target_branch: pr.base.map(|b| b.name),
        sha: pr.head.sha,
        title: pr.title,
        body: pr.body,
        state,
        can_merge,
        can_merge_reason,
        is_conflicted: pr.mergeable_state.as_deref() == Some("dirty"),
        labels: pr.labels.into_iter().map(|l| l.name).collect(),
        has_assignees: !pr.assignees.is_empty(),
        has_reviewers: !pr.requested_reviewers.is_empty() || !pr.requested_teams.is_empty(),
        created_at: pr.created_at,
        closed_at: pr.closed_at,
        source_repo: pr.head.repo.map(|r| r.full_name),
    }
}

/// Decode one REST pull request object.
pub fn from_rest_value(value: Value) -> Result<PullRequestRecord, serde_json::Error> {
    let pr: RestPr = serde_json::from_value(value)?;
    Ok(normalize(PrSource::Rest(pr), false))
}
