use std::collections::HashMap;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::markdown::massage_markdown;
use super::normalize::{from_rest_value, normalize, GraphPrNode, PrSource};
use super::types::{PrState, PullRequestRecord, StateFilter};
use super::RepoSession;
use crate::error::PlatformError;
use crate::remote::GetOptions;

const OPEN_PRS_QUERY: &str = r#"
query($owner: String!, $name: String!, $count: Int!, $cursor: String) {
  repository(owner: $owner, name: $name) {
    pullRequests(states: [OPEN], orderBy: {field: UPDATED_AT, direction: DESC}, first: $count, after: $cursor) {
      pageInfo { hasNextPage endCursor }
      nodes {
        number
        state
        headRefName
        baseRefName
        headRefOid
        title
        mergeStateStatus
        createdAt
        headRepository { nameWithOwner }
        labels(last: 100) { nodes { name } }
        assignees { totalCount }
        reviewRequests { totalCount }
        reviews(first: 1, states: [CHANGES_REQUESTED]) { nodes { state } }
      }
    }
  }
}
"#;

const CLOSED_PRS_QUERY: &str = r#"
query($owner: String!, $name: String!, $count: Int!, $cursor: String) {
  repository(owner: $owner, name: $name) {
    pullRequests(states: [CLOSED, MERGED], orderBy: {field: UPDATED_AT, direction: DESC}, first: $count, after: $cursor) {
      pageInfo { hasNextPage endCursor }
      nodes {
        number
        state
        headRefName
        headRefOid
        title
        createdAt
        closedAt
        headRepository { nameWithOwner }
      }
    }
  }
}
"#;

const AUTOCLOSED_SUFFIX: &str = " - autoclosed";
/// Autoclosed PRs older than this are never reopened.
const AUTOCLOSED_REOPEN_WINDOW_MS: i64 = 604_800_000;

/// Search criteria for [`RepoSession::find_pr`].
#[derive(Debug, Clone)]
pub struct FindPr {
    pub branch_name: String,
    pub title: Option<String>,
    pub state: StateFilter,
}

impl FindPr {
    pub fn branch(branch_name: &str) -> Self {
        Self {
            branch_name: branch_name.to_string(),
            title: None,
            state: StateFilter::All,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreatePr {
    pub branch_name: String,
    /// Defaults to the repository's default branch.
    pub target_branch: Option<String>,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub draft: bool,
}

#[derive(Debug, Clone)]
pub struct UpdatePr {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: Option<PrState>,
}

fn index_by_number(records: Vec<PullRequestRecord>) -> HashMap<u64, PullRequestRecord> {
    records.into_iter().map(|pr| (pr.number, pr)).collect()
}

impl RepoSession {
    fn write_token(&self) -> Option<&str> {
        if self.config.fork_mode() {
            self.config.fork_token.as_deref()
        } else {
            None
        }
    }

    async fn load_open_prs(&mut self) -> Result<(), PlatformError> {
        if self.open_prs.is_some() {
            return Ok(());
        }
        let fork_mode = self.config.fork_mode();
        let nodes: Vec<GraphPrNode> = self
            .query_nodes(OPEN_PRS_QUERY, "pullRequests", json!({}))
            .await?;
        let records: Vec<PullRequestRecord> = nodes
            .into_iter()
            .map(|node| normalize(PrSource::Graph(node), fork_mode))
            .collect();
        debug!(count = records.len(), "retrieved open pull requests");
        self.open_prs = Some(index_by_number(records));
        Ok(())
    }

    async fn load_closed_prs(&mut self) -> Result<(), PlatformError> {
        if self.closed_prs.is_some() {
            return Ok(());
        }
        let nodes: Vec<GraphPrNode> = self
            .query_nodes(CLOSED_PRS_QUERY, "pullRequests", json!({}))
            .await?;
        let records: Vec<PullRequestRecord> = nodes
            .into_iter()
            .map(|node| normalize(PrSource::Graph(node), false))
            .collect();
        let mut numbers: Vec<u64> = records.iter().map(|pr| pr.number).collect();
        numbers.sort_unstable();
        debug!(?numbers, "retrieved closed pull requests");
        self.closed_prs = Some(index_by_number(records));
        Ok(())
    }

    /// Open pull requests keyed by number, with mergeability classified.
    pub async fn get_open_prs(&mut self) -> Result<HashMap<u64, PullRequestRecord>, PlatformError> {
        self.load_open_prs().await?;
        Ok(self.open_prs.clone().unwrap_or_default())
    }

    pub async fn get_closed_prs(
        &mut self,
    ) -> Result<HashMap<u64, PullRequestRecord>, PlatformError> {
        self.load_closed_prs().await?;
        Ok(self.closed_prs.clone().unwrap_or_default())
    }

    /// Look a PR up in the caches, falling back to a direct REST fetch for
    /// PRs the caches do not know about. `None` when GitHub has no such PR.
    #[instrument(skip(self), fields(repository = %self.config.target_repository()))]
    pub async fn get_pr(&mut self, number: u64) -> Result<Option<PullRequestRecord>, PlatformError> {
        self.load_open_prs().await?;
        if let Some(pr) = self.open_prs.as_ref().and_then(|prs| prs.get(&number)) {
            return Ok(Some(pr.clone()));
        }
        self.load_closed_prs().await?;
        if let Some(pr) = self.closed_prs.as_ref().and_then(|prs| prs.get(&number)) {
            return Ok(Some(pr.clone()));
        }

        debug!("PR not in caches, fetching directly");
        let path = format!("{}/pulls/{number}", self.target_path());
        match self.remote.get_json(&path, GetOptions::fresh()).await {
            Ok(body) => Ok(Some(from_rest_value(body)?)),
            Err(err) if err.is_status(404) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Every PR in the repository (any state) opened by the bot.
    pub async fn get_pr_list(&mut self) -> Result<Vec<PullRequestRecord>, PlatformError> {
        if let Some(list) = &self.pr_list {
            return Ok(list.clone());
        }
        let path = format!("{}/pulls?per_page=100&state=all", self.target_path());
        let options = GetOptions {
            no_cache: true,
            ..GetOptions::paginated()
        };
        let body = self.remote.get_json(&path, options).await?;

        let filter_author = !self.config.fork_mode() && !self.config.ignore_pr_author;
        let username = self.config.username.clone();
        if filter_author && username.is_none() {
            warn!("bot username is unknown, no pull request is treated as the bot's");
        }
        let mut list = Vec::new();
        for item in body.as_array().cloned().unwrap_or_default() {
            let authored =
                username.is_some() && item["user"]["login"].as_str() == username.as_deref();
            if filter_author && !authored {
                continue;
            }
            list.push(from_rest_value(item)?);
        }
        debug!(count = list.len(), "retrieved pull request list");
        self.pr_list = Some(list.clone());
        Ok(list)
    }

    /// First PR matching branch, optional title and state. Outside fork mode
    /// the PR must also come from this repository.
    pub async fn find_pr(
        &mut self,
        criteria: FindPr,
    ) -> Result<Option<PullRequestRecord>, PlatformError> {
        let fork_mode = self.config.fork_mode();
        let repository = self.config.repository().clone();
        let list = self.get_pr_list().await?;
        let found = list.into_iter().find(|pr| {
            pr.source_branch == criteria.branch_name
                && criteria.title.as_ref().map_or(true, |t| &pr.title == t)
                && criteria.state.matches(pr.state)
                && (fork_mode
                    || pr
                        .source_repo
                        .as_deref()
                        .is_some_and(|source| repository.matches(source)))
        });
        if let Some(pr) = &found {
            debug!(number = pr.number, branch = %criteria.branch_name, "found PR");
        }
        Ok(found)
    }

    /// The bot's PR for `branch_name`: an open one, or a recently autoclosed
    /// one which is reopened.
    #[instrument(skip(self), fields(repository = %self.config.target_repository()))]
    pub async fn get_branch_pr(
        &mut self,
        branch_name: &str,
    ) -> Result<Option<PullRequestRecord>, PlatformError> {
        if let Some(number) = self.branch_prs.get(branch_name).copied() {
            return self.get_pr(number).await;
        }

        let open = self
            .find_pr(FindPr {
                branch_name: branch_name.to_string(),
                title: None,
                state: StateFilter::Is(PrState::Open),
            })
            .await?;
        if let Some(open) = open {
            let pr = self.get_pr(open.number).await?.unwrap_or(open);
            self.branch_prs.insert(branch_name.to_string(), pr.number);
            return Ok(Some(pr));
        }

        self.reopen_autoclosed(branch_name).await
    }

    async fn reopen_autoclosed(
        &mut self,
        branch_name: &str,
    ) -> Result<Option<PullRequestRecord>, PlatformError> {
        // Same author and source-repository guards as any other lookup.
        let closed = self
            .find_pr(FindPr {
                branch_name: branch_name.to_string(),
                title: None,
                state: StateFilter::Is(PrState::Closed),
            })
            .await?;
        let Some(pr) = closed.filter(|pr| pr.title.ends_with(AUTOCLOSED_SUFFIX)) else {
            return Ok(None);
        };

        let window = Duration::milliseconds(AUTOCLOSED_REOPEN_WINDOW_MS);
        let recent = pr.closed_at.is_some_and(|closed| Utc::now() - closed < window);
        if !recent {
            debug!(number = pr.number, "autoclosed PR is too old to reopen");
            return Ok(None);
        }
        let Some(sha) = pr.sha.clone() else {
            debug!(number = pr.number, "autoclosed PR has no head commit");
            return Ok(None);
        };

        let refs_path = format!("{}/git/refs", self.repo_path());
        let ref_body = json!({ "ref": format!("refs/heads/{branch_name}"), "sha": sha });
        if let Err(err) = self
            .remote
            .post_json(&refs_path, ref_body, self.write_token())
            .await
        {
            debug!(error = %err, number = pr.number, "could not recreate autoclosed branch");
            return Ok(None);
        }

        let title = pr
            .title
            .strip_suffix(AUTOCLOSED_SUFFIX)
            .unwrap_or(&pr.title)
            .to_string();
        let pr_path = format!("{}/pulls/{}", self.target_path(), pr.number);
        let patch = json!({ "state": "open", "title": title });
        if let Err(err) = self
            .remote
            .patch_json(&pr_path, patch, self.write_token())
            .await
        {
            debug!(error = %err, number = pr.number, "could not reopen autoclosed PR");
            return Ok(None);
        }

        info!(number = pr.number, branch = branch_name, "reopened autoclosed PR");
        self.invalidate_prs();
        self.branch_prs.insert(branch_name.to_string(), pr.number);
        Ok(Some(PullRequestRecord {
            title,
            state: PrState::Open,
            closed_at: None,
            ..pr
        }))
    }

    #[instrument(skip(self, request), fields(repository = %self.config.target_repository(), branch = %request.branch_name))]
    pub async fn create_pr(&mut self, request: CreatePr) -> Result<PullRequestRecord, PlatformError> {
        let head = if self.config.fork_mode() {
            format!("{}:{}", self.config.repository().owner, request.branch_name)
        } else {
            request.branch_name.clone()
        };
        let base = request
            .target_branch
            .clone()
            .unwrap_or_else(|| self.config.default_branch.clone());
        let body = json!({
            "title": request.title,
            "head": head,
            "base": base,
            "body": massage_markdown(&request.body),
            "draft": request.draft,
        });

        let path = format!("{}/pulls", self.target_path());
        let created = self.remote.post_json(&path, body, self.write_token()).await?;
        let mut pr = from_rest_value(created)?;
        self.add_labels(pr.number, &request.labels).await;
        for label in &request.labels {
            if !pr.labels.contains(label) {
                pr.labels.push(label.clone());
            }
        }
        info!(number = pr.number, "created PR");

        if let Some(open) = self.open_prs.as_mut() {
            open.insert(pr.number, pr.clone());
        }
        self.pr_list = None;
        self.branch_prs.insert(request.branch_name, pr.number);
        Ok(pr)
    }

    #[instrument(skip(self, update), fields(repository = %self.config.target_repository(), number = update.number))]
    pub async fn update_pr(&mut self, update: UpdatePr) -> Result<(), PlatformError> {
        let mut body = json!({ "title": update.title });
        if let Some(text) = &update.body {
            body["body"] = Value::String(massage_markdown(text));
        }
        if let Some(state) = update.state {
            body["state"] = Value::String(state.to_string());
        }

        let path = format!("{}/pulls/{}", self.target_path(), update.number);
        self.remote.patch_json(&path, body, self.write_token()).await?;
        debug!("updated PR");

        if update.state.is_some() {
            self.invalidate_prs();
            return Ok(());
        }
        let apply = |pr: &mut PullRequestRecord| {
            pr.title = update.title.clone();
            if update.body.is_some() {
                pr.body = update.body.clone();
            }
        };
        if let Some(pr) = self.open_prs.as_mut().and_then(|m| m.get_mut(&update.number)) {
            apply(pr);
        }
        if let Some(pr) = self
            .pr_list
            .as_mut()
            .and_then(|l| l.iter_mut().find(|p| p.number == update.number))
        {
            apply(pr);
        }
        Ok(())
    }
}
