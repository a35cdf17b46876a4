use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::types::BranchStatus;
use super::{escape_ref, RepoSession};
use crate::error::PlatformError;
use crate::remote::{GetOptions, RemoteError};

/// `GET /commits/{ref}/status`: the legacy commit status rollup.
#[derive(Debug, Clone, Deserialize)]
pub struct CombinedStatus {
    pub state: String,
    #[serde(default)]
    pub statuses: Vec<StatusContext>,
}

/// One legacy status, as returned by `GET /commits/{ref}/statuses`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusContext {
    pub context: String,
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CheckRun {
    #[serde(default)]
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckRuns {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

const PASSING_CONCLUSIONS: [&str; 3] = ["skipped", "neutral", "success"];

/// Roll legacy statuses and check-runs up into one verdict.
fn aggregate(combined: &CombinedStatus, check_runs: &[CheckRun]) -> BranchStatus {
    if check_runs.is_empty() {
        return BranchStatus::from_github_state(&combined.state);
    }
    let conclusion = |run: &CheckRun| run.conclusion.clone().unwrap_or_default();
    if combined.state == "failure" || check_runs.iter().any(|r| conclusion(r) == "failure") {
        return BranchStatus::Red;
    }
    let legacy_ok = combined.state == "success" || combined.statuses.is_empty();
    let checks_ok = check_runs
        .iter()
        .all(|r| PASSING_CONCLUSIONS.contains(&conclusion(r).as_str()));
    if legacy_ok && checks_ok {
        BranchStatus::Green
    } else {
        BranchStatus::Yellow
    }
}

/// A missing ref means the branch was deleted or moved while we looked at it.
fn branch_gone(err: RemoteError) -> PlatformError {
    if err.is_status(404) {
        PlatformError::RepositoryChanged
    } else {
        err.into()
    }
}

impl RepoSession {
    fn commit_path(&self, branch: &str) -> String {
        format!("{}/commits/{}", self.repo_path(), escape_ref(branch))
    }

    async fn combined_status(
        &mut self,
        branch: &str,
        force: bool,
    ) -> Result<CombinedStatus, PlatformError> {
        if !force {
            if let Some(cached) = self.combined_statuses.get(branch) {
                return Ok(cached.clone());
            }
        }
        let path = format!("{}/status", self.commit_path(branch));
        let body = self
            .remote
            .get_json(&path, GetOptions::fresh())
            .await
            .map_err(branch_gone)?;
        let status: CombinedStatus = serde_json::from_value(body)?;
        debug!(branch, state = %status.state, "fetched combined status");
        self.combined_statuses
            .insert(branch.to_string(), status.clone());
        Ok(status)
    }

    async fn status_contexts(
        &mut self,
        branch: &str,
        force: bool,
    ) -> Result<Vec<StatusContext>, PlatformError> {
        if !force {
            if let Some(cached) = self.status_contexts.get(branch) {
                return Ok(cached.clone());
            }
        }
        let path = format!("{}/statuses?per_page=100", self.commit_path(branch));
        let options = GetOptions {
            no_cache: true,
            ..GetOptions::paginated()
        };
        let body = self
            .remote
            .get_json(&path, options)
            .await
            .map_err(branch_gone)?;
        let contexts: Vec<StatusContext> = serde_json::from_value(body)?;
        self.status_contexts
            .insert(branch.to_string(), contexts.clone());
        Ok(contexts)
    }

    async fn check_runs(&self, branch: &str) -> Result<Vec<CheckRun>, PlatformError> {
        let path = format!("{}/check-runs?per_page=100", self.commit_path(branch));
        match self.remote.get_json(&path, GetOptions::fresh()).await {
            Ok(body) => Ok(serde_json::from_value::<CheckRuns>(body)?.check_runs),
            Err(err)
                if err.is_status(403)
                    || err.message().contains("Resource not accessible by integration") =>
            {
                debug!(branch, "no permission to read check runs");
                Ok(Vec::new())
            }
            Err(err) => Err(branch_gone(err)),
        }
    }

    /// Overall CI verdict for `branch`.
    #[instrument(skip(self), fields(repository = %self.config.repository()))]
    pub async fn get_branch_status(&mut self, branch: &str) -> Result<BranchStatus, PlatformError> {
        let combined = self.combined_status(branch, false).await?;
        let check_runs = self.check_runs(branch).await?;
        let status = aggregate(&combined, &check_runs);
        debug!(
            legacy = %combined.state,
            check_runs = check_runs.len(),
            %status,
            "branch status"
        );
        Ok(status)
    }

    /// State of the newest status named `context` on `branch`.
    pub async fn get_branch_status_check(
        &mut self,
        branch: &str,
        context: &str,
    ) -> Result<Option<BranchStatus>, PlatformError> {
        let contexts = self.status_contexts(branch, false).await?;
        Ok(contexts
            .iter()
            .find(|s| s.context == context)
            .map(|s| BranchStatus::from_github_state(&s.state)))
    }

    /// Publish a commit status on the head of `branch` unless it already
    /// carries `state`. Skipped in fork mode.
    #[instrument(skip(self, description, url), fields(repository = %self.config.repository()))]
    pub async fn set_branch_status(
        &mut self,
        branch: &str,
        context: &str,
        description: &str,
        state: BranchStatus,
        url: Option<&str>,
    ) -> Result<(), PlatformError> {
        if self.config.fork_mode() {
            debug!("cannot set branch status in fork mode");
            return Ok(());
        }
        match self
            .publish_status(branch, context, description, state, url)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, branch, context, "failed to set branch status");
                Err(PlatformError::RepositoryChanged)
            }
        }
    }

    async fn publish_status(
        &mut self,
        branch: &str,
        context: &str,
        description: &str,
        state: BranchStatus,
        url: Option<&str>,
    ) -> Result<(), PlatformError> {
        if self.get_branch_status_check(branch, context).await? == Some(state) {
            debug!(branch, context, %state, "status is already set");
            return Ok(());
        }

        let ref_path = format!("{}/git/ref/heads/{}", self.repo_path(), escape_ref(branch));
        let head = self.remote.get_json(&ref_path, GetOptions::fresh()).await?;
        let sha = head["object"]["sha"]
            .as_str()
            .ok_or(PlatformError::RepositoryChanged)?
            .to_string();

        let mut body = json!({
            "state": state.as_github_state(),
            "description": description,
            "context": context,
        });
        if let Some(url) = url {
            body["target_url"] = json!(url);
        }
        let path = format!("{}/statuses/{sha}", self.repo_path());
        self.remote.post_json(&path, body, None).await?;
        info!(branch, context, %state, "set branch status");

        self.combined_status(branch, true).await?;
        self.status_contexts(branch, true).await?;
        Ok(())
    }
}
