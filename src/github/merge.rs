use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::types::MergeMethod;
use super::RepoSession;
use crate::remote::{GetOptions, RemoteError};

enum Attempt {
    Merged,
    /// 404/405: the method is not accepted here, another may be.
    Rejected,
    Failed,
}

fn is_rejection(err: &RemoteError) -> bool {
    err.is_status(404) || err.is_status(405)
}

impl RepoSession {
    async fn has_approval(&self, number: u64) -> bool {
        let path = format!("{}/pulls/{number}/reviews", self.target_path());
        match self.remote.get_json(&path, GetOptions::fresh()).await {
            Ok(reviews) => reviews
                .as_array()
                .is_some_and(|r| r.iter().any(|review| review["state"] == "APPROVED")),
            Err(err) => {
                warn!(error = %err, number, "could not read reviews");
                false
            }
        }
    }

    async fn try_merge(&self, number: u64, method: MergeMethod) -> Attempt {
        let path = format!("{}/pulls/{number}/merge", self.target_path());
        let body = json!({ "merge_method": method.as_str() });
        match self.remote.put_json(&path, body, None).await {
            Ok(_) => Attempt::Merged,
            Err(err) if is_rejection(&err) => {
                debug!(number, %method, error = %err, "merge method rejected");
                Attempt::Rejected
            }
            Err(err) => {
                warn!(number, %method, error = %err, "merge failed");
                Attempt::Failed
            }
        }
    }

    /// Merge PR `number`. Tries the repository's detected method first, then
    /// rebase, squash and merge commits in turn while GitHub answers 404/405.
    ///
    /// Returns false when the PR could not be merged; callers retry on a
    /// later pass. On success the cached statuses of `branch_name` are dropped.
    #[instrument(skip(self), fields(repository = %self.config.target_repository()))]
    pub async fn merge_pr(&mut self, branch_name: &str, number: u64) -> bool {
        if self.config.reviews_required && !self.has_approval(number).await {
            info!(number, branch = branch_name, "branch requires review approval, not merging");
            return false;
        }

        let attempts = self
            .config
            .merge_method
            .into_iter()
            .chain(MergeMethod::FALLBACK);
        for method in attempts {
            match self.try_merge(number, method).await {
                Attempt::Merged => {
                    info!(number, branch = branch_name, %method, "merged pull request");
                    self.invalidate_prs();
                    self.combined_statuses.remove(branch_name);
                    self.status_contexts.remove(branch_name);
                    return true;
                }
                Attempt::Rejected => continue,
                Attempt::Failed => return false,
            }
        }
        warn!(number, branch = branch_name, "no merge method was accepted");
        false
    }
}
