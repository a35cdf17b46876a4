use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::types::RepoId;
use super::{escape_ref, PlatformClient, RepoConfig};
use crate::error::PlatformError;
use crate::remote::GetOptions;

impl PlatformClient {
    /// Resolve (creating if needed) the bot's fork of `parent` and bring its
    /// default branch level with the parent's.
    #[instrument(skip(self, config), fields(parent = %parent))]
    pub(crate) async fn ensure_fork(
        &mut self,
        parent: &RepoId,
        config: &RepoConfig,
    ) -> Result<RepoId, PlatformError> {
        let token = self.settings.fork_token.clone();
        let token = token.as_deref();
        let listing = self.repo_listing(token).await?;

        let created = self
            .remote
            .post_json(&format!("repos/{parent}/forks"), json!({}), token)
            .await
            .map_err(PlatformError::CannotFork)?;
        let full_name = created["full_name"].as_str().unwrap_or_default();
        let fork: RepoId = full_name
            .parse()
            .map_err(PlatformError::InvalidRepository)?;
        let existed = listing.iter().any(|name| fork.matches(name));
        let branch = config.default_branch.as_str();
        let sha = match &config.default_branch_sha {
            Some(sha) => sha.clone(),
            None => self.branch_sha(parent, branch).await?,
        };

        if created["default_branch"].as_str() != Some(branch) {
            self.align_default_branch(&fork, branch, &sha, token).await;
        }

        if existed {
            let path = format!("repos/{fork}/git/refs/heads/{}", escape_ref(branch));
            self.remote
                .patch_json(&path, json!({ "sha": sha, "force": true }), token)
                .await
                .map_err(PlatformError::HostError)?;
            info!(%fork, %sha, "updated existing fork's default branch");
        } else {
            info!(%fork, "created fork, waiting for it to settle");
            if let Some(names) = self.repo_listings.get_mut(token.unwrap_or_default()) {
                names.push(fork.full_name());
            }
            tokio::time::sleep(self.fork_settle_delay).await;
        }
        Ok(fork)
    }

    /// Best-effort: create `branch` in the fork and make it the default.
    async fn align_default_branch(
        &self,
        fork: &RepoId,
        branch: &str,
        sha: &str,
        token: Option<&str>,
    ) {
        let body = json!({ "ref": format!("refs/heads/{branch}"), "sha": sha });
        match self
            .remote
            .post_json(&format!("repos/{fork}/git/refs"), body, token)
            .await
        {
            Ok(_) => debug!(branch, "created default branch in fork"),
            Err(err) if err.message().contains("Reference already exists") => {
                debug!(branch, "default branch already exists in fork");
            }
            Err(err) => warn!(error = %err, branch, "could not create default branch in fork"),
        }

        let body = json!({ "name": fork.name, "default_branch": branch });
        if let Err(err) = self
            .remote
            .patch_json(&format!("repos/{fork}"), body, token)
            .await
        {
            warn!(error = %err, branch, "could not set fork's default branch");
        }
    }

    async fn branch_sha(&self, repository: &RepoId, branch: &str) -> Result<String, PlatformError> {
        let path = format!("repos/{repository}/git/ref/heads/{}", escape_ref(branch));
        let body = self.remote.get_json(&path, GetOptions::fresh()).await?;
        body["object"]["sha"]
            .as_str()
            .map(str::to_string)
            .ok_or(PlatformError::EmptyRepository)
    }
}
