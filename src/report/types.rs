use crate::github::{PrState, PullRequestRecord, RepoConfig};

/// What `depbot inspect` prints for one repository.
#[derive(Debug, Clone)]
pub struct Summary {
    pub config: RepoConfig,
    /// Bot PRs, newest first.
    pub pull_requests: Vec<PullRequestRecord>,
}

impl Summary {
    pub fn count(&self, state: PrState) -> usize {
        self.pull_requests
            .iter()
            .filter(|pr| pr.state == state)
            .count()
    }
}
