//! GitHub platform adapter.
//!
//! [`PlatformClient`] lives for the whole process and owns state shared
//! between repositories (the token's repository listing). Each repository
//! pass gets its own [`RepoSession`] from [`PlatformClient::init_repo`]; the
//! session caches pull requests, issues and branch statuses until it is
//! dropped.

pub mod comments;
pub mod fork;
pub mod issues;
pub mod markdown;
pub mod merge;
pub mod normalize;
pub mod pulls;
pub mod session;
pub mod status;
pub mod types;

pub use comments::CommentTarget;
pub use issues::{EnsureIssue, IssueOutcome};
pub use markdown::massage_markdown;
pub use pulls::{CreatePr, FindPr, UpdatePr};
pub use session::RepoOptions;
pub use types::{
    BranchStatus, CommentRecord, IssueRecord, IssueState, MergeMethod, PrState,
    PullRequestRecord, RepoId, StateFilter, VulnerabilityAlert,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::error::PlatformError;
use crate::remote::{GetOptions, RemoteClient};
use status::{CombinedStatus, StatusContext};

/// Characters that cannot appear literally in a ref path segment.
const REF_SEGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'#').add(b'%').add(b'?');

pub(crate) fn escape_ref(branch: &str) -> String {
    utf8_percent_encode(branch, REF_SEGMENT).to_string()
}

pub(crate) fn escape_segment(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

const GRAPH_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
    #[serde(default)]
    page_info: Option<PageInfo>,
}

/// Bot identity and fork credentials shared by every session.
#[derive(Debug, Clone, Default)]
pub struct PlatformSettings {
    pub username: Option<String>,
    pub git_author: Option<String>,
    /// Token used for fork operations; falls back to the client's default.
    pub fork_token: Option<String>,
}

/// Process-lifetime GitHub client.
pub struct PlatformClient {
    pub(crate) remote: Arc<dyn RemoteClient>,
    pub(crate) settings: PlatformSettings,
    /// Repository listings keyed by the token they were fetched with.
    pub(crate) repo_listings: HashMap<String, Vec<String>>,
    /// Wait after creating a fork; GitHub forks asynchronously.
    pub fork_settle_delay: Duration,
}

impl PlatformClient {
    pub fn new(remote: Arc<dyn RemoteClient>, settings: PlatformSettings) -> Self {
        Self {
            remote,
            settings,
            repo_listings: HashMap::new(),
            fork_settle_delay: Duration::from_secs(30),
        }
    }

    /// Build a client and fill in the bot identity from the token's user
    /// when it was not configured.
    #[instrument(skip_all)]
    pub async fn init(
        remote: Arc<dyn RemoteClient>,
        mut settings: PlatformSettings,
    ) -> Result<Self, PlatformError> {
        if settings.username.is_none() || settings.git_author.is_none() {
            let user = remote.get_json("user", GetOptions::default()).await?;
            if settings.username.is_none() {
                settings.username = user["login"].as_str().map(str::to_string);
            }
            if settings.git_author.is_none() {
                settings.git_author = detect_git_author(remote.as_ref(), &user).await;
            }
        }
        info!(username = ?settings.username, git_author = ?settings.git_author, "platform initialized");
        Ok(Self::new(remote, settings))
    }

    pub fn settings(&self) -> &PlatformSettings {
        &self.settings
    }

    /// Full names of all repositories visible to the default token.
    pub async fn get_repos(&mut self) -> Result<Vec<String>, PlatformError> {
        self.repo_listing(None).await
    }

    /// Drop state shared across sessions (the repository listings).
    pub fn reset_caches(&mut self) {
        self.repo_listings.clear();
    }

    pub(crate) async fn repo_listing(
        &mut self,
        token: Option<&str>,
    ) -> Result<Vec<String>, PlatformError> {
        let key = token.unwrap_or_default().to_string();
        if let Some(cached) = self.repo_listings.get(&key) {
            return Ok(cached.clone());
        }
        let body = self
            .remote
            .get_json(
                "user/repos?per_page=100",
                GetOptions {
                    no_cache: true,
                    ..GetOptions::paginated()
                }
                .with_token(token),
            )
            .await?;
        let names: Vec<String> = body
            .as_array()
            .map(|repos| {
                repos
                    .iter()
                    .filter_map(|r| r["full_name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        debug!(count = names.len(), "fetched repository listing");
        self.repo_listings.insert(key, names.clone());
        Ok(names)
    }
}

/// `Name <primary@email>` for the token's user, when the token may read emails.
async fn detect_git_author(remote: &dyn RemoteClient, user: &Value) -> Option<String> {
    let name = user["name"]
        .as_str()
        .or_else(|| user["login"].as_str())?
        .to_string();
    match remote.get_json("user/emails", GetOptions::default()).await {
        Ok(emails) => emails
            .as_array()?
            .iter()
            .find(|e| e["primary"].as_bool() == Some(true))
            .and_then(|e| e["email"].as_str())
            .map(|email| format!("{name} <{email}>")),
        Err(err) => {
            debug!(error = %err, "cannot read user emails, git author not detected");
            None
        }
    }
}

/// Settings discovered for one repository at session start.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    repository: RepoId,
    parent_repository: Option<RepoId>,
    pub default_branch: String,
    pub default_branch_sha: Option<String>,
    pub merge_method: Option<MergeMethod>,
    pub auto_merge_allowed: bool,
    pub issues_enabled: bool,
    pub reviews_required: bool,
    pub force_rebase: bool,
    pub push_protected: bool,
    pub username: Option<String>,
    pub git_author: Option<String>,
    pub ignore_pr_author: bool,
    pub fork_token: Option<String>,
}

impl RepoConfig {
    pub fn new(repository: RepoId, default_branch: &str) -> Self {
        Self {
            repository,
            parent_repository: None,
            default_branch: default_branch.to_string(),
            default_branch_sha: None,
            merge_method: None,
            auto_merge_allowed: false,
            issues_enabled: true,
            reviews_required: false,
            force_rebase: false,
            push_protected: false,
            username: None,
            git_author: None,
            ignore_pr_author: false,
            fork_token: None,
        }
    }

    /// Switch to fork mode: branches live in `fork`, collaboration happens on
    /// the original repository.
    pub fn into_fork(mut self, fork: RepoId) -> Self {
        let parent = std::mem::replace(&mut self.repository, fork);
        self.parent_repository = Some(parent);
        self
    }

    /// Repository holding the bot's branches (the fork in fork mode).
    pub fn repository(&self) -> &RepoId {
        &self.repository
    }

    pub fn parent_repository(&self) -> Option<&RepoId> {
        self.parent_repository.as_ref()
    }

    /// Repository that owns issues, pull requests and comments.
    pub fn target_repository(&self) -> &RepoId {
        self.parent_repository.as_ref().unwrap_or(&self.repository)
    }

    pub fn fork_mode(&self) -> bool {
        self.parent_repository.is_some()
    }
}

/// Cached view of one repository for the duration of a processing pass.
pub struct RepoSession {
    pub(crate) remote: Arc<dyn RemoteClient>,
    pub(crate) config: RepoConfig,
    pub(crate) open_prs: Option<HashMap<u64, PullRequestRecord>>,
    pub(crate) closed_prs: Option<HashMap<u64, PullRequestRecord>>,
    pub(crate) pr_list: Option<Vec<PullRequestRecord>>,
    pub(crate) issue_list: Option<Vec<IssueRecord>>,
    pub(crate) branch_prs: HashMap<String, u64>,
    pub(crate) combined_statuses: HashMap<String, CombinedStatus>,
    pub(crate) status_contexts: HashMap<String, Vec<StatusContext>>,
}

impl RepoSession {
    pub fn new(remote: Arc<dyn RemoteClient>, config: RepoConfig) -> Self {
        Self {
            remote,
            config,
            open_prs: None,
            closed_prs: None,
            pr_list: None,
            issue_list: None,
            branch_prs: HashMap::new(),
            combined_statuses: HashMap::new(),
            status_contexts: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// `repos/{owner}/{name}` of the repository owning PRs and issues.
    pub(crate) fn target_path(&self) -> String {
        format!("repos/{}", self.config.target_repository())
    }

    /// `repos/{owner}/{name}` of the repository holding branches.
    pub(crate) fn repo_path(&self) -> String {
        format!("repos/{}", self.config.repository())
    }

    /// Fetch every node of `repository.<field>` following GraphQL cursors.
    /// `document` must declare `$owner`, `$name`, `$count` and `$cursor`.
    pub(crate) async fn query_nodes<T: DeserializeOwned>(
        &self,
        document: &str,
        field: &str,
        extra: Value,
    ) -> Result<Vec<T>, PlatformError> {
        let target = self.config.target_repository();
        let mut variables = json!({
            "owner": target.owner,
            "name": target.name,
            "count": GRAPH_PAGE_SIZE,
            "cursor": null,
        });
        if let (Some(vars), Some(extra)) = (variables.as_object_mut(), extra.as_object()) {
            vars.extend(extra.clone());
        }

        let mut nodes = Vec::new();
        loop {
            let mut data = self.remote.query(document, variables.clone()).await?;
            let connection: Connection<T> =
                serde_json::from_value(data["repository"][field].take())?;
            nodes.extend(connection.nodes);
            match connection.page_info {
                Some(PageInfo {
                    has_next_page: true,
                    end_cursor: Some(cursor),
                }) => variables["cursor"] = json!(cursor),
                _ => break,
            }
        }
        Ok(nodes)
    }

    /// Forget everything derived from the PR lists.
    pub(crate) fn invalidate_prs(&mut self) {
        self.open_prs = None;
        self.closed_prs = None;
        self.pr_list = None;
        self.branch_prs.clear();
    }
}
