use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::normalize::Nodes;
use super::types::{MergeMethod, RepoId, VulnerabilityAlert};
use super::{escape_ref, escape_segment, PlatformClient, RepoConfig, RepoSession};
use crate::error::PlatformError;
use crate::remote::{GetOptions, RemoteError};

const REPO_INFO_QUERY: &str = r#"
query($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    isFork
    isArchived
    nameWithOwner
    hasIssuesEnabled
    autoMergeAllowed
    mergeCommitAllowed
    rebaseMergeAllowed
    squashMergeAllowed
    defaultBranchRef {
      name
      target { oid }
    }
  }
}
"#;

const VULNERABILITY_ALERTS_QUERY: &str = r#"
query($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    vulnerabilityAlerts(last: 100) {
      nodes {
        dismissReason
        vulnerableManifestPath
        securityAdvisory { description severity }
        securityVulnerability {
          package { name ecosystem }
          firstPatchedVersion { identifier }
          vulnerableVersionRange
        }
      }
    }
  }
}
"#;

/// What the caller asks for when starting a repository pass.
#[derive(Debug, Clone, Default)]
pub struct RepoOptions {
    /// `owner/name`
    pub repository: String,
    pub fork_mode: bool,
    /// Consider PRs by any author as the bot's own.
    pub ignore_pr_author: bool,
    /// Process repositories that are themselves forks.
    pub include_forks: bool,
}

#[derive(Debug, Deserialize)]
struct RepoInfoData {
    repository: Option<RepoInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoInfo {
    #[serde(default)]
    is_fork: bool,
    #[serde(default)]
    is_archived: bool,
    name_with_owner: String,
    #[serde(default)]
    has_issues_enabled: bool,
    #[serde(default)]
    auto_merge_allowed: bool,
    #[serde(default)]
    merge_commit_allowed: bool,
    #[serde(default)]
    rebase_merge_allowed: bool,
    #[serde(default)]
    squash_merge_allowed: bool,
    default_branch_ref: Option<DefaultBranchRef>,
}

#[derive(Debug, Deserialize)]
struct DefaultBranchRef {
    name: String,
    target: Option<Target>,
}

#[derive(Debug, Deserialize)]
struct Target {
    oid: String,
}

impl RepoInfo {
    /// rebase > squash > merge; `None` when nothing is reported as allowed.
    fn merge_method(&self) -> Option<MergeMethod> {
        if self.rebase_merge_allowed {
            Some(MergeMethod::Rebase)
        } else if self.squash_merge_allowed {
            Some(MergeMethod::Squash)
        } else if self.merge_commit_allowed {
            Some(MergeMethod::Merge)
        } else {
            None
        }
    }
}

fn classify_init_error(err: RemoteError) -> PlatformError {
    let message = err.message();
    if message.contains("Repository access blocked") {
        return PlatformError::RepositoryBlocked;
    }
    if message.contains("Could not resolve to a Repository") {
        return PlatformError::RepositoryNotFound;
    }
    match err.status() {
        Some(403) | Some(451) => PlatformError::AccessForbidden,
        Some(404) => PlatformError::RepositoryNotFound,
        _ => PlatformError::Remote(err),
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct BranchProtection {
    reviews_required: bool,
    force_rebase: bool,
    push_protected: bool,
}

impl BranchProtection {
    fn from_json(body: &Value) -> Self {
        Self {
            reviews_required: !body["required_pull_request_reviews"].is_null(),
            force_rebase: body["required_status_checks"]["strict"].as_bool() == Some(true),
            push_protected: !body["restrictions"].is_null(),
        }
    }
}

impl PlatformClient {
    /// Start a processing pass for one repository.
    #[instrument(skip(self, options), fields(repository = %options.repository, fork_mode = options.fork_mode))]
    pub async fn init_repo(&mut self, options: RepoOptions) -> Result<RepoSession, PlatformError> {
        let repository: RepoId = options
            .repository
            .parse()
            .map_err(PlatformError::InvalidRepository)?;

        let data = self
            .remote
            .query(
                REPO_INFO_QUERY,
                json!({ "owner": repository.owner, "name": repository.name }),
            )
            .await
            .map_err(classify_init_error)?;
        let info = serde_json::from_value::<RepoInfoData>(data)?
            .repository
            .ok_or(PlatformError::RepositoryNotFound)?;

        if !repository.matches(&info.name_with_owner) {
            return Err(PlatformError::RepositoryRenamed(info.name_with_owner));
        }
        if info.is_archived {
            return Err(PlatformError::RepositoryArchived);
        }
        if info.is_fork && !options.fork_mode && !options.include_forks {
            return Err(PlatformError::RepositoryForked);
        }
        let default_branch = info
            .default_branch_ref
            .as_ref()
            .ok_or(PlatformError::EmptyRepository)?;

        let mut config = RepoConfig::new(repository.clone(), &default_branch.name);
        config.default_branch_sha = default_branch.target.as_ref().map(|t| t.oid.clone());
        config.merge_method = info.merge_method();
        config.auto_merge_allowed = info.auto_merge_allowed;
        config.issues_enabled = info.has_issues_enabled;
        config.username = self.settings.username.clone();
        config.git_author = self.settings.git_author.clone();
        config.ignore_pr_author = options.ignore_pr_author;
        config.fork_token = self.settings.fork_token.clone();
        match config.merge_method {
            Some(method) => debug!(%method, "detected merge method"),
            None => debug!("no merge method detected, will fall back per merge"),
        }

        let protection = self
            .branch_protection(&repository, &config.default_branch)
            .await;
        config.reviews_required = protection.reviews_required;
        config.force_rebase = protection.force_rebase;
        config.push_protected = protection.push_protected;

        if options.fork_mode {
            let fork = self.ensure_fork(&repository, &config).await?;
            config = config.into_fork(fork);
        }

        info!(
            repository = %config.repository(),
            default_branch = %config.default_branch,
            "repository initialized"
        );
        Ok(RepoSession::new(self.remote.clone(), config))
    }

    /// Best-effort read of the default branch's protection rules.
    async fn branch_protection(&self, repository: &RepoId, branch: &str) -> BranchProtection {
        let path = format!(
            "repos/{repository}/branches/{}/protection",
            escape_ref(branch)
        );
        match self.remote.get_json(&path, GetOptions::default()).await {
            Ok(body) => BranchProtection::from_json(&body),
            Err(err) if err.is_status(404) => {
                debug!("default branch is not protected");
                BranchProtection::default()
            }
            Err(err) if err.is_status(403) => {
                debug!("no permission to read branch protection");
                BranchProtection::default()
            }
            Err(err) => {
                warn!(error = %err, "failed to read branch protection");
                BranchProtection::default()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct AlertsData {
    repository: AlertsRepository,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertsRepository {
    vulnerability_alerts: Nodes<AlertNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertNode {
    dismiss_reason: Option<String>,
    vulnerable_manifest_path: Option<String>,
    security_advisory: Option<Advisory>,
    security_vulnerability: Option<Vulnerability>,
}

#[derive(Debug, Deserialize)]
struct Advisory {
    description: Option<String>,
    severity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Vulnerability {
    package: Package,
    first_patched_version: Option<PatchedVersion>,
    vulnerable_version_range: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Package {
    name: String,
    ecosystem: String,
}

#[derive(Debug, Deserialize)]
struct PatchedVersion {
    identifier: String,
}

impl RepoSession {
    pub fn get_repo_force_rebase(&self) -> bool {
        self.config.force_rebase
    }

    #[instrument(skip(self, assignees), fields(repository = %self.config.target_repository()))]
    pub async fn add_assignees(
        &self,
        number: u64,
        assignees: &[String],
    ) -> Result<(), PlatformError> {
        let path = format!("{}/issues/{number}/assignees", self.target_path());
        self.remote
            .post_json(&path, json!({ "assignees": assignees }), None)
            .await?;
        Ok(())
    }

    /// Request reviews; entries written `team:<slug>` become team reviewers.
    #[instrument(skip(self, reviewers), fields(repository = %self.config.target_repository()))]
    pub async fn add_reviewers(&self, number: u64, reviewers: &[String]) {
        let (teams, users): (Vec<&String>, Vec<&String>) =
            reviewers.iter().partition(|r| r.starts_with("team:"));
        let teams: Vec<&str> = teams
            .iter()
            .filter_map(|t| t.strip_prefix("team:"))
            .collect();
        let path = format!("{}/pulls/{number}/requested_reviewers", self.target_path());
        let body = json!({ "reviewers": users, "team_reviewers": teams });
        if let Err(err) = self.remote.post_json(&path, body, None).await {
            warn!(error = %err, "failed to add reviewers");
        }
    }

    pub async fn add_labels(&self, number: u64, labels: &[String]) {
        if labels.is_empty() {
            return;
        }
        let path = format!("{}/issues/{number}/labels", self.target_path());
        if let Err(err) = self
            .remote
            .post_json(&path, json!({ "labels": labels }), None)
            .await
        {
            warn!(error = %err, number, "failed to add labels");
        }
    }

    pub async fn delete_label(&self, number: u64, label: &str) {
        let path = format!(
            "{}/issues/{number}/labels/{}",
            self.target_path(),
            escape_segment(label)
        );
        if let Err(err) = self.remote.delete_json(&path, None).await {
            warn!(error = %err, number, label, "failed to delete label");
        }
    }

    /// Open (not dismissed) vulnerability alerts; empty when unavailable.
    #[instrument(skip(self), fields(repository = %self.config.target_repository()))]
    pub async fn get_vulnerability_alerts(&self) -> Vec<VulnerabilityAlert> {
        let target = self.config.target_repository();
        let variables = json!({ "owner": target.owner, "name": target.name });
        let data = match self.remote.query(VULNERABILITY_ALERTS_QUERY, variables).await {
            Ok(data) => data,
            Err(err) => {
                debug!(error = %err, "vulnerability alerts unavailable");
                return Vec::new();
            }
        };
        let alerts = match serde_json::from_value::<AlertsData>(data) {
            Ok(parsed) => parsed.repository.vulnerability_alerts.nodes,
            Err(err) => {
                warn!(error = %err, "unexpected vulnerability alerts payload");
                return Vec::new();
            }
        };

        alerts
            .into_iter()
            .filter(|a| a.dismiss_reason.is_none())
            .filter_map(|a| {
                let vulnerability = a.security_vulnerability?;
                Some(VulnerabilityAlert {
                    package_name: vulnerability.package.name,
                    ecosystem: vulnerability.package.ecosystem,
                    manifest_path: a.vulnerable_manifest_path,
                    vulnerable_range: vulnerability.vulnerable_version_range,
                    first_patched_version: vulnerability.first_patched_version.map(|p| p.identifier),
                    severity: a.security_advisory.as_ref().and_then(|s| s.severity.clone()),
                    description: a.security_advisory.and_then(|s| s.description),
                })
            })
            .collect()
    }

    /// Raw contents of a file, `None` when it does not exist.
    pub async fn get_raw_file(
        &self,
        file_name: &str,
        repository: Option<&RepoId>,
        branch: Option<&str>,
    ) -> Result<Option<String>, PlatformError> {
        let repository = repository.unwrap_or(self.config.repository());
        let mut path = format!("repos/{repository}/contents/{file_name}");
        if let Some(branch) = branch {
            path.push_str(&format!("?ref={}", escape_segment(branch)));
        }
        match self.remote.get_text(&path, GetOptions::default()).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.is_status(404) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_json_file(
        &self,
        file_name: &str,
        repository: Option<&RepoId>,
        branch: Option<&str>,
    ) -> Result<Option<Value>, PlatformError> {
        match self.get_raw_file(file_name, repository, branch).await? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::test_support;
    use crate::github::PlatformSettings;
    use crate::remote::fake::{FakeRemote, Method};
    use std::sync::Arc;

    fn repo_info(overrides: Value) -> Value {
        let mut repository = json!({
            "isFork": false,
            "isArchived": false,
            "nameWithOwner": "octo/widgets",
            "hasIssuesEnabled": true,
            "autoMergeAllowed": true,
            "mergeCommitAllowed": true,
            "rebaseMergeAllowed": false,
            "squashMergeAllowed": true,
            "defaultBranchRef": { "name": "main", "target": { "oid": "sha-main" } }
        });
        if let (Some(base), Some(extra)) = (repository.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        json!({ "repository": repository })
    }

    fn client(fake: &Arc<FakeRemote>) -> PlatformClient {
        PlatformClient::new(
            fake.clone(),
            PlatformSettings {
                username: Some("depbot".to_string()),
                ..PlatformSettings::default()
            },
        )
    }

    fn options(repository: &str) -> RepoOptions {
        RepoOptions {
            repository: repository.to_string(),
            ..RepoOptions::default()
        }
    }

    #[tokio::test]
    async fn test_init_repo_reads_settings() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query("isArchived", repo_info(json!({})));
        fake.on(
            Method::Get,
            "repos/octo/widgets/branches/main/protection",
            json!({
                "required_pull_request_reviews": { "required_approving_review_count": 1 },
                "required_status_checks": { "strict": true, "contexts": [] },
                "restrictions": null
            }),
        );

        let session = client(&fake).init_repo(options("octo/widgets")).await.unwrap();
        let config = session.config();
        assert_eq!(config.default_branch, "main");
        assert_eq!(config.default_branch_sha.as_deref(), Some("sha-main"));
        assert_eq!(config.merge_method, Some(MergeMethod::Squash));
        assert!(config.auto_merge_allowed);
        assert!(config.issues_enabled);
        assert!(config.reviews_required);
        assert!(session.get_repo_force_rebase());
        assert!(!config.push_protected);
        assert!(!config.fork_mode());
        assert_eq!(config.username.as_deref(), Some("depbot"));
    }

    #[tokio::test]
    async fn test_init_repo_merge_method_priority() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query("isArchived", repo_info(json!({ "rebaseMergeAllowed": true })));
        let session = client(&fake).init_repo(options("octo/widgets")).await.unwrap();
        assert_eq!(session.config().merge_method, Some(MergeMethod::Rebase));

        let fake = Arc::new(FakeRemote::new());
        fake.on_query(
            "isArchived",
            repo_info(json!({ "mergeCommitAllowed": false, "squashMergeAllowed": false })),
        );
        let session = client(&fake).init_repo(options("octo/widgets")).await.unwrap();
        assert_eq!(session.config().merge_method, None);
    }

    #[tokio::test]
    async fn test_init_repo_missing_protection_is_not_fatal() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query("isArchived", repo_info(json!({})));
        fake.on_status(
            Method::Get,
            "repos/octo/widgets/branches/main/protection",
            500,
            "Server Error",
        );
        let session = client(&fake).init_repo(options("octo/widgets")).await.unwrap();
        assert!(!session.config().reviews_required);
        assert!(!session.get_repo_force_rebase());
    }

    #[tokio::test]
    async fn test_init_repo_fatal_states() {
        let cases = [
            (json!({ "isArchived": true }), "archived"),
            (json!({ "nameWithOwner": "octo/gizmos" }), "renamed"),
            (json!({ "defaultBranchRef": null }), "empty"),
            (json!({ "isFork": true }), "forked"),
        ];
        for (overrides, label) in cases {
            let fake = Arc::new(FakeRemote::new());
            fake.on_query("isArchived", repo_info(overrides));
            let err = match client(&fake).init_repo(options("octo/widgets")).await {
                Err(err) => err,
                Ok(_) => panic!("{label}: expected failure"),
            };
            assert!(err.is_fatal_session(), "{label}: {err}");
            match label {
                "archived" => assert!(matches!(err, PlatformError::RepositoryArchived)),
                "renamed" => assert!(matches!(err, PlatformError::RepositoryRenamed(ref n) if n == "octo/gizmos")),
                "empty" => assert!(matches!(err, PlatformError::EmptyRepository)),
                _ => assert!(matches!(err, PlatformError::RepositoryForked)),
            }
        }
    }

    #[tokio::test]
    async fn test_init_repo_case_only_rename_is_accepted() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query("isArchived", repo_info(json!({ "nameWithOwner": "Octo/Widgets" })));
        assert!(client(&fake).init_repo(options("octo/widgets")).await.is_ok());
    }

    #[tokio::test]
    async fn test_init_repo_classifies_remote_failures() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query_status("isArchived", 403, "Forbidden");
        let err = client(&fake).init_repo(options("octo/widgets")).await.err().unwrap();
        assert!(matches!(err, PlatformError::AccessForbidden));

        let fake = Arc::new(FakeRemote::new());
        fake.on_query_status("isArchived", 451, "Unavailable For Legal Reasons");
        let err = client(&fake).init_repo(options("octo/widgets")).await.err().unwrap();
        assert!(matches!(err, PlatformError::AccessForbidden));

        let fake = Arc::new(FakeRemote::new());
        fake.on_query_status("isArchived", 404, "Not Found");
        let err = client(&fake).init_repo(options("octo/widgets")).await.err().unwrap();
        assert!(matches!(err, PlatformError::RepositoryNotFound));

        let fake = Arc::new(FakeRemote::new());
        fake.on_query_error("isArchived", "Repository access blocked");
        let err = client(&fake).init_repo(options("octo/widgets")).await.err().unwrap();
        assert!(matches!(err, PlatformError::RepositoryBlocked));

        let fake = Arc::new(FakeRemote::new());
        fake.on_query_status("isArchived", 502, "Bad Gateway");
        let err = client(&fake).init_repo(options("octo/widgets")).await.err().unwrap();
        assert!(matches!(err, PlatformError::Remote(_)));
        assert!(!err.is_fatal_session());

        let err = client(&fake).init_repo(options("not-a-repo")).await.err().unwrap();
        assert!(matches!(err, PlatformError::InvalidRepository(_)));
    }

    #[tokio::test]
    async fn test_add_reviewers_splits_teams() {
        let fake = Arc::new(FakeRemote::new());
        fake.on(Method::Post, "repos/octo/widgets/pulls/5/requested_reviewers", json!({}));
        let session = test_support::session(&fake, test_support::config());
        session
            .add_reviewers(5, &["alice".to_string(), "team:core".to_string()])
            .await;
        let calls = fake.calls(Method::Post, "repos/octo/widgets/pulls/5/requested_reviewers");
        assert_eq!(
            calls[0].body,
            Some(json!({ "reviewers": ["alice"], "team_reviewers": ["core"] }))
        );
    }

    #[tokio::test]
    async fn test_delete_label_failure_is_swallowed() {
        let fake = Arc::new(FakeRemote::new());
        let session = test_support::session(&fake, test_support::config());
        session.delete_label(5, "good first issue").await;
        assert_eq!(
            fake.count(Method::Delete, "repos/octo/widgets/issues/5/labels/good%20first%20issue"),
            1
        );
    }

    #[tokio::test]
    async fn test_vulnerability_alerts_skip_dismissed() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query(
            "vulnerabilityAlerts",
            json!({ "repository": { "vulnerabilityAlerts": { "nodes": [
                {
                    "dismissReason": null,
                    "vulnerableManifestPath": "Cargo.lock",
                    "securityAdvisory": { "description": "bad", "severity": "HIGH" },
                    "securityVulnerability": {
                        "package": { "name": "smallvec", "ecosystem": "RUST" },
                        "firstPatchedVersion": { "identifier": "1.6.1" },
                        "vulnerableVersionRange": "< 1.6.1"
                    }
                },
                {
                    "dismissReason": "tolerable_risk",
                    "vulnerableManifestPath": "Cargo.lock",
                    "securityAdvisory": null,
                    "securityVulnerability": {
                        "package": { "name": "time", "ecosystem": "RUST" },
                        "firstPatchedVersion": null,
                        "vulnerableVersionRange": "< 0.2.23"
                    }
                }
            ] } } }),
        );
        let session = test_support::session(&fake, test_support::config());
        let alerts = session.get_vulnerability_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].package_name, "smallvec");
        assert_eq!(alerts[0].first_patched_version.as_deref(), Some("1.6.1"));
        assert_eq!(alerts[0].severity.as_deref(), Some("HIGH"));
    }

    #[tokio::test]
    async fn test_vulnerability_alerts_error_is_empty() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query_error("vulnerabilityAlerts", "Resource not accessible by integration");
        let session = test_support::session(&fake, test_support::config());
        assert!(session.get_vulnerability_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_get_json_file() {
        let fake = Arc::new(FakeRemote::new());
        fake.on(
            Method::Get,
            "repos/octo/widgets/contents/renovate.json",
            Value::String(r#"{ "extends": ["config:base"] }"#.to_string()),
        );
        let session = test_support::session(&fake, test_support::config());
        let value = session
            .get_json_file("renovate.json", None, Some("main"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value["extends"][0], "config:base");
        assert!(session
            .get_raw_file("missing.json", None, None)
            .await
            .unwrap()
            .is_none());
    }
}
