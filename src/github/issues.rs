use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::types::{IssueRecord, IssueState};
use super::RepoSession;
use crate::error::PlatformError;
use crate::remote::GetOptions;

const ISSUES_QUERY: &str = r#"
query($owner: String!, $name: String!, $user: String, $count: Int!, $cursor: String) {
  repository(owner: $owner, name: $name) {
    issues(orderBy: {field: UPDATED_AT, direction: DESC}, filterBy: {createdBy: $user}, first: $count, after: $cursor) {
      pageInfo { hasNextPage endCursor }
      nodes { number state title }
    }
  }
}
"#;

/// Desired state of a recurring issue (e.g. the dependency dashboard).
#[derive(Debug, Clone)]
pub struct EnsureIssue {
    pub title: String,
    /// Previous title to adopt when no issue carries `title` yet.
    pub reuse_title: Option<String>,
    pub body: String,
    pub labels: Option<Vec<String>>,
    /// A closed issue stays closed forever.
    pub once: bool,
    pub should_reopen: bool,
}

impl EnsureIssue {
    pub fn new(title: &str, body: &str) -> Self {
        Self {
            title: title.to_string(),
            reuse_title: None,
            body: body.to_string(),
            labels: None,
            once: false,
            should_reopen: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IssueAction {
    Nothing,
    Create,
    Update,
}

/// The issue picked as the one to keep, if any.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    state: IssueState,
    /// Title and body already match and the issue is open.
    up_to_date: bool,
}

fn decide(candidate: Option<Candidate>, once: bool, should_reopen: bool) -> IssueAction {
    use IssueState::{Closed, Open};
    match (candidate.map(|c| (c.state, c.up_to_date)), once, should_reopen) {
        (None, _, _) => IssueAction::Create,
        (Some((Closed, _)), true, _) => IssueAction::Nothing,
        (Some((Open, true)), _, _) => IssueAction::Nothing,
        (Some((Open, false)), _, _) => IssueAction::Update,
        (Some((Closed, _)), false, true) => IssueAction::Update,
        (Some((Closed, _)), false, false) => IssueAction::Create,
    }
}

fn issues_disabled(err: &PlatformError) -> bool {
    matches!(err, PlatformError::Remote(e) if e.message().starts_with("Issues are disabled for this repo"))
}

impl RepoSession {
    /// Issues opened by the bot (body not included).
    pub async fn get_issue_list(&mut self) -> Result<Vec<IssueRecord>, PlatformError> {
        if let Some(list) = &self.issue_list {
            return Ok(list.clone());
        }
        let issues: Vec<IssueRecord> = self
            .query_nodes(
                ISSUES_QUERY,
                "issues",
                json!({ "user": self.config.username }),
            )
            .await?;
        debug!(count = issues.len(), "retrieved issue list");
        self.issue_list = Some(issues.clone());
        Ok(issues)
    }

    /// Fetch a single issue including its body.
    pub async fn get_issue(&self, number: u64) -> Result<Option<IssueRecord>, PlatformError> {
        if !self.config.issues_enabled {
            return Ok(None);
        }
        let path = format!("{}/issues/{number}", self.target_path());
        match self.remote.get_json(&path, GetOptions::fresh()).await {
            Ok(body) => Ok(Some(serde_json::from_value(body)?)),
            Err(err) if err.is_status(404) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Open bot issue titled `title`, with its body.
    pub async fn find_issue(&mut self, title: &str) -> Result<Option<IssueRecord>, PlatformError> {
        let list = self.get_issue_list().await?;
        match list
            .iter()
            .find(|i| i.state == IssueState::Open && i.title == title)
        {
            Some(issue) => self.get_issue(issue.number).await,
            None => Ok(None),
        }
    }

    /// Make sure exactly one open issue titled `request.title` carries
    /// `request.body`. Failures are logged, never returned.
    #[instrument(skip(self, request), fields(repository = %self.config.target_repository(), title = %request.title))]
    pub async fn ensure_issue(&mut self, request: EnsureIssue) -> Option<IssueOutcome> {
        if !self.config.issues_enabled {
            debug!("issues are disabled, skipping");
            return None;
        }
        match self.reconcile_issue(&request).await {
            Ok(outcome) => outcome,
            Err(err) if issues_disabled(&err) => {
                debug!("issues are disabled for this repository");
                None
            }
            Err(err) => {
                warn!(error = %err, "could not ensure issue");
                None
            }
        }
    }

    async fn reconcile_issue(
        &mut self,
        request: &EnsureIssue,
    ) -> Result<Option<IssueOutcome>, PlatformError> {
        let issues = self.get_issue_list().await?;
        let mut matching: Vec<&IssueRecord> =
            issues.iter().filter(|i| i.title == request.title).collect();
        if matching.is_empty() {
            if let Some(reuse) = &request.reuse_title {
                matching = issues.iter().filter(|i| &i.title == reuse).collect();
            }
        }

        let keep = matching
            .iter()
            .find(|i| i.state == IssueState::Open)
            .or_else(|| matching.iter().max_by_key(|i| i.number))
            .copied();

        let mut candidate = None;
        if let Some(keep) = keep {
            for duplicate in matching
                .iter()
                .filter(|i| i.state == IssueState::Open && i.number != keep.number)
            {
                info!(number = duplicate.number, "closing duplicate issue");
                self.close_issue(duplicate.number).await?;
                self.issue_list = None;
            }

            let up_to_date = keep.state == IssueState::Open
                && keep.title == request.title
                && self
                    .get_issue(keep.number)
                    .await?
                    .and_then(|full| full.body)
                    .as_deref()
                    == Some(request.body.as_str());
            candidate = Some(Candidate {
                state: keep.state,
                up_to_date,
            });
        }

        match decide(candidate, request.once, request.should_reopen) {
            IssueAction::Nothing => {
                debug!("issue is up to date");
                Ok(None)
            }
            IssueAction::Update => {
                let Some(keep) = keep else {
                    return Ok(None);
                };
                let mut body = json!({
                    "title": request.title,
                    "body": request.body,
                    "state": "open",
                });
                if let Some(labels) = &request.labels {
                    body["labels"] = json!(labels);
                }
                let path = format!("{}/issues/{}", self.target_path(), keep.number);
                self.remote.patch_json(&path, body, None).await?;
                info!(number = keep.number, "updated issue");
                self.issue_list = None;
                Ok(Some(IssueOutcome::Updated))
            }
            IssueAction::Create => {
                let mut body = json!({ "title": request.title, "body": request.body });
                if let Some(labels) = &request.labels {
                    body["labels"] = json!(labels);
                }
                let path = format!("{}/issues", self.target_path());
                self.remote.post_json(&path, body, None).await?;
                info!("created issue");
                self.issue_list = None;
                Ok(Some(IssueOutcome::Created))
            }
        }
    }

    async fn close_issue(&self, number: u64) -> Result<(), PlatformError> {
        let path = format!("{}/issues/{number}", self.target_path());
        self.remote
            .patch_json(&path, json!({ "state": "closed" }), None)
            .await?;
        Ok(())
    }

    /// Close every open bot issue titled `title`.
    #[instrument(skip(self), fields(repository = %self.config.target_repository()))]
    pub async fn ensure_issue_closing(&mut self, title: &str) -> Result<(), PlatformError> {
        if !self.config.issues_enabled {
            return Ok(());
        }
        let issues = self.get_issue_list().await?;
        let mut closed_any = false;
        for issue in issues
            .iter()
            .filter(|i| i.state == IssueState::Open && i.title == title)
        {
            info!(number = issue.number, "closing issue");
            self.close_issue(issue.number).await?;
            closed_any = true;
        }
        if closed_any {
            self.issue_list = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::test_support;
    use crate::remote::fake::{FakeRemote, Method};
    use serde_json::Value;
    use std::sync::Arc;

    fn issue_nodes(nodes: Vec<Value>) -> Value {
        json!({ "repository": { "issues": { "nodes": nodes } } })
    }

    fn node(number: u64, state: &str, title: &str) -> Value {
        json!({ "number": number, "state": state, "title": title })
    }

    fn rest_issue(number: u64, title: &str, body: &str) -> Value {
        json!({ "number": number, "title": title, "body": body, "state": "open" })
    }

    #[test]
    fn test_decision_table() {
        let open = |up_to_date| Some(Candidate { state: IssueState::Open, up_to_date });
        let closed = Some(Candidate { state: IssueState::Closed, up_to_date: false });

        assert_eq!(decide(None, false, true), IssueAction::Create);
        assert_eq!(decide(None, true, false), IssueAction::Create);
        assert_eq!(decide(open(true), false, true), IssueAction::Nothing);
        assert_eq!(decide(open(false), false, false), IssueAction::Update);
        assert_eq!(decide(closed, true, true), IssueAction::Nothing);
        assert_eq!(decide(closed, false, true), IssueAction::Update);
        assert_eq!(decide(closed, false, false), IssueAction::Create);
    }

    #[tokio::test]
    async fn test_ensure_issue_is_idempotent() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query("issues(", issue_nodes(vec![]))
            .on_query("issues(", issue_nodes(vec![node(1, "OPEN", "Dashboard")]))
            .on(Method::Post, "repos/octo/widgets/issues", json!({ "number": 1 }))
            .on(
                Method::Get,
                "repos/octo/widgets/issues/1",
                rest_issue(1, "Dashboard", "all good"),
            );
        let mut session = test_support::session(&fake, test_support::config());

        let mut request = EnsureIssue::new("Dashboard", "all good");
        request.labels = Some(vec!["dashboard".to_string()]);
        assert_eq!(
            session.ensure_issue(request.clone()).await,
            Some(IssueOutcome::Created)
        );
        assert_eq!(session.ensure_issue(request).await, None);

        assert_eq!(fake.mutations().len(), 1);
        let created = &fake.calls(Method::Post, "repos/octo/widgets/issues")[0];
        assert_eq!(
            created.body,
            Some(json!({ "title": "Dashboard", "body": "all good", "labels": ["dashboard"] }))
        );
    }

    #[tokio::test]
    async fn test_ensure_issue_updates_changed_body_and_closes_duplicates() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query(
            "issues(",
            issue_nodes(vec![
                node(3, "OPEN", "Dashboard"),
                node(5, "OPEN", "Dashboard"),
                node(2, "CLOSED", "Dashboard"),
            ]),
        )
        .on(Method::Get, "repos/octo/widgets/issues/3", rest_issue(3, "Dashboard", "old"))
        .on(Method::Patch, "repos/octo/widgets/issues/5", json!({}))
        .on(Method::Patch, "repos/octo/widgets/issues/3", json!({}));
        let mut session = test_support::session(&fake, test_support::config());

        let outcome = session
            .ensure_issue(EnsureIssue::new("Dashboard", "new"))
            .await;
        assert_eq!(outcome, Some(IssueOutcome::Updated));
        assert_eq!(
            fake.calls(Method::Patch, "repos/octo/widgets/issues/5")[0].body,
            Some(json!({ "state": "closed" }))
        );
        assert_eq!(
            fake.calls(Method::Patch, "repos/octo/widgets/issues/3")[0].body,
            Some(json!({ "title": "Dashboard", "body": "new", "state": "open" }))
        );
        assert_eq!(fake.count(Method::Patch, "repos/octo/widgets/issues/2"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_is_closed_only_once() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query(
            "issues(",
            issue_nodes(vec![node(3, "OPEN", "Dashboard"), node(5, "OPEN", "Dashboard")]),
        )
        .on_query(
            "issues(",
            issue_nodes(vec![node(3, "OPEN", "Dashboard"), node(5, "CLOSED", "Dashboard")]),
        )
        .on(Method::Get, "repos/octo/widgets/issues/3", rest_issue(3, "Dashboard", "same"))
        .on(Method::Patch, "repos/octo/widgets/issues/5", json!({}));
        let mut session = test_support::session(&fake, test_support::config());

        let request = EnsureIssue::new("Dashboard", "same");
        assert_eq!(session.ensure_issue(request.clone()).await, None);
        assert_eq!(session.ensure_issue(request).await, None);

        assert_eq!(fake.count(Method::Patch, "repos/octo/widgets/issues/5"), 1);
        assert_eq!(fake.count(Method::Patch, "repos/octo/widgets/issues/3"), 0);
    }

    #[tokio::test]
    async fn test_ensure_issue_once_keeps_closed_issue_closed() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query("issues(", issue_nodes(vec![node(4, "CLOSED", "Dashboard")]));
        let mut session = test_support::session(&fake, test_support::config());

        let mut request = EnsureIssue::new("Dashboard", "body");
        request.once = true;
        assert_eq!(session.ensure_issue(request).await, None);
        assert!(fake.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_issue_reopens_most_recent_closed() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query(
            "issues(",
            issue_nodes(vec![node(4, "CLOSED", "Dashboard"), node(9, "CLOSED", "Dashboard")]),
        )
        .on(Method::Patch, "repos/octo/widgets/issues/9", json!({}));
        let mut session = test_support::session(&fake, test_support::config());

        let outcome = session.ensure_issue(EnsureIssue::new("Dashboard", "body")).await;
        assert_eq!(outcome, Some(IssueOutcome::Updated));
        assert_eq!(fake.count(Method::Patch, "repos/octo/widgets/issues/9"), 1);
        assert_eq!(fake.count(Method::Patch, "repos/octo/widgets/issues/4"), 0);
    }

    #[tokio::test]
    async fn test_ensure_issue_without_reopen_creates_new() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query("issues(", issue_nodes(vec![node(4, "CLOSED", "Dashboard")]))
            .on(Method::Post, "repos/octo/widgets/issues", json!({ "number": 10 }));
        let mut session = test_support::session(&fake, test_support::config());

        let mut request = EnsureIssue::new("Dashboard", "body");
        request.should_reopen = false;
        assert_eq!(session.ensure_issue(request).await, Some(IssueOutcome::Created));
        assert_eq!(fake.count(Method::Patch, "repos/octo/widgets/issues/4"), 0);
    }

    #[tokio::test]
    async fn test_ensure_issue_adopts_reuse_title() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query("issues(", issue_nodes(vec![node(6, "OPEN", "Old dashboard")]))
            .on(Method::Get, "repos/octo/widgets/issues/6", rest_issue(6, "Old dashboard", "body"))
            .on(Method::Patch, "repos/octo/widgets/issues/6", json!({}));
        let mut session = test_support::session(&fake, test_support::config());

        let mut request = EnsureIssue::new("Dashboard", "body");
        request.reuse_title = Some("Old dashboard".to_string());
        assert_eq!(session.ensure_issue(request).await, Some(IssueOutcome::Updated));
        let patch = &fake.calls(Method::Patch, "repos/octo/widgets/issues/6")[0];
        assert_eq!(patch.body.as_ref().unwrap()["title"], "Dashboard");
    }

    #[tokio::test]
    async fn test_ensure_issue_disabled() {
        let fake = Arc::new(FakeRemote::new());
        let mut config = test_support::config();
        config.issues_enabled = false;
        let mut session = test_support::session(&fake, config);
        assert_eq!(session.ensure_issue(EnsureIssue::new("T", "B")).await, None);
        assert!(fake.mutations().is_empty());

        let fake = Arc::new(FakeRemote::new());
        fake.on_query("issues(", issue_nodes(vec![]))
            .on_status(
                Method::Post,
                "repos/octo/widgets/issues",
                410,
                "Issues are disabled for this repo",
            );
        let mut session = test_support::session(&fake, test_support::config());
        assert_eq!(session.ensure_issue(EnsureIssue::new("T", "B")).await, None);
    }

    #[tokio::test]
    async fn test_ensure_issue_closing() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query(
            "issues(",
            issue_nodes(vec![node(1, "OPEN", "Dashboard"), node(2, "CLOSED", "Dashboard")]),
        )
        .on(Method::Patch, "repos/octo/widgets/issues/1", json!({}));
        let mut session = test_support::session(&fake, test_support::config());
        session.ensure_issue_closing("Dashboard").await.unwrap();
        assert_eq!(fake.mutations().len(), 1);
        assert!(session.issue_list.is_none());
    }

    #[tokio::test]
    async fn test_find_issue_fetches_body() {
        let fake = Arc::new(FakeRemote::new());
        fake.on_query("issues(", issue_nodes(vec![node(1, "OPEN", "Dashboard")]))
            .on(Method::Get, "repos/octo/widgets/issues/1", rest_issue(1, "Dashboard", "text"));
        let mut session = test_support::session(&fake, test_support::config());
        let issue = session.find_issue("Dashboard").await.unwrap().unwrap();
        assert_eq!(issue.body.as_deref(), Some("text"));
        assert!(session.find_issue("Other").await.unwrap().is_none());
    }
}
