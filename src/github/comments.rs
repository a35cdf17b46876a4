use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::types::CommentRecord;
use super::RepoSession;
use crate::error::PlatformError;
use crate::remote::GetOptions;

/// How a bot comment is recognised on a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentTarget {
    /// Body starts with the `### {topic}` header.
    Topic(String),
    /// Body equals this text; removal ignores surrounding whitespace.
    Content(String),
}

impl CommentTarget {
    /// Lookup used when writing: content must match the whole body exactly.
    fn matches_exactly(&self, comment: &CommentRecord) -> bool {
        match self {
            CommentTarget::Topic(topic) => comment.body.starts_with(&topic_header(topic)),
            CommentTarget::Content(content) => comment.body == *content,
        }
    }

    /// Lookup used when removing: surrounding whitespace is ignored.
    fn matches_trimmed(&self, comment: &CommentRecord) -> bool {
        match self {
            CommentTarget::Topic(_) => self.matches_exactly(comment),
            CommentTarget::Content(content) => comment.body.trim() == content.trim(),
        }
    }
}

fn topic_header(topic: &str) -> String {
    format!("### {topic}\n\n")
}

fn is_locked(err: &PlatformError) -> bool {
    matches!(err, PlatformError::Remote(e) if e.message().contains("Unable to create comment because issue is locked"))
}

impl RepoSession {
    /// All comments on issue or PR `number`, oldest first.
    pub async fn get_comments(&self, number: u64) -> Result<Vec<CommentRecord>, PlatformError> {
        let path = format!("{}/issues/{number}/comments?per_page=100", self.target_path());
        let options = GetOptions {
            no_cache: true,
            ..GetOptions::paginated()
        };
        let body = self.remote.get_json(&path, options).await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Make sure the thread carries exactly this comment. With a `topic` the
    /// comment is found by its header and rewritten in place; without one an
    /// identical comment is looked for.
    ///
    /// Returns false only when the comment could not be written.
    #[instrument(skip(self, content), fields(repository = %self.config.target_repository()))]
    pub async fn ensure_comment(&self, number: u64, topic: Option<&str>, content: &str) -> bool {
        match self.reconcile_comment(number, topic, content).await {
            Ok(()) => true,
            Err(err) if is_locked(&err) => {
                debug!(number, "issue is locked, comment skipped");
                false
            }
            Err(err) => {
                warn!(error = %err, number, "could not ensure comment");
                false
            }
        }
    }

    async fn reconcile_comment(
        &self,
        number: u64,
        topic: Option<&str>,
        content: &str,
    ) -> Result<(), PlatformError> {
        let (target, body) = match topic {
            Some(topic) => (
                CommentTarget::Topic(topic.to_string()),
                format!("{}{content}", topic_header(topic)),
            ),
            None => (CommentTarget::Content(content.to_string()), content.to_string()),
        };
        let comments = self.get_comments(number).await?;

        match comments.iter().find(|c| target.matches_exactly(c)) {
            Some(existing) if existing.body == body => {
                debug!(number, id = existing.id, "comment is up to date");
            }
            Some(existing) => {
                let path = format!("{}/issues/comments/{}", self.target_path(), existing.id);
                self.remote
                    .patch_json(&path, json!({ "body": body }), None)
                    .await?;
                info!(number, id = existing.id, "updated comment");
            }
            None => {
                let path = format!("{}/issues/{number}/comments", self.target_path());
                self.remote
                    .post_json(&path, json!({ "body": body }), None)
                    .await?;
                info!(number, "added comment");
            }
        }
        Ok(())
    }

    /// Delete the first comment on `number` matching `target`, if any.
    #[instrument(skip(self), fields(repository = %self.config.target_repository()))]
    pub async fn ensure_comment_removal(
        &self,
        number: u64,
        target: CommentTarget,
    ) -> Result<(), PlatformError> {
        let comments = self.get_comments(number).await?;
        let Some(comment) = comments.iter().find(|c| target.matches_trimmed(c)) else {
            debug!(number, "no matching comment to remove");
            return Ok(());
        };
        let path = format!("{}/issues/comments/{}", self.target_path(), comment.id);
        self.remote.delete_json(&path, None).await?;
        info!(number, id = comment.id, "removed comment");
        Ok(())
    }
}
