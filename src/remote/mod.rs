pub mod http;
#[cfg(test)]
pub mod fake;

pub use http::HttpClient;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("GitHub API returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("GraphQL error: {0}")]
    Graph(String),

    #[error("GitHub API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode GitHub response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),
}

impl RemoteError {
    /// HTTP status of the failed request, if the remote answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            RemoteError::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Remote-provided message (or the rendered error when there is none).
    pub fn message(&self) -> String {
        match self {
            RemoteError::Status { message, .. } => message.clone(),
            RemoteError::Graph(message) => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_status(&self, code: u16) -> bool {
        self.status() == Some(code)
    }
}

/// Options for read requests.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Skip the client-side response cache.
    pub no_cache: bool,
    /// Follow every `Link: rel="next"` page and concatenate array bodies.
    pub paginate: bool,
    pub headers: Vec<(String, String)>,
    /// Token overriding the client's default credentials.
    pub token: Option<String>,
}

impl GetOptions {
    pub fn paginated() -> Self {
        Self {
            paginate: true,
            ..Self::default()
        }
    }

    pub fn fresh() -> Self {
        Self {
            no_cache: true,
            ..Self::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_token(mut self, token: Option<&str>) -> Self {
        self.token = token.map(str::to_string);
        self
    }
}

/// Authenticated access to the GitHub REST and GraphQL APIs.
///
/// Paths are relative to the configured API endpoint (`repos/o/r/pulls`).
/// Reads may be cached or retried by implementations; mutations never are.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Run a GraphQL document and return its `data` object.
    async fn query(&self, document: &str, variables: Value) -> Result<Value, RemoteError>;

    async fn get_json(&self, path: &str, options: GetOptions) -> Result<Value, RemoteError>;

    /// Fetch a raw (non-JSON) body, e.g. file contents.
    async fn get_text(&self, path: &str, options: GetOptions) -> Result<String, RemoteError>;

    async fn post_json(
        &self,
        path: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, RemoteError>;

    async fn patch_json(
        &self,
        path: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, RemoteError>;

    async fn put_json(
        &self,
        path: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, RemoteError>;

    async fn delete_json(&self, path: &str, token: Option<&str>) -> Result<(), RemoteError>;
}
