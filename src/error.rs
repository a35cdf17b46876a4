use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Repository is empty (no default branch)")]
    EmptyRepository,

    #[error("Repository has been renamed to {0}")]
    RepositoryRenamed(String),

    #[error("Repository is archived")]
    RepositoryArchived,

    #[error("Repository is a fork and forks are not processed")]
    RepositoryForked,

    #[error("Access to repository is forbidden")]
    AccessForbidden,

    #[error("Repository not found")]
    RepositoryNotFound,

    #[error("Repository access is blocked")]
    RepositoryBlocked,

    #[error("Repository cannot be forked: {0}")]
    CannotFork(#[source] RemoteError),

    #[error("GitHub host error: {0}")]
    HostError(#[source] RemoteError),

    #[error("Repository changed underneath the bot")]
    RepositoryChanged,

    #[error("Invalid repository identifier: {0}")]
    InvalidRepository(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Failed to decode GitHub response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl PlatformError {
    /// Errors that end processing of the repository for this pass.
    pub fn is_fatal_session(&self) -> bool {
        matches!(
            self,
            PlatformError::EmptyRepository
                | PlatformError::RepositoryRenamed(_)
                | PlatformError::RepositoryArchived
                | PlatformError::RepositoryForked
                | PlatformError::AccessForbidden
                | PlatformError::RepositoryNotFound
                | PlatformError::RepositoryBlocked
                | PlatformError::CannotFork(_)
        )
    }

    /// The remote service itself looks unhealthy; callers should back off.
    pub fn is_host_error(&self) -> bool {
        matches!(self, PlatformError::HostError(_))
    }
}
