use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::github::{PlatformSettings, RepoOptions};

pub const DEFAULT_ENDPOINT: &str = "https://api.github.com/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration loaded from .depbot.toml.
///
/// Every field is optional; a token from the environment is enough to run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github: GitHubConfig,

    #[serde(default)]
    pub bot: BotConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitHubConfig {
    /// GitHub API token. If None, falls back to GITHUB_TOKEN env var.
    pub token: Option<String>,
    /// REST endpoint, e.g. `https://ghe.example.com/api/v3/` for Enterprise.
    pub endpoint: Option<String>,
    /// Token used to create and push to forks. Falls back to DEPBOT_FORK_TOKEN.
    pub fork_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotConfig {
    /// Login the bot acts as; detected from the token when unset.
    pub username: Option<String>,
    /// `Name <email>` used for commits; detected when unset.
    pub git_author: Option<String>,
    #[serde(default)]
    pub fork_mode: bool,
    /// Treat PRs from any author as the bot's own.
    #[serde(default)]
    pub ignore_pr_author: bool,
    /// Process repositories that are themselves forks.
    #[serde(default)]
    pub include_forks: bool,
}

impl Config {
    /// Load configuration from .depbot.toml in the current directory.
    /// Returns default config if the file doesn't exist.
    pub fn load() -> Result<Config, ConfigError> {
        let path = Path::new(".depbot.toml");
        let mut config = if path.exists() {
            Self::load_from(path)?
        } else {
            Config::default()
        };

        if config.github.token.is_none() {
            config.github.token = std::env::var("GITHUB_TOKEN").ok();
        }
        if config.github.fork_token.is_none() {
            config.github.fork_token = std::env::var("DEPBOT_FORK_TOKEN").ok();
        }

        Ok(config)
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Resolve the GitHub token: config file value takes precedence,
    /// falls back to GITHUB_TOKEN env var.
    pub fn github_token(&self) -> Option<String> {
        self.github
            .token
            .clone()
            .or_else(|| std::env::var("GITHUB_TOKEN").ok())
    }

    pub fn fork_token(&self) -> Option<String> {
        self.github
            .fork_token
            .clone()
            .or_else(|| std::env::var("DEPBOT_FORK_TOKEN").ok())
    }

    pub fn endpoint(&self) -> &str {
        self.github.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT)
    }

    pub fn platform_settings(&self) -> PlatformSettings {
        PlatformSettings {
            username: self.bot.username.clone(),
            git_author: self.bot.git_author.clone(),
            fork_token: self.fork_token(),
        }
    }

    /// Session options for `repository`; `force_fork` turns fork mode on
    /// regardless of the file.
    pub fn repo_options(&self, repository: &str, force_fork: bool) -> RepoOptions {
        RepoOptions {
            repository: repository.to_string(),
            fork_mode: self.bot.fork_mode || force_fork,
            ignore_pr_author: self.bot.ignore_pr_author,
            include_forks: self.bot.include_forks,
        }
    }
}
