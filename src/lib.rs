//! GitHub platform adapter for a dependency-update bot.
//!
//! [`github::PlatformClient`] opens cached [`github::RepoSession`]s on top of
//! a [`remote::RemoteClient`]; sessions expose idempotent reconciliation of
//! pull requests, issues, comments and commit statuses.

pub mod config;
pub mod error;
pub mod github;
pub mod remote;
pub mod report;
