//! Read-only version-control adapter.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::manifest::GitState;
use crate::paths::normalize_relative_str;

/// Queries the change detector needs from version control.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Whether the version-control tool can be run at all.
    async fn is_available(&self) -> bool;

    /// Whether `root` is inside a repository.
    async fn is_repo(&self, root: &Path) -> bool;

    async fn current_branch(&self, root: &Path) -> Result<String>;

    async fn current_commit(&self, root: &Path) -> Result<String>;

    /// Paths that differ between two commits, relative to `root`.
    async fn changed_files(&self, root: &Path, from: &str, to: &str) -> Result<Vec<String>>;
}

impl GitState {
    /// Capture the current branch/commit, `None` when version control is unusable.
    pub async fn capture(vcs: &dyn VersionControl, root: &Path) -> Option<GitState> {
        if !vcs.is_available().await || !vcs.is_repo(root).await {
            return None;
        }
        let branch = vcs.current_branch(root).await.ok()?;
        let commit = vcs.current_commit(root).await.ok()?;
        Some(GitState::new(branch, commit))
    }
}

/// [`VersionControl`] backed by the `git` executable.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(root: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(root)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to spawn git {}", args.join(" ")))?;

        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn is_available(&self) -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn is_repo(&self, root: &Path) -> bool {
        Self::run(root, &["rev-parse", "--is-inside-work-tree"])
            .await
            .map(|out| out == "true")
            .unwrap_or(false)
    }

    async fn current_branch(&self, root: &Path) -> Result<String> {
        Self::run(root, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    async fn current_commit(&self, root: &Path) -> Result<String> {
        Self::run(root, &["rev-parse", "HEAD"]).await
    }

    async fn changed_files(&self, root: &Path, from: &str, to: &str) -> Result<Vec<String>> {
        let range = format!("{}..{}", from, to);
        let out = Self::run(root, &["diff", "--name-only", "--relative", &range]).await?;
        let files: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(normalize_relative_str)
            .collect();
        debug!("git diff {} touched {} paths", range, files.len());
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_plain_directory_is_not_a_repo() {
        let dir = tempdir().unwrap();
        let git = GitCli::new();
        // Holds whether or not git is installed
        assert!(!git.is_repo(dir.path()).await);
        assert!(GitState::capture(&git, dir.path()).await.is_none());
    }

    #[tokio::test]
    async fn test_diff_outside_repo_fails() {
        let dir = tempdir().unwrap();
        let git = GitCli::new();
        assert!(git.changed_files(dir.path(), "a", "b").await.is_err());
    }
}
