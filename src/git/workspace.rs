use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

/// Git operations the cycle loop needs on the project checkout
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    repo_root: PathBuf,
}

impl GitWorkspace {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.repo_root
    }

    /// Check if this is a git repository
    pub fn is_git_repo(&self) -> bool {
        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&self.repo_root)
            .output();

        matches!(output, Ok(o) if o.status.success())
    }

    /// Short hash of HEAD
    pub fn head_commit(&self) -> Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.repo_root)
            .output()
            .context("Failed to execute git rev-parse")?;

        if !output.status.success() {
            bail!("Failed to resolve HEAD");
        }

        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(hash.chars().take(8).collect())
    }

    /// Check for uncommitted or untracked changes
    pub fn has_changes(&self) -> Result<bool> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.repo_root)
            .output()
            .context("Failed to execute git status")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(!stdout.trim().is_empty())
    }

    /// Throw away everything since HEAD, untracked files included
    pub fn rollback(&self) -> Result<()> {
        let reset = Command::new("git")
            .args(["reset", "--hard", "HEAD"])
            .current_dir(&self.repo_root)
            .output()
            .context("Failed to execute git reset")?;

        if !reset.status.success() {
            let stderr = String::from_utf8_lossy(&reset.stderr);
            bail!("git reset failed: {}", stderr.trim());
        }

        let clean = Command::new("git")
            .args(["clean", "-fd"])
            .current_dir(&self.repo_root)
            .output()
            .context("Failed to execute git clean")?;

        if !clean.status.success() {
            let stderr = String::from_utf8_lossy(&clean.stderr);
            bail!("git clean failed: {}", stderr.trim());
        }

        Ok(())
    }
}
