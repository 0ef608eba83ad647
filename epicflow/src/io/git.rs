//! Git adapter for pipeline steps.
//!
//! Every step is committed or rolled back through git, so we keep a small,
//! explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Resolve the top level of the repository containing `workdir`.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self
            .run_capture(&["rev-parse", "--show-toplevel"])
            .with_context(|| format!("{} is not inside a git repository", self.workdir.display()))?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Return the current branch name (errors on detached HEAD).
    ///
    /// Works on an unborn branch, where HEAD names a branch with no commits.
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let args = ["symbolic-ref", "--quiet", "--short", "HEAD"];
        let output = self.run(&args)?;
        match output.status.code() {
            Some(0) => {}
            Some(1) => {
                warn!("detached HEAD detected");
                return Err(anyhow!("detached HEAD (refuse to run)"));
            }
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
            }
        }
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// True if there are tracked modifications or untracked files.
    #[cfg(any(test, feature = "test-support"))]
    pub fn is_dirty(&self) -> Result<bool> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        Ok(!out.trim().is_empty())
    }

    /// Run an arbitrary git command and return its stdout.
    #[cfg(any(test, feature = "test-support"))]
    pub fn run_raw(&self, args: &[&str]) -> Result<String> {
        self.run_capture(args)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Hard-reset tracked files (and the index) to `commit`.
    #[instrument(skip_all, fields(commit))]
    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        debug!(commit, "resetting working tree");
        self.run_checked(&["reset", "--hard", commit])?;
        Ok(())
    }

    /// Remove untracked files and directories (ignored files are kept).
    #[instrument(skip_all)]
    pub fn clean_untracked(&self) -> Result<()> {
        debug!("removing untracked files");
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
