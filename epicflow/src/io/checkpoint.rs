//! Transactional pipeline steps on top of git.
//!
//! After any step the working tree is either fully advanced and committed, or
//! byte-for-byte what it was before the step started.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::git::Git;

/// Result of rolling back to a checkpoint; both halves are attempted even if
/// the first fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    pub reset_ok: bool,
    pub clean_ok: bool,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    git: Git,
}

impl CheckpointManager {
    pub fn new(git: Git) -> Self {
        Self { git }
    }

    /// Record HEAD before a step begins.
    pub fn capture_checkpoint(&self) -> Result<String> {
        let sha = self.git.head_sha().context("capture checkpoint")?;
        debug!(checkpoint = %sha, "checkpoint captured");
        Ok(sha)
    }

    /// Stage everything and commit; returns `false` when there was nothing to commit.
    #[instrument(skip_all)]
    pub fn commit_if_dirty(&self, message: &str) -> Result<bool> {
        self.git.add_all()?;
        let committed = self.git.commit_staged(message)?;
        if committed {
            info!(message, "committed step");
        }
        Ok(committed)
    }

    /// Hard-reset tracked files to `checkpoint` and remove untracked files.
    #[instrument(skip_all, fields(checkpoint = %checkpoint))]
    pub fn reset_and_clean(&self, checkpoint: &str) -> ResetOutcome {
        let reset_ok = match self.git.reset_hard(checkpoint) {
            Ok(()) => true,
            Err(err) => {
                warn!(err = %err, "git reset failed");
                false
            }
        };
        let clean_ok = match self.git.clean_untracked() {
            Ok(()) => true,
            Err(err) => {
                warn!(err = %err, "git clean failed");
                false
            }
        };
        info!(checkpoint, reset_ok, clean_ok, "rolled back to checkpoint");
        ResetOutcome { reset_ok, clean_ok }
    }
}
