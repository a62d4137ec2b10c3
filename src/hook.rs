//! Contains the [`PipelineHook`] middleware contract and the ordered
//! [`HookChain`] the store applies around its read and write paths.

use std::sync::Arc;

use crate::commit::{Commit, CommitAttempt};

/// User-supplied middleware invoked around reads and writes.
///
/// All three operations default to pass-through, so implementations only
/// override the paths they care about.
pub trait PipelineHook<Id, T>: Send + Sync {
    /// Transforms or drops a commit on the read path. Returning `None`
    /// removes the commit from the delivered sequence.
    fn select(&self, commit: Commit<Id, T>) -> Option<Commit<Id, T>> {
        Some(commit)
    }

    /// Inspects an attempt before it reaches persistence. Returning
    /// `false` vetoes the write.
    fn pre_commit(&self, _attempt: &CommitAttempt<Id, T>) -> bool {
        true
    }

    /// Best-effort side effect after the commit is durable.
    ///
    /// # Errors
    ///
    /// Errors are logged and swallowed by the chain; they never reach
    /// the committer.
    fn post_commit(&self, _commit: &Commit<Id, T>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An ordered chain of [`PipelineHook`]s, applied in configured order.
pub struct HookChain<Id, T> {
    #[allow(clippy::type_complexity)] // It is a complex type but still readable.
    hooks: Arc<[Arc<dyn PipelineHook<Id, T>>]>,
}

impl<Id, T> Default for HookChain<Id, T> {
    fn default() -> Self {
        Self {
            hooks: Vec::new().into(),
        }
    }
}

impl<Id, T> Clone for HookChain<Id, T> {
    fn clone(&self) -> Self {
        Self {
            hooks: self.hooks.clone(),
        }
    }
}

impl<Id, T> HookChain<Id, T> {
    /// Builds a chain out of the given hooks, applied in the order
    /// given.
    pub fn new(hooks: Vec<Arc<dyn PipelineHook<Id, T>>>) -> Self {
        Self {
            hooks: hooks.into(),
        }
    }

    /// Whether the chain has any hooks at all.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs the commit through every hook's `select`, short-circuiting
    /// the first time any hook drops it.
    pub fn select(&self, mut commit: Commit<Id, T>) -> Option<Commit<Id, T>> {
        for hook in self.hooks.iter() {
            commit = hook.select(commit)?;
        }
        Some(commit)
    }

    /// Runs the attempt through every hook's `pre_commit`,
    /// short-circuiting at the first veto.
    pub fn pre_commit(&self, attempt: &CommitAttempt<Id, T>) -> bool {
        self.hooks.iter().all(|hook| hook.pre_commit(attempt))
    }

    /// Runs `post_commit` on every hook regardless of individual
    /// failures, which are logged and swallowed.
    pub fn post_commit(&self, commit: &Commit<Id, T>) {
        for hook in self.hooks.iter() {
            if let Err(error) = hook.post_commit(commit) {
                tracing::error!(%error, "post-commit hook failed");
            }
        }
    }
}
