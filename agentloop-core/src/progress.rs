//! Progress checks (spec §4.1, §5): the todo-incomplete, file-completion,
//! and goal-verification nudges all read external state the loop
//! controller treats as opaque — a todo store and a task store living
//! outside this crate. `ProgressChecks` is the narrow seam an embedder
//! implements to wire those stores in; the controller only ever calls
//! through the trait.

use async_trait::async_trait;

/// One nudge the loop controller may inject as a system message before
/// its next inference, based on external progress state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressNudge {
    /// Nothing to report.
    None,
    /// There are incomplete todo items and the model has signalled it
    /// intends to stop.
    IncompleteTodos(String),
    /// A file the model edited still has an unresolved placeholder or
    /// syntax marker left in it.
    IncompleteFileEdit(String),
    /// The model's stated goal hasn't been verified against the task
    /// store's recorded completion criteria.
    UnverifiedGoal(String),
}

impl ProgressNudge {
    pub fn is_none(&self) -> bool {
        matches!(self, ProgressNudge::None)
    }
}

/// The embedder-provided seam onto external todo/task state. Default
/// methods return `ProgressNudge::None`, so an embedder that doesn't
/// track either store can implement only what it needs — or use
/// [`NoProgressChecks`] directly.
#[async_trait]
pub trait ProgressChecks: Send + Sync {
    /// Called when the model's response looks like a stop attempt (no
    /// tool calls, a plain text reply). Returns a nudge if the todo store
    /// still has open items this run is expected to address.
    async fn check_incomplete_todos(&self, modified_files: &[String]) -> ProgressNudge {
        let _ = modified_files;
        ProgressNudge::None
    }

    /// Called after a file write, to catch an edit that left behind an
    /// unresolved marker (merge conflict marker, TODO placeholder the
    /// model itself inserted and never replaced, truncated block).
    async fn check_file_completion(&self, path: &str) -> ProgressNudge {
        let _ = path;
        ProgressNudge::None
    }

    /// Called at the goal checkpoint interval (spec §4.1 step 4).
    /// Returns a nudge if the task store's completion criteria for the
    /// current goal are not yet satisfied.
    async fn check_goal_verification(&self, turn_iteration: usize) -> ProgressNudge {
        let _ = turn_iteration;
        ProgressNudge::None
    }
}

/// A no-op implementation for embedders with no todo or task store to
/// consult.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgressChecks;

#[async_trait]
impl ProgressChecks for NoProgressChecks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_checks_are_all_none() {
        let checks = NoProgressChecks;
        assert!(checks.check_incomplete_todos(&[]).await.is_none());
        assert!(checks.check_file_completion("a.rs").await.is_none());
        assert!(checks.check_goal_verification(5).await.is_none());
    }
}
