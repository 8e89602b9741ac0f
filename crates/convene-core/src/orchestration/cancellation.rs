use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Cooperative cancellation shared down the workflow -> step -> task hierarchy.
///
/// Cancelling a token cancels every child derived from it; cancelling twice is a no-op.
#[derive(Clone, Debug, Default)]
pub struct TaskCancellationToken {
    inner: CancellationToken,
    reason: Arc<OnceLock<String>>,
    parent: Option<Arc<TaskCancellationToken>>,
}

impl TaskCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
            reason: Arc::default(),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Cancels and records why; the first recorded reason wins.
    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.inner.cancel();
    }

    /// Reason recorded on this token, or else on the nearest ancestor that has one.
    pub fn reason(&self) -> Option<String> {
        self.reason
            .get()
            .cloned()
            .or_else(|| self.parent.as_ref().and_then(|parent| parent.reason()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves once the token (or any ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::TaskCancellationToken;

    #[test]
    fn cancellation_flows_down_not_up() {
        let workflow = TaskCancellationToken::new();
        let step = workflow.child();
        let task = step.child();

        task.cancel();
        assert!(!step.is_cancelled());
        assert!(!workflow.is_cancelled());

        workflow.cancel();
        workflow.cancel();
        assert!(step.is_cancelled());
        assert!(step.child().is_cancelled());
    }

    #[test]
    fn first_reason_wins_and_children_inherit_it() {
        let group = TaskCancellationToken::new();
        let task = group.child();
        assert!(task.reason().is_none());

        group.cancel_with_reason("sibling 'a' failed");
        group.cancel_with_reason("sibling 'b' failed");

        assert!(task.is_cancelled());
        assert_eq!(group.reason().as_deref(), Some("sibling 'a' failed"));
        assert_eq!(task.reason().as_deref(), Some("sibling 'a' failed"));
    }
}
