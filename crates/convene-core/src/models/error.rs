use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{StepId, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorKind {
    Validation,
    ProviderTransient,
    ProviderPermanent,
    Conflict,
    Graph,
    NoAvailability,
    Cancelled,
    Timeout,
    Internal,
}

impl CoreErrorKind {
    /// Transient provider failures and I/O timeouts are the only retryable kinds.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ProviderTransient | Self::Timeout)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub agent: Option<String>,
    pub task: Option<TaskId>,
    pub step: Option<StepId>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            agent: None,
            task: None,
            step: None,
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Validation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::ProviderTransient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::ProviderPermanent, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Conflict, message)
    }

    pub fn graph(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Graph, message)
    }

    pub fn no_availability(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::NoAvailability, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Internal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Fills attribution fields that are still empty; existing attribution wins.
    pub fn attribute(
        self,
        agent: Option<&str>,
        task: Option<&TaskId>,
        step: Option<&StepId>,
    ) -> Self {
        Self {
            agent: self.agent.or_else(|| agent.map(str::to_string)),
            task: self.task.or_else(|| task.cloned()),
            step: self.step.or_else(|| step.cloned()),
            kind: self.kind,
            message: self.message,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::{CoreError, CoreErrorKind};
    use crate::models::TaskId;

    #[test]
    fn only_transient_and_timeout_are_retryable() {
        assert!(CoreErrorKind::ProviderTransient.is_retryable());
        assert!(CoreErrorKind::Timeout.is_retryable());
        assert!(!CoreErrorKind::Validation.is_retryable());
        assert!(!CoreErrorKind::ProviderPermanent.is_retryable());
        assert!(!CoreErrorKind::Conflict.is_retryable());
    }

    #[test]
    fn attribution_keeps_existing_fields() {
        let error = CoreError::transient("rate limited")
            .attribute(Some("calendar-agent"), None, None)
            .attribute(
                Some("booking-agent"),
                Some(&TaskId::from("fetch:alice")),
                None,
            );

        assert_eq!(error.agent.as_deref(), Some("calendar-agent"));
        assert_eq!(error.task, Some(TaskId::from("fetch:alice")));
        assert_eq!(error.to_string(), "ProviderTransient: rate limited");
    }
}
