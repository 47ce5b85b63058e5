use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AssistError {
    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),
    #[error("element not found on screen: {0}")]
    GroundingNotFound(String),
    #[error("ambiguous: {0}")]
    Ambiguous(String),
    #[error("blocked by safety policy: {0}")]
    SafetyBlocked(String),
    #[error("replanning attempts exhausted: {0}")]
    ReplanExhausted(String),
    #[error("step budget exhausted after {0} steps")]
    StepBudgetExhausted(usize),
    #[error("abandoned: {0}")]
    UserAbandoned(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AssistError {
    /// Transient failures are retried locally and never reach the user.
    pub fn is_transient(&self) -> bool {
        matches!(self, AssistError::CollaboratorUnavailable(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            AssistError::CollaboratorUnavailable(_) => FailureKind::CollaboratorUnavailable,
            AssistError::GroundingNotFound(_) => FailureKind::GroundingNotFound,
            AssistError::Ambiguous(_) => FailureKind::Ambiguous,
            AssistError::SafetyBlocked(_) => FailureKind::SafetyBlocked,
            AssistError::ReplanExhausted(_) => FailureKind::ReplanExhausted,
            AssistError::StepBudgetExhausted(_) => FailureKind::StepBudgetExhausted,
            AssistError::UserAbandoned(_) => FailureKind::UserAbandoned,
            AssistError::InvalidInput(_) => FailureKind::InvalidInput,
            AssistError::Internal(_) => FailureKind::Internal,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CollaboratorUnavailable,
    GroundingNotFound,
    Ambiguous,
    SafetyBlocked,
    ReplanExhausted,
    StepBudgetExhausted,
    UserAbandoned,
    InvalidInput,
    Internal,
}

/// Presentation-layer marker: failures are always attributed to the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    #[default]
    System,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Kind of the failure that ended the task. For `ReplanExhausted` this is
    /// the kind of the last step failure, so `GroundingNotFound` stays visible.
    pub kind: FailureKind,
    pub message: String,
    pub recovery_suggestion: String,
    pub cause: FailureCause,
}

impl FailureReport {
    pub fn from_error(err: &AssistError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            recovery_suggestion: recovery_suggestion(err.kind()).to_string(),
            cause: FailureCause::System,
        }
    }

    pub fn with_kind(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recovery_suggestion: recovery_suggestion(kind).to_string(),
            cause: FailureCause::System,
        }
    }
}

fn recovery_suggestion(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::CollaboratorUnavailable => {
            "The assistant could not reach its helper service. Try the request again in a minute."
        }
        FailureKind::GroundingNotFound => {
            "The assistant could not find that on the screen. \
             Try describing it another way, or ask a family member to take a look."
        }
        FailureKind::Ambiguous => {
            "The assistant needs a little more detail. \
             Try saying the request again with the name of the app or person."
        }
        FailureKind::SafetyBlocked => {
            "The assistant stopped here to keep your money and accounts safe. A family member can help check it."
        }
        FailureKind::ReplanExhausted | FailureKind::StepBudgetExhausted => {
            "The assistant tried several ways without success. Try again later, or ask a family member to take a look."
        }
        FailureKind::UserAbandoned => "The request was stopped. You can start a new one at any time.",
        FailureKind::InvalidInput => "The assistant did not catch that. Try saying it again.",
        FailureKind::Internal => "Something went wrong inside the assistant. Try the request again.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_collaborator_failures_are_transient() {
        assert!(AssistError::CollaboratorUnavailable("timeout".into()).is_transient());
        assert!(!AssistError::GroundingNotFound("icon".into()).is_transient());
        assert!(!AssistError::SafetyBlocked("payment".into()).is_transient());
    }

    #[test]
    fn failure_reports_are_marked_as_system_caused() {
        let report = FailureReport::from_error(&AssistError::ReplanExhausted("3 replans".into()));
        assert_eq!(report.cause, FailureCause::System);
        assert_eq!(report.kind, FailureKind::ReplanExhausted);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["cause"], "system");
    }
}
