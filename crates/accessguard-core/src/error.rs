use crate::store::StoreError;
use crate::validator::ValidationFailure;
use serde::Serialize;
use thiserror::Error;

/// Result alias for core operations.
pub type GuardResult<T> = Result<T, GuardError>;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("[AG1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[AG1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[AG1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[AG1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[AG2000] {0}")]
    Validation(ValidationFailure),

    #[error("[AG2001] code policy `{0}` is not allowed for this guard")]
    PolicyNotAllowed(String),

    #[error("[AG2002] code policy changed between first entry and confirmation")]
    PolicyChanged,

    #[error("[AG2100] codes do not match")]
    CodeMismatch,

    #[error("[AG2101] incorrect code")]
    IncorrectCode,

    #[error("[AG3000] {0}")]
    Store(#[from] StoreError),

    #[error("[AG4000] guard `{0}` has no access code")]
    NotSetUp(String),

    #[error("[AG4001] guard `{0}` is already unlocked")]
    AlreadyUnlocked(String),

    #[error("[AG4002] guard `{0}` must be unlocked with the current code first")]
    VerificationRequired(String),

    #[error("[AG4003] guard `{0}` uses a fixed code that cannot be changed")]
    FixedCode(String),

    #[error("[AG4004] another operation on guard `{0}` is still in flight")]
    Busy(String),

    #[error("[AG4005] `{operation}` is not valid while guard is {stage}")]
    InvalidStage {
        operation: &'static str,
        stage: String,
    },
}

/// Coarse classification shown to the presentation layer alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Mismatch,
    StoreTransient,
    StorePermanent,
}

impl GuardError {
    pub fn code(&self) -> &'static str {
        match self {
            GuardError::Io(_) => "AG1000",
            GuardError::Toml(_) => "AG1001",
            GuardError::Yaml(_) => "AG1002",
            GuardError::InvalidConfig(_) => "AG1100",
            GuardError::Validation(_) => "AG2000",
            GuardError::PolicyNotAllowed(_) => "AG2001",
            GuardError::PolicyChanged => "AG2002",
            GuardError::CodeMismatch => "AG2100",
            GuardError::IncorrectCode => "AG2101",
            GuardError::Store(_) => "AG3000",
            GuardError::NotSetUp(_) => "AG4000",
            GuardError::AlreadyUnlocked(_) => "AG4001",
            GuardError::VerificationRequired(_) => "AG4002",
            GuardError::FixedCode(_) => "AG4003",
            GuardError::Busy(_) => "AG4004",
            GuardError::InvalidStage { .. } => "AG4005",
        }
    }

    /// Kind of user-visible failure this error represents, if any.
    ///
    /// Flow errors (busy, wrong stage, not set up) are caller mistakes and are
    /// never rendered as the guard's error message.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            GuardError::Validation(_)
            | GuardError::PolicyNotAllowed(_)
            | GuardError::PolicyChanged => Some(FailureKind::Validation),
            GuardError::CodeMismatch | GuardError::IncorrectCode => Some(FailureKind::Mismatch),
            GuardError::Store(err) if err.is_transient() => Some(FailureKind::StoreTransient),
            GuardError::Store(_) => Some(FailureKind::StorePermanent),
            _ => None,
        }
    }

    /// Message suitable for display, without the diagnostic code prefix.
    pub fn user_message(&self) -> String {
        match self {
            GuardError::Validation(reason) => reason.to_string(),
            GuardError::CodeMismatch => "codes do not match".to_string(),
            GuardError::IncorrectCode => "incorrect code".to_string(),
            GuardError::Store(err) => err.to_string(),
            other => {
                let text = other.to_string();
                match text.split_once("] ") {
                    Some((_, rest)) => rest.to_string(),
                    None => text,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn mismatch_errors_share_a_kind() {
        assert_eq!(
            GuardError::CodeMismatch.failure_kind(),
            Some(FailureKind::Mismatch)
        );
        assert_eq!(
            GuardError::IncorrectCode.failure_kind(),
            Some(FailureKind::Mismatch)
        );
    }

    #[test]
    fn store_errors_keep_their_retry_class() {
        let transient = GuardError::from(StoreError::transient("keychain busy"));
        let permanent = GuardError::from(StoreError::permanent("access denied"));
        assert_eq!(transient.failure_kind(), Some(FailureKind::StoreTransient));
        assert_eq!(permanent.failure_kind(), Some(FailureKind::StorePermanent));
    }

    #[test]
    fn flow_errors_are_not_user_failures() {
        assert!(GuardError::Busy("app".into()).failure_kind().is_none());
        assert!(GuardError::NotSetUp("app".into()).failure_kind().is_none());
    }

    #[test]
    fn user_message_strips_code_prefix() {
        let err = GuardError::PolicyChanged;
        assert_eq!(err.code(), "AG2002");
        assert_eq!(
            err.user_message(),
            "code policy changed between first entry and confirmation"
        );
        assert_eq!(GuardError::IncorrectCode.user_message(), "incorrect code");
    }
}
