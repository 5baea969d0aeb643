//! Input adapter between a presentation layer and an [`AccessGuard`].
//!
//! A session owns what the user is typing right now and which policy is
//! selected. It turns keystrokes into validation results and a submit press
//! into the guard operation that matches the current stage.

use crate::error::{GuardError, GuardResult};
use crate::guard::{AccessGuard, GuardSnapshot, Stage};
use crate::policy::{CodePolicy, MAX_CODE_LENGTH};
use crate::validator::{should_submit, validate, Candidate, ValidationResult};
use log::debug;
use std::sync::Arc;

pub struct GuardSession {
    guard: Arc<AccessGuard>,
    candidate: Candidate,
    selected: usize,
    last: ValidationResult,
}

impl GuardSession {
    pub fn new(guard: Arc<AccessGuard>) -> Self {
        Self {
            guard,
            candidate: Candidate::new(),
            selected: 0,
            last: ValidationResult::None,
        }
    }

    pub fn guard(&self) -> &Arc<AccessGuard> {
        &self.guard
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        self.guard.snapshot()
    }

    /// Result of validating the candidate after the latest keystroke.
    pub fn validation(&self) -> &ValidationResult {
        &self.last
    }

    /// Number of characters typed; the presentation layer echoes dots, never text.
    pub fn entered_len(&self) -> usize {
        self.candidate.len()
    }

    pub fn selected_policy(&self) -> Option<&CodePolicy> {
        self.guard.allowed_policies().get(self.selected)
    }

    /// Policy the candidate is checked against for the current stage. While
    /// verifying this is the policy the stored code was created with.
    pub fn active_policy(&self) -> Option<CodePolicy> {
        let snapshot = self.guard.snapshot();
        match snapshot.stage {
            Stage::Verifying => snapshot
                .policy
                .and_then(|tag| tag.resolve(self.guard.allowed_policies())),
            _ => self.selected_policy().cloned(),
        }
    }

    pub fn character_entered(&mut self, c: char) -> &ValidationResult {
        let max = self
            .active_policy()
            .map(|p| p.max_length())
            .unwrap_or(MAX_CODE_LENGTH);
        self.candidate.push(c, max);
        self.revalidate();
        &self.last
    }

    pub fn character_removed(&mut self) -> &ValidationResult {
        self.candidate.pop();
        self.revalidate();
        &self.last
    }

    /// Pick the policy for a new code. Only possible before the first code is
    /// submitted; the confirmation must use the same policy.
    pub fn select_policy(&mut self, index: usize) -> GuardResult<()> {
        let stage = self.guard.snapshot().stage;
        if stage != Stage::EnteringFirstCode {
            return Err(GuardError::InvalidStage {
                operation: "select_policy",
                stage: stage.to_string(),
            });
        }
        let policy = self
            .guard
            .allowed_policies()
            .get(index)
            .ok_or_else(|| GuardError::PolicyNotAllowed(format!("#{index}")))?;
        self.candidate.truncate(policy.max_length());
        self.selected = index;
        self.revalidate();
        Ok(())
    }

    /// Dispatch the candidate if it is valid. Returns `Ok(false)` when there
    /// was nothing to submit. A candidate that failed validation is reported
    /// through the guard so the error reaches its snapshot.
    pub async fn submit_pressed(&mut self) -> GuardResult<bool> {
        if let ValidationResult::Failure(reason) = &self.last {
            let err = self.guard.reject_candidate(reason.clone());
            self.reset_candidate();
            return Err(err);
        }
        if !should_submit(&self.last, true) {
            return Ok(false);
        }
        let stage = self.guard.snapshot().stage;
        let outcome = match stage {
            Stage::EnteringFirstCode => match self.selected_policy().cloned() {
                Some(policy) => {
                    self.guard
                        .submit_first_code(self.candidate.as_str(), &policy)
                        .await
                }
                None => Err(GuardError::PolicyNotAllowed(format!("#{}", self.selected))),
            },
            Stage::ConfirmingCode => match self.selected_policy().cloned() {
                Some(policy) => {
                    self.guard
                        .submit_confirmation(self.candidate.as_str(), &policy)
                        .await
                }
                None => Err(GuardError::PolicyNotAllowed(format!("#{}", self.selected))),
            },
            Stage::Verifying => self.guard.submit_verification(self.candidate.as_str()).await,
            other => {
                debug!("guard {}: ignoring submit in stage {other}", self.guard.id());
                return Ok(false);
            }
        };
        self.reset_candidate();
        outcome.map(|()| true)
    }

    /// Leave the confirmation step, or just clear the candidate elsewhere.
    pub async fn back_pressed(&mut self) -> GuardResult<()> {
        self.reset_candidate();
        if self.guard.snapshot().stage == Stage::ConfirmingCode {
            self.guard.go_back_from_confirmation().await?;
        }
        Ok(())
    }

    /// Abandon the current setup attempt or dismiss the success screen.
    pub async fn cancel_pressed(&mut self) -> GuardResult<()> {
        self.reset_candidate();
        match self.guard.snapshot().stage {
            Stage::EnteringFirstCode | Stage::ConfirmingCode => self.guard.cancel_setup().await,
            Stage::Succeeded => self.guard.acknowledge_success().await,
            _ => Ok(()),
        }
    }

    /// Drop whatever has been typed without touching the guard.
    pub fn clear_candidate(&mut self) {
        self.reset_candidate();
    }

    fn revalidate(&mut self) {
        self.last = match self.active_policy() {
            Some(policy) => validate(self.candidate.as_str(), &policy),
            // stored policy unknown to this build: let the store decide
            None if self.candidate.is_empty() => ValidationResult::None,
            None => ValidationResult::Valid,
        };
    }

    fn reset_candidate(&mut self) {
        self.candidate.clear();
        self.last = ValidationResult::None;
    }
}
