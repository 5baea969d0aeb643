//! Candidate codes and the pure validation rules applied to them on every keystroke.

use crate::policy::CodePolicy;
use serde::Serialize;
use std::fmt;
use zeroize::Zeroizing;

/// Why a full-length candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFailure {
    /// A candidate was submitted before reaching the policy's minimum length.
    Incomplete,
    InvalidCharacter,
    TooLong,
    /// Error carried over from a previous step (e.g. a failed store write).
    Upstream(String),
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationFailure::Incomplete => f.write_str("code is incomplete"),
            ValidationFailure::InvalidCharacter => f.write_str("invalid character"),
            ValidationFailure::TooLong => f.write_str("code too long"),
            ValidationFailure::Upstream(reason) => f.write_str(reason),
        }
    }
}

/// Outcome of checking a candidate against a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationResult {
    None,
    Incomplete,
    Valid,
    Failure(ValidationFailure),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

/// Check `candidate` against `policy`.
pub fn validate(candidate: &str, policy: &CodePolicy) -> ValidationResult {
    let length = candidate.chars().count();
    if length == 0 {
        return ValidationResult::None;
    }
    if length < policy.min_length() {
        return ValidationResult::Incomplete;
    }
    if length > policy.max_length() {
        return ValidationResult::Failure(ValidationFailure::TooLong);
    }
    if candidate.chars().all(|c| policy.accepts(c)) {
        ValidationResult::Valid
    } else {
        ValidationResult::Failure(ValidationFailure::InvalidCharacter)
    }
}

/// Submission readiness: the user explicitly confirmed and the latest result is valid.
pub fn should_submit(result: &ValidationResult, confirmed: bool) -> bool {
    confirmed && result.is_valid()
}

/// Characters typed so far. The buffer is wiped on drop.
pub struct Candidate {
    text: Zeroizing<String>,
    length: usize,
}

impl Default for Candidate {
    fn default() -> Self {
        Self {
            text: Zeroizing::new(String::new()),
            length: 0,
        }
    }
}

impl Candidate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `c` unless the candidate already holds `max_length` characters.
    /// Returns whether the character was taken.
    pub fn push(&mut self, c: char, max_length: usize) -> bool {
        if self.length >= max_length {
            return false;
        }
        self.text.push(c);
        self.length += 1;
        true
    }

    pub fn pop(&mut self) -> Option<char> {
        let c = self.text.pop()?;
        self.length -= 1;
        Some(c)
    }

    /// Drop characters past `max_length`, used when the policy changes under a
    /// partially typed code.
    pub fn truncate(&mut self, max_length: usize) {
        while self.length > max_length {
            self.pop();
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.length = 0;
    }

    pub fn as_str(&self) -> &str {
        self.text.as_str()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}
