//! Access guard state machine that coordinates the validator, the store adapter
//! and the presentation layer for one guard id.

use crate::config::GuardSettings;
use crate::error::{FailureKind, GuardError, GuardResult};
use crate::policy::{CodePolicy, PolicyTag};
use crate::store::{AccessCodeStore, Secret, StoreError};
use crate::validator::{validate, ValidationFailure, ValidationResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, MutexGuard};
use zeroize::Zeroizing;

/// Whether the guard has a code and, if so, whether it is currently open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Uninitialized,
    Locked,
    Unlocked,
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardState::Uninitialized => f.write_str("uninitialized"),
            GuardState::Locked => f.write_str("locked"),
            GuardState::Unlocked => f.write_str("unlocked"),
        }
    }
}

/// Screen the presentation layer should be showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// No code and no setup in progress.
    Idle,
    Verifying,
    EnteringFirstCode,
    ConfirmingCode,
    Succeeded,
    Unlocked,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Stage::Idle => "idle",
            Stage::Verifying => "verifying",
            Stage::EnteringFirstCode => "entering first code",
            Stage::ConfirmingCode => "confirming code",
            Stage::Succeeded => "setup succeeded",
            Stage::Unlocked => "unlocked",
        };
        f.write_str(text)
    }
}

/// The single error message currently shown for a guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Everything the presentation layer renders; re-emitted on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardSnapshot {
    pub guard_id: String,
    pub stage: Stage,
    pub guard_state: GuardState,
    pub is_setup: bool,
    pub error: Option<GuardFailure>,
    /// Policy of the persisted code, for keyboard affordance during verification.
    pub policy: Option<PolicyTag>,
}

/// Host hook run once per successful unlock.
#[async_trait]
pub trait UnlockCallback: Send + Sync {
    async fn unlocked(&self);
}

enum SetupFlow {
    EnteringFirstCode,
    ConfirmingCode {
        first_code: Zeroizing<String>,
        policy: CodePolicy,
    },
    Succeeded,
}

struct GuardInner {
    state: GuardState,
    setup: Option<SetupFlow>,
    error: Option<GuardFailure>,
    policy: Option<PolicyTag>,
    backgrounded_at: Option<Instant>,
    callback: Option<Arc<dyn UnlockCallback>>,
    /// Whether the store has been consulted at least once.
    synced: bool,
    /// A store write failed and may still land.
    unsettled: bool,
}

impl GuardInner {
    fn stage(&self) -> Stage {
        match &self.setup {
            Some(SetupFlow::EnteringFirstCode) => Stage::EnteringFirstCode,
            Some(SetupFlow::ConfirmingCode { .. }) => Stage::ConfirmingCode,
            Some(SetupFlow::Succeeded) => Stage::Succeeded,
            None => match self.state {
                GuardState::Uninitialized => Stage::Idle,
                GuardState::Locked => Stage::Verifying,
                GuardState::Unlocked => Stage::Unlocked,
            },
        }
    }
}

/// Flags the guard for a store resync if a write is abandoned by its caller.
struct ResyncOnDrop {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl ResyncOnDrop {
    fn arm(flag: Arc<AtomicBool>) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ResyncOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// State machine for a single access-code guard.
///
/// Submit-style operations never overlap: while one is in flight the others
/// fail with [`GuardError::Busy`]. [`AccessGuard::lock`] and
/// [`AccessGuard::refresh`] wait their turn instead.
///
/// Store writes run on a detached task. When a caller drops a confirmation or
/// removal before it finishes, the write still completes and the in-memory
/// setup flow is discarded. The next operation waits for that write before it
/// reloads state from the store.
pub struct AccessGuard {
    id: String,
    settings: GuardSettings,
    fixed: Option<Secret>,
    store: AccessCodeStore,
    inner: Mutex<GuardInner>,
    resync: Arc<AtomicBool>,
    /// Held by a detached store write until it finishes.
    writes: Arc<Mutex<()>>,
    snapshots: watch::Sender<GuardSnapshot>,
}

impl AccessGuard {
    /// Build a guard. Its state is unknown until the first store sync, which
    /// happens on [`AccessGuard::refresh`] or lazily on the first operation.
    pub fn new(id: impl Into<String>, settings: GuardSettings, store: AccessCodeStore) -> Self {
        let id = id.into();
        let fixed = settings.fixed_code.as_ref().map(|code| {
            let policy = settings
                .policies
                .iter()
                .find(|p| validate(code, p).is_valid())
                .or_else(|| settings.policies.first())
                .map(CodePolicy::tag)
                .unwrap_or(PolicyTag::Alphanumeric {
                    length: code.chars().count(),
                });
            Secret::new(code.clone(), policy)
        });

        let inner = GuardInner {
            state: GuardState::Uninitialized,
            setup: None,
            error: None,
            policy: None,
            backgrounded_at: None,
            callback: None,
            synced: false,
            unsettled: false,
        };
        let (snapshots, _) = watch::channel(Self::snapshot_of(&id, &inner));

        Self {
            id,
            settings,
            fixed,
            store,
            inner: Mutex::new(inner),
            resync: Arc::new(AtomicBool::new(true)),
            writes: Arc::new(Mutex::new(())),
            snapshots,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    /// Policies a new code may be created under, in display order.
    pub fn allowed_policies(&self) -> &[CodePolicy] {
        &self.settings.policies
    }

    pub fn has_fixed_code(&self) -> bool {
        self.fixed.is_some()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> GuardSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receive every snapshot published after this call.
    pub fn subscribe(&self) -> watch::Receiver<GuardSnapshot> {
        self.snapshots.subscribe()
    }

    pub async fn set_unlock_callback(&self, callback: Arc<dyn UnlockCallback>) {
        self.inner.lock().await.callback = Some(callback);
    }

    /// Reconcile in-memory state with the store and publish the result.
    pub async fn refresh(&self) -> GuardResult<GuardSnapshot> {
        let mut inner = self.inner.lock().await;
        self.sync(&mut inner, true).await?;
        Ok(Self::snapshot_of(&self.id, &inner))
    }

    /// Whether a code exists for this guard.
    pub async fn is_setup(&self) -> GuardResult<bool> {
        Ok(self.refresh().await?.is_setup)
    }

    /// Start creating a code, or rotating it after a successful unlock.
    pub async fn begin_setup(&self) -> GuardResult<()> {
        if self.fixed.is_some() {
            return Err(GuardError::FixedCode(self.id.clone()));
        }
        let mut inner = self.acquire()?;
        self.ensure_synced(&mut inner).await?;
        if inner.state == GuardState::Locked {
            return Err(GuardError::VerificationRequired(self.id.clone()));
        }
        inner.setup = Some(SetupFlow::EnteringFirstCode);
        inner.error = None;
        self.publish(&inner);
        debug!("guard {} entered setup", self.id);
        Ok(())
    }

    /// Hold a valid first code in memory and move on to confirmation.
    pub async fn submit_first_code(&self, candidate: &str, policy: &CodePolicy) -> GuardResult<()> {
        let mut inner = self.acquire()?;
        self.ensure_synced(&mut inner).await?;
        if !matches!(inner.setup, Some(SetupFlow::EnteringFirstCode)) {
            return Err(Self::invalid_stage("submit_first_code", &inner));
        }
        inner.error = None;

        if let Err(err) = self.check_candidate(candidate, policy) {
            return Err(self.fail(&mut inner, err));
        }

        inner.setup = Some(SetupFlow::ConfirmingCode {
            first_code: Zeroizing::new(candidate.to_string()),
            policy: policy.clone(),
        });
        self.publish(&inner);
        Ok(())
    }

    /// Persist the code if the confirmation matches the first entry.
    ///
    /// A mismatch keeps the flow on the confirmation step; the user goes back
    /// explicitly with [`AccessGuard::go_back_from_confirmation`].
    pub async fn submit_confirmation(
        &self,
        candidate: &str,
        policy: &CodePolicy,
    ) -> GuardResult<()> {
        let mut inner = self.acquire()?;
        self.ensure_synced(&mut inner).await?;
        let (first_code, held_policy) = match &inner.setup {
            Some(SetupFlow::ConfirmingCode { first_code, policy }) => {
                (first_code.clone(), policy.clone())
            }
            _ => return Err(Self::invalid_stage("submit_confirmation", &inner)),
        };
        inner.error = None;

        if let Err(err) = self.check_candidate(candidate, policy) {
            return Err(self.fail(&mut inner, err));
        }
        if *policy != held_policy {
            return Err(self.fail(&mut inner, GuardError::PolicyChanged));
        }
        if candidate != first_code.as_str() {
            return Err(self.fail(&mut inner, GuardError::CodeMismatch));
        }

        let secret = Secret::new(candidate, held_policy.tag());
        if let Err(err) = self.write_detached(&mut inner, Some(secret)).await {
            warn!("guard {}: storing new access code failed: {err}", self.id);
            let message = format!("could not save access code: {err}");
            return Err(self.fail_with(&mut inner, err.into(), message));
        }

        let rotated = inner.state == GuardState::Unlocked;
        inner.state = GuardState::Unlocked;
        inner.setup = Some(SetupFlow::Succeeded);
        inner.policy = Some(held_policy.tag());
        self.publish(&inner);
        if rotated {
            info!("guard {} access code rotated", self.id);
        } else {
            info!("guard {} access code created", self.id);
        }

        let callback = inner.callback.clone();
        drop(inner);
        if let Some(callback) = callback {
            callback.unlocked().await;
        }
        Ok(())
    }

    /// Show a candidate the input layer refused to submit as the guard's error,
    /// so every view of the guard renders it.
    pub fn reject_candidate(&self, reason: ValidationFailure) -> GuardError {
        let err = GuardError::Validation(reason);
        match self.acquire() {
            Ok(mut inner) => self.fail(&mut inner, err),
            Err(busy) => busy,
        }
    }

    /// Abandon the held first code and return to first-code entry.
    pub async fn go_back_from_confirmation(&self) -> GuardResult<()> {
        let mut inner = self.acquire()?;
        if !matches!(inner.setup, Some(SetupFlow::ConfirmingCode { .. })) {
            return Err(Self::invalid_stage("go_back_from_confirmation", &inner));
        }
        inner.setup = Some(SetupFlow::EnteringFirstCode);
        inner.error = None;
        self.publish(&inner);
        Ok(())
    }

    /// Discard any setup flow in progress.
    pub async fn cancel_setup(&self) -> GuardResult<()> {
        let mut inner = self.acquire()?;
        if inner.setup.is_none() {
            return Ok(());
        }
        inner.setup = None;
        inner.error = None;
        self.publish(&inner);
        Ok(())
    }

    /// Dismiss the success screen shown after a code was created.
    pub async fn acknowledge_success(&self) -> GuardResult<()> {
        let mut inner = self.acquire()?;
        if matches!(inner.setup, Some(SetupFlow::Succeeded)) {
            inner.setup = None;
            self.publish(&inner);
        }
        Ok(())
    }

    /// Compare `candidate` with the persisted code.
    pub async fn submit_verification(&self, candidate: &str) -> GuardResult<()> {
        let mut inner = self.acquire()?;
        self.ensure_synced(&mut inner).await?;
        match inner.state {
            GuardState::Uninitialized => return Err(GuardError::NotSetUp(self.id.clone())),
            GuardState::Unlocked => {
                // a view still asking for the code is stale; push it forward
                self.publish(&inner);
                return Err(GuardError::AlreadyUnlocked(self.id.clone()));
            }
            GuardState::Locked => {}
        }
        inner.error = None;

        let secret = match self.load_secret().await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                warn!("guard {} lost its access code while locked", self.id);
                inner.state = GuardState::Uninitialized;
                inner.policy = None;
                inner.setup = Some(SetupFlow::EnteringFirstCode);
                self.publish(&inner);
                return Err(GuardError::NotSetUp(self.id.clone()));
            }
            Err(err) => {
                warn!("guard {}: cannot read access code: {err}", self.id);
                let message = format!("cannot verify right now: {err}");
                return Err(self.fail_with(&mut inner, err.into(), message));
            }
        };

        if !secret.matches(candidate) {
            debug!("guard {} rejected a verification attempt", self.id);
            return Err(self.fail(&mut inner, GuardError::IncorrectCode));
        }

        inner.state = GuardState::Unlocked;
        inner.setup = None;
        inner.policy = Some(secret.policy().clone());
        self.publish(&inner);
        info!("guard {} unlocked", self.id);

        let callback = inner.callback.clone();
        drop(inner);
        if let Some(callback) = callback {
            callback.unlocked().await;
        }
        Ok(())
    }

    /// Close the guard. Locking a locked or uninitialized guard does nothing.
    pub async fn lock(&self) {
        let mut inner = self.inner.lock().await;
        self.lock_inner(&mut inner);
    }

    /// Delete the code. Requires the guard to be unlocked.
    pub async fn remove_code(&self) -> GuardResult<()> {
        if self.fixed.is_some() {
            return Err(GuardError::FixedCode(self.id.clone()));
        }
        let mut inner = self.acquire()?;
        self.ensure_synced(&mut inner).await?;
        match inner.state {
            GuardState::Uninitialized => return Err(GuardError::NotSetUp(self.id.clone())),
            GuardState::Locked => return Err(GuardError::VerificationRequired(self.id.clone())),
            GuardState::Unlocked => {}
        }
        inner.error = None;

        if let Err(err) = self.write_detached(&mut inner, None).await {
            warn!("guard {}: removing access code failed: {err}", self.id);
            let message = format!("could not remove access code: {err}");
            return Err(self.fail_with(&mut inner, err.into(), message));
        }

        inner.state = GuardState::Uninitialized;
        inner.policy = None;
        inner.setup = Some(SetupFlow::EnteringFirstCode);
        self.publish(&inner);
        info!("guard {} access code removed", self.id);
        Ok(())
    }

    /// Remember when the host application went to the background.
    pub async fn enter_background(&self, at: Instant) {
        self.inner.lock().await.backgrounded_at = Some(at);
    }

    /// Lock if the application stayed in the background longer than the
    /// configured auto-lock timeout. Returns whether the guard was locked.
    pub async fn enter_foreground(&self, at: Instant) -> bool {
        let mut inner = self.inner.lock().await;
        let since = inner.backgrounded_at.take();
        let (Some(since), Some(timeout)) = (since, self.settings.auto_lock) else {
            return false;
        };
        if inner.state != GuardState::Unlocked || at.saturating_duration_since(since) < timeout {
            return false;
        }
        debug!(
            "guard {} idle for {:?}, locking",
            self.id,
            at.saturating_duration_since(since)
        );
        self.lock_inner(&mut inner);
        true
    }

    fn lock_inner(&self, inner: &mut GuardInner) {
        if inner.state != GuardState::Unlocked {
            return;
        }
        inner.state = GuardState::Locked;
        inner.setup = None;
        inner.error = None;
        self.publish(inner);
        info!("guard {} locked", self.id);
    }

    fn acquire(&self) -> GuardResult<MutexGuard<'_, GuardInner>> {
        self.inner
            .try_lock()
            .map_err(|_| GuardError::Busy(self.id.clone()))
    }

    async fn ensure_synced(&self, inner: &mut GuardInner) -> GuardResult<()> {
        self.sync(inner, false).await
    }

    /// Reload from the store when forced, after an abandoned write, or after
    /// a failed one.
    async fn sync(&self, inner: &mut GuardInner, force: bool) -> GuardResult<()> {
        let abandoned = self.resync.swap(false, Ordering::SeqCst);
        if !force && !abandoned && !inner.unsettled {
            return Ok(());
        }
        if abandoned {
            // any transient first code belongs to an abandoned attempt
            inner.setup = None;
        }
        let outcome = match self.settle_writes().await {
            Ok(()) => self.reconcile(inner).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            self.resync.store(true, Ordering::SeqCst);
            return Err(self.fail(inner, err.into()));
        }
        inner.unsettled = false;
        self.publish(inner);
        Ok(())
    }

    /// Wait for an earlier write to finish, giving up after the store deadline.
    async fn settle_writes(&self) -> Result<(), StoreError> {
        let deadline = self.store.timeout();
        match tokio::time::timeout(deadline, self.writes.lock()).await {
            Ok(lane) => {
                drop(lane);
                Ok(())
            }
            Err(_) => Err(StoreError::transient(format!(
                "previous write still pending after {} ms",
                deadline.as_millis()
            ))),
        }
    }

    /// The store decides whether a code exists; in-memory state follows it.
    ///
    /// Setup opens on its own only on the first sync or when a code vanished;
    /// a guard whose setup was cancelled stays idle.
    async fn reconcile(&self, inner: &mut GuardInner) -> Result<(), StoreError> {
        let secret = self.load_secret().await?;
        match secret {
            None => {
                let had_code = inner.state != GuardState::Uninitialized;
                if had_code || !inner.synced {
                    inner.setup = Some(SetupFlow::EnteringFirstCode);
                }
                inner.state = GuardState::Uninitialized;
                inner.policy = None;
            }
            Some(secret) => {
                if inner.state == GuardState::Uninitialized {
                    inner.state = GuardState::Locked;
                    inner.setup = None;
                }
                inner.policy = Some(secret.policy().clone());
            }
        }
        inner.synced = true;
        Ok(())
    }

    async fn load_secret(&self) -> Result<Option<Secret>, StoreError> {
        match &self.fixed {
            Some(secret) => Ok(Some(secret.clone())),
            None => self.store.load(&self.id).await,
        }
    }

    /// Save (`Some`) or clear (`None`) the secret on a task that outlives the caller.
    ///
    /// The store deadline bounds the wait, not the write. A write that times
    /// out keeps the write lane until it finishes and marks the guard
    /// unsettled, so the next operation reloads whatever actually landed.
    async fn write_detached(
        &self,
        inner: &mut GuardInner,
        secret: Option<Secret>,
    ) -> Result<(), StoreError> {
        let pending = ResyncOnDrop::arm(self.resync.clone());
        let lane = self.writes.clone().lock_owned().await;
        let store = self.store.clone();
        let id = self.id.clone();
        let task = tokio::spawn(async move {
            let outcome = store.write(&id, secret.as_ref()).await;
            drop(lane);
            outcome
        });
        let deadline = self.store.timeout();
        let outcome = match tokio::time::timeout(deadline, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => Err(StoreError::transient(format!("store task failed: {err}"))),
            Err(_) => {
                warn!(
                    "guard {}: store write exceeded {} ms",
                    self.id,
                    deadline.as_millis()
                );
                Err(StoreError::transient(format!(
                    "write timed out after {} ms",
                    deadline.as_millis()
                )))
            }
        };
        pending.disarm();
        if outcome.is_err() {
            inner.unsettled = true;
        }
        outcome
    }

    fn check_candidate(&self, candidate: &str, policy: &CodePolicy) -> GuardResult<()> {
        if !self.settings.policies.contains(policy) {
            return Err(GuardError::PolicyNotAllowed(policy.to_string()));
        }
        match validate(candidate, policy) {
            ValidationResult::Valid => Ok(()),
            ValidationResult::Failure(reason) => Err(GuardError::Validation(reason)),
            ValidationResult::None | ValidationResult::Incomplete => {
                Err(GuardError::Validation(ValidationFailure::Incomplete))
            }
        }
    }

    fn fail(&self, inner: &mut GuardInner, err: GuardError) -> GuardError {
        let message = err.user_message();
        self.fail_with(inner, err, message)
    }

    fn fail_with(&self, inner: &mut GuardInner, err: GuardError, message: String) -> GuardError {
        if let Some(kind) = err.failure_kind() {
            inner.error = Some(GuardFailure { kind, message });
            self.publish(inner);
        }
        err
    }

    fn invalid_stage(operation: &'static str, inner: &GuardInner) -> GuardError {
        GuardError::InvalidStage {
            operation,
            stage: inner.stage().to_string(),
        }
    }

    fn publish(&self, inner: &GuardInner) {
        self.snapshots
            .send_replace(Self::snapshot_of(&self.id, inner));
    }

    fn snapshot_of(id: &str, inner: &GuardInner) -> GuardSnapshot {
        GuardSnapshot {
            guard_id: id.to_string(),
            stage: inner.stage(),
            guard_state: inner.state,
            is_setup: inner.state != GuardState::Uninitialized,
            error: inner.error.clone(),
            policy: inner.policy.clone(),
        }
    }
}
