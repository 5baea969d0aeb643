//! Secret storage: the backend port, the persisted secret, and the adapter that
//! maps guard ids onto backend keys.

use crate::policy::PolicyTag;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// Namespace applied to every backend key written by the adapter.
pub const KEY_PREFIX: &str = "accessguard:v1:";

const RECORD_VERSION: u8 = 1;

/// Whether retrying a failed store call can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorKind {
    Transient,
    Permanent,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErrorKind::Transient => f.write_str("transient"),
            StoreErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("secret store {kind} failure: {message}")]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StoreErrorKind::Transient
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Key/value backend holding secret bytes.
///
/// Implementations must be durable across restarts, must make `set_secret`
/// atomic with respect to concurrent reads, and must treat deleting a missing
/// key as success.
///
/// A write whose future is dropped part way, for example by a timeout, may
/// still take effect later but must never be left half applied. Callers treat
/// the outcome of a failed write as unknown until they read the key again.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    async fn delete_secret(&self, key: &str) -> Result<(), StoreError>;
}

/// Persisted access code and the policy it was created under.
#[derive(Clone)]
pub struct Secret {
    code: Zeroizing<String>,
    policy: PolicyTag,
}

impl Secret {
    pub fn new(code: impl Into<String>, policy: PolicyTag) -> Self {
        Self {
            code: Zeroizing::new(code.into()),
            policy,
        }
    }

    pub fn policy(&self) -> &PolicyTag {
        &self.policy
    }

    /// Exact, case-sensitive comparison in constant time.
    pub fn matches(&self, candidate: &str) -> bool {
        self.code.as_bytes().ct_eq(candidate.as_bytes()).into()
    }

    fn encode(&self) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let record = SecretRecordRef {
            version: RECORD_VERSION,
            code: &self.code,
            policy: &self.policy,
        };
        serde_json::to_vec(&record)
            .map(Zeroizing::new)
            .map_err(|err| StoreError::permanent(format!("failed to encode secret: {err}")))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let record: SecretRecord = serde_json::from_slice(bytes)
            .map_err(|err| StoreError::permanent(format!("stored secret is corrupt: {err}")))?;
        if record.version != RECORD_VERSION {
            return Err(StoreError::permanent(format!(
                "unsupported secret record version {}",
                record.version
            )));
        }
        Ok(Self {
            code: Zeroizing::new(record.code),
            policy: record.policy,
        })
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.policy == other.policy && self.matches(&other.code)
    }
}

impl Eq for Secret {}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SecretRecordRef<'a> {
    version: u8,
    code: &'a str,
    policy: &'a PolicyTag,
}

#[derive(Deserialize)]
struct SecretRecord {
    version: u8,
    code: String,
    policy: PolicyTag,
}

/// Adapter between guards and a [`SecretStore`]: one namespaced key per guard,
/// JSON records, and a deadline on every backend call.
#[derive(Clone)]
pub struct AccessCodeStore {
    backend: Arc<dyn SecretStore>,
    timeout: Duration,
}

impl AccessCodeStore {
    pub fn new(backend: Arc<dyn SecretStore>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn key_for(guard_id: &str) -> String {
        format!("{KEY_PREFIX}{guard_id}")
    }

    pub async fn load(&self, guard_id: &str) -> Result<Option<Secret>, StoreError> {
        let key = Self::key_for(guard_id);
        let bytes = self.bounded("load", self.backend.get_secret(&key)).await?;
        match bytes {
            Some(bytes) => {
                let bytes = Zeroizing::new(bytes);
                Secret::decode(&bytes).map(Some)
            }
            None => Ok(None),
        }
    }

    pub async fn save(&self, guard_id: &str, secret: &Secret) -> Result<(), StoreError> {
        self.bounded("save", self.write(guard_id, Some(secret))).await
    }

    pub async fn clear(&self, guard_id: &str) -> Result<(), StoreError> {
        self.bounded("clear", self.write(guard_id, None)).await
    }

    /// Deadline applied to each backend call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Save (`Some`) or clear (`None`) with no deadline; the caller bounds the wait.
    pub(crate) async fn write(
        &self,
        guard_id: &str,
        secret: Option<&Secret>,
    ) -> Result<(), StoreError> {
        let key = Self::key_for(guard_id);
        match secret {
            Some(secret) => {
                let bytes = secret.encode()?;
                self.backend.set_secret(&key, &bytes).await?;
                debug!("stored access code for guard {guard_id} ({})", secret.policy());
            }
            None => {
                self.backend.delete_secret(&key).await?;
                debug!("cleared access code for guard {guard_id}");
            }
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "secret store {operation} exceeded {} ms",
                    self.timeout.as_millis()
                );
                Err(StoreError::transient(format!(
                    "{operation} timed out after {} ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

/// Process-local backend. Not durable; intended for tests and ephemeral guards.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::permanent("memory store lock poisoned"))
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries()?.get(key).cloned())
    }

    async fn set_secret(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete_secret(&self, key: &str) -> Result<(), StoreError> {
        self.entries()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowStore;

    #[async_trait]
    impl SecretStore for SlowStore {
        async fn get_secret(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(None)
        }

        async fn set_secret(&self, _key: &str, _value: &[u8]) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        }

        async fn delete_secret(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn adapter(backend: Arc<dyn SecretStore>) -> AccessCodeStore {
        AccessCodeStore::new(backend, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = adapter(Arc::new(MemorySecretStore::new()));
        let secret = Secret::new("1234", PolicyTag::Numeric { length: 4 });
        store.save("app", &secret).await.unwrap();
        assert_eq!(store.load("app").await.unwrap(), Some(secret));
    }

    #[tokio::test]
    async fn save_overwrites_previous_secret() {
        let store = adapter(Arc::new(MemorySecretStore::new()));
        store
            .save("app", &Secret::new("1234", PolicyTag::Numeric { length: 4 }))
            .await
            .unwrap();
        let rotated = Secret::new("abc123", PolicyTag::Alphanumeric { length: 6 });
        store.save("app", &rotated).await.unwrap();
        assert_eq!(store.load("app").await.unwrap(), Some(rotated));
    }

    #[tokio::test]
    async fn guards_do_not_share_keys() {
        let backend = Arc::new(MemorySecretStore::new());
        let store = adapter(backend.clone());
        store
            .save("notes", &Secret::new("1111", PolicyTag::Numeric { length: 4 }))
            .await
            .unwrap();
        assert!(store.load("photos").await.unwrap().is_none());
        assert!(backend
            .get_secret("accessguard:v1:notes")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn clear_removes_secret_and_tolerates_missing() {
        let store = adapter(Arc::new(MemorySecretStore::new()));
        store
            .save("app", &Secret::new("1234", PolicyTag::Numeric { length: 4 }))
            .await
            .unwrap();
        store.clear("app").await.unwrap();
        assert!(store.load("app").await.unwrap().is_none());
        store.clear("app").await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_record_is_permanent_error() {
        let backend = Arc::new(MemorySecretStore::new());
        backend
            .set_secret(&AccessCodeStore::key_for("app"), b"not json")
            .await
            .unwrap();
        let err = adapter(backend).load("app").await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::Permanent);
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_transient() {
        let store = AccessCodeStore::new(Arc::new(SlowStore), Duration::from_millis(20));
        let err = store.load("app").await.unwrap_err();
        assert!(err.is_transient());
        let err = store
            .save("app", &Secret::new("1234", PolicyTag::Numeric { length: 4 }))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn secret_matching_is_exact() {
        let secret = Secret::new("AbC1", PolicyTag::Alphanumeric { length: 4 });
        assert!(secret.matches("AbC1"));
        assert!(!secret.matches("abc1"));
        assert!(!secret.matches("AbC"));
        assert!(!secret.matches("AbC12"));
    }
}
