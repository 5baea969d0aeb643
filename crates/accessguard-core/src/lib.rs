pub mod config;
pub mod error;
pub mod guard;
pub mod logging;
pub mod policy;
pub mod registry;
pub mod session;
pub mod store;
pub mod validator;

pub use config::{AccessGuardConfig, GuardDefaults, GuardEntry, GuardSettings, StoreCfg};
pub use error::{FailureKind, GuardError, GuardResult};
pub use guard::{AccessGuard, GuardFailure, GuardSnapshot, GuardState, Stage, UnlockCallback};
pub use policy::{CodePolicy, CustomPolicy, PolicySpec, PolicyTag};
pub use registry::GuardRegistry;
pub use session::GuardSession;
pub use store::{AccessCodeStore, MemorySecretStore, Secret, SecretStore, StoreError, StoreErrorKind};
pub use validator::{validate, Candidate, ValidationFailure, ValidationResult};
