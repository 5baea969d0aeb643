use accessguard_core::config::{AccessGuardConfig, GuardEntry, StoreCfg};
use accessguard_core::guard::{GuardState, Stage};
use accessguard_core::policy::PolicySpec;
use accessguard_core::{GuardError, GuardRegistry, GuardSession};
use accessguard_keystore::FileSecretStore;
use std::sync::Arc;
use tempfile::tempdir;

fn config_for(dir: &std::path::Path) -> Arc<AccessGuardConfig> {
    Arc::new(AccessGuardConfig {
        store: StoreCfg {
            path: dir.display().to_string(),
            timeout_ms: 2_000,
        },
        guards: vec![GuardEntry {
            id: "journal".into(),
            policies: Some(vec![PolicySpec::Alphanumeric { length: 6 }]),
            auto_lock_secs: None,
            fixed_code: None,
        }],
        ..AccessGuardConfig::default()
    })
}

async fn registry(config: Arc<AccessGuardConfig>) -> GuardRegistry {
    let store = FileSecretStore::open(config.store_path()).await.unwrap();
    GuardRegistry::new(config, Arc::new(store))
}

fn type_code(session: &mut GuardSession, code: &str) {
    for c in code.chars() {
        session.character_entered(c);
    }
}

#[tokio::test]
async fn code_survives_restart() {
    let dir = tempdir().unwrap();
    let config = config_for(dir.path());

    {
        let registry = registry(config.clone()).await;
        let guard = registry.instance("journal").await;
        assert_eq!(guard.snapshot().stage, Stage::EnteringFirstCode);

        let mut session = GuardSession::new(guard.clone());
        type_code(&mut session, "Abc123");
        assert!(session.submit_pressed().await.unwrap());
        type_code(&mut session, "Abc123");
        assert!(session.submit_pressed().await.unwrap());
        assert_eq!(guard.snapshot().guard_state, GuardState::Unlocked);
    }

    let registry = registry(config).await;
    let guard = registry.instance("journal").await;
    let snapshot = guard.snapshot();
    assert!(snapshot.is_setup);
    assert_eq!(snapshot.guard_state, GuardState::Locked);

    let err = guard.submit_verification("abc123").await.unwrap_err();
    assert!(matches!(err, GuardError::IncorrectCode));
    guard.submit_verification("Abc123").await.unwrap();
    assert_eq!(guard.snapshot().stage, Stage::Unlocked);

    let other = registry.instance("photos").await;
    assert!(!other.is_setup().await.unwrap());
}

#[tokio::test]
async fn removed_code_stays_removed_after_restart() {
    let dir = tempdir().unwrap();
    let config = config_for(dir.path());

    {
        let registry = registry(config.clone()).await;
        let guard = registry.instance("journal").await;
        let policy = guard.allowed_policies()[0].clone();
        guard.submit_first_code("zz99zz", &policy).await.unwrap();
        guard.submit_confirmation("zz99zz", &policy).await.unwrap();
        guard.remove_code().await.unwrap();
    }

    let registry = registry(config).await;
    let guard = registry.instance("journal").await;
    assert!(!guard.is_setup().await.unwrap());
    assert_eq!(guard.snapshot().guard_state, GuardState::Uninitialized);
}
