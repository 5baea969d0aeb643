use crate::error::{GuardError, GuardResult};
use crate::policy::{default_policies, CodePolicy, PolicySpec};
use crate::validator::validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StoreCfg {
    #[serde(default = "default_store_path")]
    pub path: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_store_path() -> String {
    "/var/lib/accessguard/keystore".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Settings applied to every guard that has no explicit entry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GuardDefaults {
    #[serde(default = "default_policies")]
    pub policies: Vec<PolicySpec>,

    #[serde(default)]
    pub auto_lock_secs: Option<u64>,
}

impl Default for GuardDefaults {
    fn default() -> Self {
        Self {
            policies: default_policies(),
            auto_lock_secs: None,
        }
    }
}

/// Per-guard overrides. Unset fields fall back to `defaults`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GuardEntry {
    pub id: String,

    #[serde(default)]
    pub policies: Option<Vec<PolicySpec>>,

    #[serde(default)]
    pub auto_lock_secs: Option<u64>,

    /// Code baked into the deployment instead of chosen by the user.
    #[serde(default)]
    pub fixed_code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AccessGuardConfig {
    #[serde(default)]
    pub store: StoreCfg,

    #[serde(default)]
    pub defaults: GuardDefaults,

    #[serde(default)]
    pub guards: Vec<GuardEntry>,

    #[serde(skip)]
    pub path: PathBuf,
}

/// Fully resolved settings for a single guard.
#[derive(Debug, Clone)]
pub struct GuardSettings {
    pub policies: Vec<CodePolicy>,
    pub auto_lock: Option<Duration>,
    pub fixed_code: Option<String>,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            policies: default_policies().iter().map(PolicySpec::to_policy).collect(),
            auto_lock: None,
            fixed_code: None,
        }
    }
}

impl AccessGuardConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> GuardResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();

        let issues = cfg.validate();
        if let Some(first) = issues.into_iter().next() {
            return Err(GuardError::InvalidConfig(first));
        }

        Ok(cfg)
    }

    /// Collect every problem with the configuration instead of stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.store.timeout_ms == 0 {
            issues.push("store.timeout_ms must be greater than zero".to_string());
        }

        if self.defaults.policies.is_empty() {
            issues.push("defaults.policies must list at least one policy".to_string());
        }
        for spec in &self.defaults.policies {
            issues.extend(spec.issues().into_iter().map(|i| format!("defaults: {i}")));
        }

        let mut seen = HashSet::new();
        for entry in &self.guards {
            if entry.id.trim().is_empty() {
                issues.push("guard entries must have a non-empty id".to_string());
                continue;
            }
            if !seen.insert(entry.id.as_str()) {
                issues.push(format!("guard `{}` is declared more than once", entry.id));
            }
            if let Some(policies) = &entry.policies {
                if policies.is_empty() {
                    issues.push(format!(
                        "guard `{}`: policies must list at least one policy",
                        entry.id
                    ));
                }
                for spec in policies {
                    issues.extend(
                        spec.issues()
                            .into_iter()
                            .map(|i| format!("guard `{}`: {i}", entry.id)),
                    );
                }
            }
            if let Some(code) = &entry.fixed_code {
                let settings = self.settings_for(&entry.id);
                if !settings
                    .policies
                    .iter()
                    .any(|policy| validate(code, policy).is_valid())
                {
                    issues.push(format!(
                        "guard `{}`: fixed_code does not satisfy any allowed policy",
                        entry.id
                    ));
                }
            }
        }

        issues
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.store.path)
    }

    pub fn entry(&self, guard_id: &str) -> Option<&GuardEntry> {
        self.guards.iter().find(|g| g.id == guard_id)
    }

    /// Merge the entry for `guard_id` (if any) over the defaults.
    pub fn settings_for(&self, guard_id: &str) -> GuardSettings {
        let entry = self.entry(guard_id);
        let specs = entry
            .and_then(|e| e.policies.as_ref())
            .unwrap_or(&self.defaults.policies);
        let auto_lock_secs = entry
            .and_then(|e| e.auto_lock_secs)
            .or(self.defaults.auto_lock_secs);

        GuardSettings {
            policies: specs.iter().map(PolicySpec::to_policy).collect(),
            auto_lock: auto_lock_secs.map(Duration::from_secs),
            fixed_code: entry.and_then(|e| e.fixed_code.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn loads_toml_with_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accessguard.toml");
        fs::write(
            &path,
            r#"
            [store]
            path = "/tmp/keys"
            timeout_ms = 250

            [defaults]
            auto_lock_secs = 60

            [[guards]]
            id = "journal"
            policies = [{ kind = "alphanumeric", length = 6 }]
            "#,
        )
        .unwrap();

        let cfg = AccessGuardConfig::load(&path).unwrap();
        assert_eq!(cfg.store_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.path, path);

        let journal = cfg.settings_for("journal");
        assert_eq!(
            journal.policies,
            vec![CodePolicy::FixedLengthAlphanumeric(6)]
        );
        assert_eq!(journal.auto_lock, Some(Duration::from_secs(60)));

        let other = cfg.settings_for("other");
        assert_eq!(
            other.policies,
            vec![CodePolicy::four_digit(), CodePolicy::six_digit()]
        );
    }

    #[test]
    fn loads_yaml_by_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accessguard.yaml");
        fs::write(
            &path,
            "guards:\n  - id: kiosk\n    fixed_code: \"2468\"\n",
        )
        .unwrap();

        let cfg = AccessGuardConfig::load(&path).unwrap();
        assert_eq!(
            cfg.settings_for("kiosk").fixed_code.as_deref(),
            Some("2468")
        );
        assert_eq!(cfg.store.timeout_ms, 5_000);
    }

    #[test]
    fn rejects_fixed_code_outside_allow_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accessguard.toml");
        fs::write(
            &path,
            r#"
            [[guards]]
            id = "kiosk"
            fixed_code = "abcd"
            "#,
        )
        .unwrap();

        let err = AccessGuardConfig::load(&path).unwrap_err();
        assert!(matches!(err, GuardError::InvalidConfig(_)));
    }

    #[test]
    fn validate_collects_every_issue() {
        let cfg = AccessGuardConfig {
            store: StoreCfg {
                timeout_ms: 0,
                ..StoreCfg::default()
            },
            defaults: GuardDefaults {
                policies: Vec::new(),
                auto_lock_secs: None,
            },
            guards: vec![
                GuardEntry {
                    id: "a".into(),
                    policies: Some(vec![PolicySpec::Numeric { length: 0 }]),
                    auto_lock_secs: None,
                    fixed_code: None,
                },
                GuardEntry {
                    id: "a".into(),
                    policies: None,
                    auto_lock_secs: None,
                    fixed_code: None,
                },
            ],
            path: PathBuf::new(),
        };

        assert_eq!(cfg.validate().len(), 4);
    }
}
