//! Code policies: the shape a code must have (length bounds and character class).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Upper bound for variable-length built-in policies.
pub const MAX_CODE_LENGTH: usize = 64;

/// Per-character acceptance rule for custom policies.
pub type CharPredicate = Arc<dyn Fn(char) -> bool + Send + Sync>;

/// Rule set a candidate code is validated against.
#[derive(Clone)]
pub enum CodePolicy {
    FixedLengthNumeric(usize),
    FixedLengthAlphanumeric(usize),
    Custom(CustomPolicy),
}

/// Variable-length policy with a caller supplied character class.
#[derive(Clone)]
pub struct CustomPolicy {
    name: String,
    min_length: usize,
    max_length: usize,
    predicate: CharPredicate,
}

impl CustomPolicy {
    pub fn new(
        name: impl Into<String>,
        min_length: usize,
        max_length: usize,
        predicate: impl Fn(char) -> bool + Send + Sync + 'static,
    ) -> Self {
        let min_length = min_length.max(1);
        Self {
            name: name.into(),
            min_length,
            max_length: max_length.max(min_length),
            predicate: Arc::new(predicate),
        }
    }

    /// Digits only, any length within the bounds.
    pub fn numeric(min_length: usize, max_length: usize) -> Self {
        Self::new("custom-numeric", min_length, max_length, |c| {
            c.is_ascii_digit()
        })
    }

    /// Letters and digits, any length within the bounds.
    pub fn alphanumeric(min_length: usize, max_length: usize) -> Self {
        Self::new("custom-alphanumeric", min_length, max_length, char::is_alphanumeric)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accepts(&self, c: char) -> bool {
        (self.predicate)(c)
    }
}

impl fmt::Debug for CustomPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomPolicy")
            .field("name", &self.name)
            .field("min_length", &self.min_length)
            .field("max_length", &self.max_length)
            .finish_non_exhaustive()
    }
}

impl CodePolicy {
    pub fn four_digit() -> Self {
        CodePolicy::FixedLengthNumeric(4)
    }

    pub fn six_digit() -> Self {
        CodePolicy::FixedLengthNumeric(6)
    }

    pub fn min_length(&self) -> usize {
        match self {
            CodePolicy::FixedLengthNumeric(len) | CodePolicy::FixedLengthAlphanumeric(len) => *len,
            CodePolicy::Custom(custom) => custom.min_length,
        }
    }

    pub fn max_length(&self) -> usize {
        match self {
            CodePolicy::FixedLengthNumeric(len) | CodePolicy::FixedLengthAlphanumeric(len) => *len,
            CodePolicy::Custom(custom) => custom.max_length,
        }
    }

    /// Whether `c` belongs to this policy's character class.
    pub fn accepts(&self, c: char) -> bool {
        match self {
            CodePolicy::FixedLengthNumeric(_) => c.is_ascii_digit(),
            CodePolicy::FixedLengthAlphanumeric(_) => c.is_alphanumeric(),
            CodePolicy::Custom(custom) => custom.accepts(c),
        }
    }

    /// Keyboard affordance hint for the presentation layer.
    pub fn is_numeric(&self) -> bool {
        match self {
            CodePolicy::FixedLengthNumeric(_) => true,
            CodePolicy::FixedLengthAlphanumeric(_) => false,
            CodePolicy::Custom(custom) => custom.name == "custom-numeric",
        }
    }

    pub fn tag(&self) -> PolicyTag {
        match self {
            CodePolicy::FixedLengthNumeric(length) => PolicyTag::Numeric { length: *length },
            CodePolicy::FixedLengthAlphanumeric(length) => {
                PolicyTag::Alphanumeric { length: *length }
            }
            CodePolicy::Custom(custom) => PolicyTag::Custom {
                name: custom.name.clone(),
                min_length: custom.min_length,
                max_length: custom.max_length,
            },
        }
    }
}

/// Two policies are the same rule when their tags agree; custom predicates are
/// identified by name.
impl PartialEq for CodePolicy {
    fn eq(&self, other: &Self) -> bool {
        self.tag() == other.tag()
    }
}

impl Eq for CodePolicy {}

impl fmt::Debug for CodePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodePolicy::FixedLengthNumeric(len) => {
                f.debug_tuple("FixedLengthNumeric").field(len).finish()
            }
            CodePolicy::FixedLengthAlphanumeric(len) => {
                f.debug_tuple("FixedLengthAlphanumeric").field(len).finish()
            }
            CodePolicy::Custom(custom) => f.debug_tuple("Custom").field(custom).finish(),
        }
    }
}

impl fmt::Display for CodePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.tag().fmt(f)
    }
}

/// Serializable descriptor of a policy, persisted next to the code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyTag {
    Numeric {
        length: usize,
    },
    Alphanumeric {
        length: usize,
    },
    Custom {
        name: String,
        min_length: usize,
        max_length: usize,
    },
}

impl PolicyTag {
    /// Rebuild the policy this tag describes. Fixed-length kinds are rebuilt
    /// directly; custom policies must be present in `allowed`.
    pub fn resolve(&self, allowed: &[CodePolicy]) -> Option<CodePolicy> {
        match self {
            PolicyTag::Numeric { length } => Some(CodePolicy::FixedLengthNumeric(*length)),
            PolicyTag::Alphanumeric { length } => {
                Some(CodePolicy::FixedLengthAlphanumeric(*length))
            }
            PolicyTag::Custom { .. } => allowed.iter().find(|p| &p.tag() == self).cloned(),
        }
    }
}

impl fmt::Display for PolicyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyTag::Numeric { length } => write!(f, "{length}-digit numeric"),
            PolicyTag::Alphanumeric { length } => write!(f, "{length}-character alphanumeric"),
            PolicyTag::Custom {
                name,
                min_length,
                max_length,
            } => write!(f, "{name} ({min_length}-{max_length})"),
        }
    }
}

/// Policy entry as written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicySpec {
    Numeric {
        length: usize,
    },
    Alphanumeric {
        length: usize,
    },
    CustomNumeric {
        #[serde(default = "default_custom_min")]
        min_length: usize,
        #[serde(default = "default_custom_max")]
        max_length: usize,
    },
    CustomAlphanumeric {
        #[serde(default = "default_custom_min")]
        min_length: usize,
        #[serde(default = "default_custom_max")]
        max_length: usize,
    },
}

fn default_custom_min() -> usize {
    4
}

fn default_custom_max() -> usize {
    MAX_CODE_LENGTH
}

impl PolicySpec {
    pub fn to_policy(&self) -> CodePolicy {
        match self {
            PolicySpec::Numeric { length } => CodePolicy::FixedLengthNumeric(*length),
            PolicySpec::Alphanumeric { length } => CodePolicy::FixedLengthAlphanumeric(*length),
            PolicySpec::CustomNumeric {
                min_length,
                max_length,
            } => CodePolicy::Custom(CustomPolicy::numeric(*min_length, *max_length)),
            PolicySpec::CustomAlphanumeric {
                min_length,
                max_length,
            } => CodePolicy::Custom(CustomPolicy::alphanumeric(*min_length, *max_length)),
        }
    }

    /// Configuration problems with this entry, if any.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        match self {
            PolicySpec::Numeric { length } | PolicySpec::Alphanumeric { length } => {
                if *length == 0 {
                    issues.push("fixed-length policy must have a length of at least 1".into());
                }
                if *length > MAX_CODE_LENGTH {
                    issues.push(format!(
                        "fixed-length policy length {length} exceeds {MAX_CODE_LENGTH}"
                    ));
                }
            }
            PolicySpec::CustomNumeric {
                min_length,
                max_length,
            }
            | PolicySpec::CustomAlphanumeric {
                min_length,
                max_length,
            } => {
                if *min_length == 0 {
                    issues.push("custom policy min_length must be at least 1".into());
                }
                if min_length > max_length {
                    issues.push(format!(
                        "custom policy min_length {min_length} is greater than max_length {max_length}"
                    ));
                }
            }
        }
        issues
    }
}

/// Default allow-list: four and six digit numeric codes.
pub fn default_policies() -> Vec<PolicySpec> {
    vec![
        PolicySpec::Numeric { length: 4 },
        PolicySpec::Numeric { length: 6 },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policies_have_equal_bounds() {
        let policy = CodePolicy::six_digit();
        assert_eq!(policy.min_length(), 6);
        assert_eq!(policy.max_length(), 6);
        assert!(policy.is_numeric());
    }

    #[test]
    fn custom_policy_clamps_bounds() {
        let policy = CustomPolicy::numeric(0, 0);
        let policy = CodePolicy::Custom(policy);
        assert_eq!(policy.min_length(), 1);
        assert_eq!(policy.max_length(), 1);
    }

    #[test]
    fn custom_tag_resolves_only_against_allow_list() {
        let custom = CodePolicy::Custom(CustomPolicy::new("hex", 4, 8, |c| c.is_ascii_hexdigit()));
        let tag = custom.tag();
        assert!(tag.resolve(&[]).is_none());

        let resolved = tag.resolve(&[CodePolicy::four_digit(), custom.clone()]);
        assert_eq!(resolved, Some(custom));
    }

    #[test]
    fn fixed_tags_resolve_without_allow_list() {
        let tag = PolicyTag::Alphanumeric { length: 5 };
        assert_eq!(
            tag.resolve(&[]),
            Some(CodePolicy::FixedLengthAlphanumeric(5))
        );
    }

    #[test]
    fn policy_spec_reports_inverted_bounds() {
        let spec = PolicySpec::CustomAlphanumeric {
            min_length: 8,
            max_length: 4,
        };
        assert_eq!(spec.issues().len(), 1);
        assert!(PolicySpec::Numeric { length: 4 }.issues().is_empty());
    }

    #[test]
    fn policy_spec_parses_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            policies: Vec<PolicySpec>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [[policies]]
            kind = "numeric"
            length = 6

            [[policies]]
            kind = "custom_alphanumeric"
            min_length = 6
            "#,
        )
        .unwrap();
        assert_eq!(parsed.policies[0], PolicySpec::Numeric { length: 6 });
        assert_eq!(
            parsed.policies[1],
            PolicySpec::CustomAlphanumeric {
                min_length: 6,
                max_length: MAX_CODE_LENGTH
            }
        );
    }
}
