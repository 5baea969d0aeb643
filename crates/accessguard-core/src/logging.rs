//! Log setup for AccessGuard processes.
//!
//! Records go to stderr, one JSON object per line unless plain text is asked
//! for. Access codes never reach the logger; only guard ids, stages and store
//! error messages do.

use env_logger::fmt::Formatter;
use env_logger::{Builder, Target};
use log::{warn, Record};
use serde_json::{json, Value};
use std::env;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::OnceLock;

const FORMAT_VAR: &str = "ACCESSGUARD_LOG_FORMAT";
const LEVEL_VAR: &str = "ACCESSGUARD_LOG_LEVEL";
const FILTER_VAR: &str = "RUST_LOG";

static INSTALLED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Plain,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "plain" | "text" => Ok(Self::Plain),
            other => Err(format!("unknown log format `{other}`")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Plain => "plain",
        })
    }
}

/// Where the logger takes its filter and format from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub filter: String,
    pub format: LogFormat,
    /// Format value that could not be parsed; reported once the logger is up.
    pub rejected_format: Option<String>,
}

impl LogSettings {
    /// `RUST_LOG` wins over `ACCESSGUARD_LOG_LEVEL`, which wins over
    /// `default_level`. An unknown format falls back to JSON.
    pub fn resolve(default_level: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let filter = lookup(FILTER_VAR)
            .or_else(|| lookup(LEVEL_VAR))
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());

        let (format, rejected_format) = match lookup(FORMAT_VAR) {
            None => (LogFormat::default(), None),
            Some(raw) => match raw.parse() {
                Ok(format) => (format, None),
                Err(_) => (LogFormat::default(), Some(raw)),
            },
        };

        Self {
            filter,
            format,
            rejected_format,
        }
    }

    pub fn from_env(default_level: &str) -> Self {
        Self::resolve(default_level, |name| env::var(name).ok())
    }
}

/// Install the global logger from the environment. Only the first call has
/// any effect.
pub fn init(default_level: &str) {
    INSTALLED.get_or_init(|| install(&LogSettings::from_env(default_level)));
}

fn install(settings: &LogSettings) {
    let mut builder = Builder::new();
    builder.parse_filters(&settings.filter).target(Target::Stderr);
    match settings.format {
        LogFormat::Json => builder.format(json_line),
        LogFormat::Plain => builder.format(plain_line),
    };

    if let Err(err) = builder.try_init() {
        eprintln!("logger already installed: {err}");
        return;
    }
    if let Some(raw) = &settings.rejected_format {
        warn!("ignoring {FORMAT_VAR}={raw}; using {}", settings.format);
    }
}

fn json_line(buf: &mut Formatter, record: &Record) -> io::Result<()> {
    let payload = json_payload(&buf.timestamp().to_string(), record);
    writeln!(buf, "{payload}")
}

fn plain_line(buf: &mut Formatter, record: &Record) -> io::Result<()> {
    writeln!(
        buf,
        "{} {:<5} [{}] {}",
        buf.timestamp(),
        record.level(),
        component(record.target()),
        record.args()
    )
}

fn json_payload(timestamp: &str, record: &Record) -> Value {
    json!({
        "timestamp": timestamp,
        "level": record.level().as_str().to_ascii_lowercase(),
        "component": component(record.target()),
        "target": record.target(),
        "message": record.args().to_string(),
    })
}

/// Module a record came from, without the crate path.
fn component(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::resolve("info", |name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_to_json_at_given_level() {
        let s = settings(&[]);
        assert_eq!(s.filter, "info");
        assert_eq!(s.format, LogFormat::Json);
        assert!(s.rejected_format.is_none());
    }

    #[test]
    fn rust_log_overrides_guard_level() {
        let s = settings(&[(LEVEL_VAR, "debug"), (FILTER_VAR, "accessguard_core=trace")]);
        assert_eq!(s.filter, "accessguard_core=trace");

        let s = settings(&[(LEVEL_VAR, "debug")]);
        assert_eq!(s.filter, "debug");
    }

    #[test]
    fn unknown_format_falls_back_and_is_reported() {
        let s = settings(&[(FORMAT_VAR, "Text")]);
        assert_eq!(s.format, LogFormat::Plain);

        let s = settings(&[(FORMAT_VAR, "xml")]);
        assert_eq!(s.format, LogFormat::Json);
        assert_eq!(s.rejected_format.as_deref(), Some("xml"));
    }

    #[test]
    fn json_payload_names_component() {
        let payload = json_payload(
            "2026-01-01T00:00:00Z",
            &Record::builder()
                .args(format_args!("guard notes unlocked"))
                .level(Level::Info)
                .target("accessguard_core::guard")
                .build(),
        );
        assert_eq!(payload["level"], "info");
        assert_eq!(payload["component"], "guard");
        assert_eq!(payload["target"], "accessguard_core::guard");
        assert_eq!(payload["message"], "guard notes unlocked");
    }

    #[test]
    fn component_of_bare_target_is_itself() {
        assert_eq!(component("accessguard"), "accessguard");
    }
}
