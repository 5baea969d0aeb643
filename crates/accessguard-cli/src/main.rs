//! AccessGuard command-line interface: create, verify, rotate and remove access codes.

use accessguard_core::{
    logging, AccessGuard, AccessGuardConfig, FailureKind, GuardRegistry, GuardSession, PolicyTag,
    Stage, UnlockCallback, ValidationFailure,
};
use accessguard_keystore::FileSecretStore;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use log::info;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

const VERIFY_ATTEMPTS: usize = 3;
const SETUP_ATTEMPTS: usize = 5;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "accessguard",
    version,
    about = "Manage local access codes for AccessGuard protected applications."
)]
struct Cli {
    /// Path to the AccessGuard configuration file (TOML or YAML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the keystore directory from the configuration.
    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show whether a guard has a code and which policy it uses.
    Status {
        #[arg(default_value = "default")]
        guard: String,

        /// Print the guard snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Create the first access code for a guard.
    Setup {
        #[arg(default_value = "default")]
        guard: String,

        /// Index into the guard's allowed policies (see `status`).
        #[arg(long, default_value_t = 0)]
        policy: usize,
    },

    /// Check an access code.
    Verify {
        #[arg(default_value = "default")]
        guard: String,
    },

    /// Replace an existing code after verifying the current one.
    Change {
        #[arg(default_value = "default")]
        guard: String,

        #[arg(long, default_value_t = 0)]
        policy: usize,
    },

    /// Remove the code after verifying it; the guard returns to setup.
    Reset {
        #[arg(default_value = "default")]
        guard: String,
    },

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long, default_value = "/etc/accessguard.toml")]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

enum Attempt {
    Accepted,
    Rejected(String),
}

struct LogUnlock;

#[async_trait]
impl UnlockCallback for LogUnlock {
    async fn unlocked(&self) {
        info!("access granted");
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    if let Commands::Validate { file, schema } = &cli.command {
        return validate_config(file, *schema);
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = Arc::new(load_config(cli.config.as_deref())?);
    let store_dir = cli.store.clone().unwrap_or_else(|| config.store_path());
    let store = FileSecretStore::open(&store_dir)
        .await
        .with_context(|| format!("failed to open keystore at {}", store_dir.display()))?;
    let registry = GuardRegistry::new(config, Arc::new(store));

    match cli.command {
        Commands::Status { guard, json } => {
            let guard = registry.instance(&guard).await;
            let snapshot = guard.refresh().await?;
            if json {
                println!("{}", to_string_pretty(&snapshot)?);
                return Ok(());
            }
            print_status(&guard, snapshot.is_setup, snapshot.policy.as_ref());
        }
        Commands::Setup { guard, policy } => {
            let guard = open_guard(&registry, &guard).await;
            if guard.is_setup().await? {
                bail!(
                    "guard `{}` already has an access code; use `change` to replace it",
                    guard.id()
                );
            }
            let mut session = GuardSession::new(guard.clone());
            session.select_policy(policy)?;
            run_setup(&mut session).await?;
            println!("Access code for `{}` created.", guard.id());
        }
        Commands::Verify { guard } => {
            let guard = open_guard(&registry, &guard).await;
            let mut session = GuardSession::new(guard.clone());
            run_verify(&mut session).await?;
            println!("Access code accepted.");
            guard.lock().await;
        }
        Commands::Change { guard, policy } => {
            let guard = open_guard(&registry, &guard).await;
            let mut session = GuardSession::new(guard.clone());
            run_verify(&mut session).await?;
            guard.begin_setup().await?;
            session.select_policy(policy)?;
            run_setup(&mut session).await?;
            guard.lock().await;
            println!("Access code for `{}` changed.", guard.id());
        }
        Commands::Reset { guard } => {
            let guard = open_guard(&registry, &guard).await;
            let mut session = GuardSession::new(guard.clone());
            run_verify(&mut session).await?;
            guard
                .remove_code()
                .await
                .with_context(|| format!("failed to remove access code for `{}`", guard.id()))?;
            println!("Access code for `{}` removed.", guard.id());
        }
        Commands::Validate { file, schema } => validate_config(&file, schema)?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<AccessGuardConfig> {
    match path {
        Some(path) => AccessGuardConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(AccessGuardConfig::default()),
    }
}

fn validate_config(file: &Path, schema: bool) -> Result<()> {
    if schema {
        let schema = schema_for!(AccessGuardConfig);
        println!("{}", to_string_pretty(&schema)?);
        return Ok(());
    }

    let cfg = load_config(Some(file))?;
    let issues = cfg.validate();
    if issues.is_empty() {
        println!(
            "Configuration valid ({} guard overrides).",
            cfg.guards.len()
        );
        return Ok(());
    }

    eprintln!("Configuration validation failed:");
    for issue in issues {
        eprintln!("  - {issue}");
    }
    std::process::exit(1);
}

async fn open_guard(registry: &GuardRegistry, id: &str) -> Arc<AccessGuard> {
    let guard = registry.instance(id).await;
    guard.set_unlock_callback(Arc::new(LogUnlock)).await;
    guard
}

fn print_status(guard: &AccessGuard, is_setup: bool, policy: Option<&PolicyTag>) {
    println!("guard:   {}", guard.id());
    match (is_setup, policy) {
        (true, Some(policy)) => println!("code:    set ({policy})"),
        (true, None) => println!("code:    set"),
        (false, _) => println!("code:    not set"),
    }
    if guard.has_fixed_code() {
        println!("source:  fixed in configuration");
    }
    if let Some(timeout) = guard.settings().auto_lock {
        println!("lock:    after {}s in background", timeout.as_secs());
    }
    println!("allowed:");
    for (index, policy) in guard.allowed_policies().iter().enumerate() {
        println!("  [{index}] {policy}");
    }
}

/// Drive the first-code / confirmation steps until the guard reports success.
async fn run_setup(session: &mut GuardSession) -> Result<()> {
    let mut failures = 0;
    loop {
        let stage = session.snapshot().stage;
        let label = match stage {
            Stage::EnteringFirstCode => {
                let policy = session
                    .selected_policy()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                format!("New access code ({policy}): ")
            }
            Stage::ConfirmingCode => "Repeat access code: ".to_string(),
            Stage::Succeeded => {
                session.cancel_pressed().await?;
                return Ok(());
            }
            other => bail!("cannot set up a code while the guard is {other}"),
        };

        let code = prompt_code(label).await?;
        match attempt(session, &code).await? {
            Attempt::Accepted => {}
            Attempt::Rejected(message) => {
                eprintln!("{message}");
                failures += 1;
                if failures >= SETUP_ATTEMPTS {
                    session.cancel_pressed().await?;
                    bail!("giving up after {SETUP_ATTEMPTS} failed attempts");
                }
                if session.snapshot().stage == Stage::ConfirmingCode {
                    session.back_pressed().await?;
                }
            }
        }
    }
}

async fn run_verify(session: &mut GuardSession) -> Result<()> {
    let guard = session.guard().clone();
    if !guard.is_setup().await? {
        bail!(
            "guard `{}` has no access code; run `setup` first",
            guard.id()
        );
    }
    if session.snapshot().stage == Stage::Unlocked {
        return Ok(());
    }

    for _ in 0..VERIFY_ATTEMPTS {
        let code = prompt_code(format!("Access code for `{}`: ", guard.id())).await?;
        match attempt(session, &code).await? {
            Attempt::Accepted => return Ok(()),
            Attempt::Rejected(message) => eprintln!("{message}"),
        }
    }
    bail!("too many incorrect attempts")
}

/// Feed `code` to the session one character at a time and submit it.
async fn attempt(session: &mut GuardSession, code: &str) -> Result<Attempt> {
    session.clear_candidate();
    if let Some(policy) = session.active_policy() {
        if code.chars().count() > policy.max_length() {
            return Ok(Attempt::Rejected(ValidationFailure::TooLong.to_string()));
        }
    }
    for c in code.chars() {
        session.character_entered(c);
    }

    match session.submit_pressed().await {
        Ok(true) => Ok(Attempt::Accepted),
        Ok(false) => {
            session.clear_candidate();
            Ok(Attempt::Rejected(ValidationFailure::Incomplete.to_string()))
        }
        Err(err)
            if matches!(
                err.failure_kind(),
                Some(FailureKind::Validation | FailureKind::Mismatch)
            ) =>
        {
            Ok(Attempt::Rejected(err.user_message()))
        }
        Err(err) => Err(err.into()),
    }
}

async fn prompt_code(label: String) -> Result<Zeroizing<String>> {
    let code = tokio::task::spawn_blocking(move || prompt_password(label))
        .await
        .context("prompt task failed")?
        .context("failed to read access code")?;
    Ok(Zeroizing::new(code))
}
