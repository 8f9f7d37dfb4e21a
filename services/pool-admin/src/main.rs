//! Gemini key pool admin
//!
//! Operator CLI over the key usage state shared with the tutoring service:
//! 1. Loads config (TOML + env overlay) and API keys from the environment
//! 2. Reloads persisted usage/exhausted/invalid state, clearing stale cooldowns
//! 3. Runs one command and prints JSON (or Prometheus text) on stdout
//!
//! Logs go to stderr as JSON so stdout stays machine-readable.

mod config;
mod metrics;

use std::io::Write;

use anyhow::{Context, Result, bail};
use gemini_pool::{CredentialPool, KeyRotator, KeyState};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

const USAGE: &str = "usage: gemini-pool-admin [--config <path>] <command>

commands:
  status [--prometheus]   pool summary and per-key state
  next                    key that the next request would use
  success <index>         record a successful call
  exhausted <index>       put a key into cooldown
  invalid <index>         disable a key permanently";

/// One CLI invocation.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Status { prometheus: bool },
    Next,
    Success(usize),
    Exhausted(usize),
    Invalid(usize),
}

/// Parsed command line.
#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config_path: Option<String>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config_path = None;
    let mut rest = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().context("--config needs a path")?;
            config_path = Some(path.clone());
        } else {
            rest.push(arg.as_str());
        }
    }

    let index = |value: Option<&&str>| -> Result<usize> {
        let raw = value.context("missing key index")?;
        raw.parse()
            .with_context(|| format!("key index must be a non-negative integer, got {raw:?}"))
    };

    let command = match rest.as_slice() {
        ["status"] => Command::Status { prometheus: false },
        ["status", "--prometheus"] => Command::Status { prometheus: true },
        ["next"] => Command::Next,
        ["success", tail @ ..] if tail.len() <= 1 => Command::Success(index(tail.first())?),
        ["exhausted", tail @ ..] if tail.len() <= 1 => Command::Exhausted(index(tail.first())?),
        ["invalid", tail @ ..] if tail.len() <= 1 => Command::Invalid(index(tail.first())?),
        _ => bail!("{USAGE}"),
    };

    Ok(Cli {
        config_path,
        command,
    })
}

fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    let (config, config_path) = Config::load_resolved(cli.config_path.as_deref())
        .context("failed to load configuration")?;

    info!(
        config = %config_path.display(),
        env_prefix = %config.pool.env_prefix,
        daily_limit = config.pool.daily_limit,
        cooldown_hours = config.pool.cooldown_hours,
        state_path = %config.state_path().display(),
        "configuration loaded"
    );

    let pool = CredentialPool::from_env(&config.pool.env_prefix);
    let rotator = KeyRotator::open(pool, config.state_path(), config.rotator_config());

    run(&rotator, cli.command, &mut std::io::stdout().lock())
}

/// Execute one command against the rotator, writing the result to `out`.
fn run(rotator: &KeyRotator, command: Command, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Status { prometheus: true } => {
            let text = metrics::render_pool_status(&rotator.status(), &rotator.key_states());
            write!(out, "{text}")?;
            return Ok(());
        }
        Command::Status { prometheus: false } => {}
        Command::Next => {
            let Some(selected) = rotator.next_credential() else {
                bail!("no API key available: all keys exhausted or invalid");
            };
            let body = serde_json::json!({
                "index": selected.index,
                "fingerprint": selected.key.fingerprint(),
                "remaining": rotator
                    .config()
                    .daily_limit
                    .saturating_sub(rotator.usage(selected.index)),
            });
            writeln!(out, "{}", serde_json::to_string_pretty(&body)?)?;
            return Ok(());
        }
        Command::Success(index) => {
            check_index(rotator, index)?;
            check_quota(rotator, index)?;
            rotator.record_success(index);
        }
        Command::Exhausted(index) => {
            check_index(rotator, index)?;
            rotator.mark_exhausted(index);
        }
        Command::Invalid(index) => {
            check_index(rotator, index)?;
            rotator.mark_invalid(index);
        }
    }

    let body = serde_json::json!({
        "status": rotator.status(),
        "keys": rotator.key_states(),
    });
    writeln!(out, "{}", serde_json::to_string_pretty(&body)?)?;
    Ok(())
}

fn check_index(rotator: &KeyRotator, index: usize) -> Result<()> {
    if index >= rotator.key_count() {
        bail!(
            "key index {index} out of range: {} keys configured",
            rotator.key_count()
        );
    }
    Ok(())
}

fn check_quota(rotator: &KeyRotator, index: usize) -> Result<()> {
    let state = rotator.key_state(index);
    if state != KeyState::Available {
        bail!("key {index} is {}, not available", state.label());
    }
    let usage = rotator.usage(index);
    if usage >= rotator.config().daily_limit {
        bail!(
            "key {index} has no quota left: {usage} of {} calls used",
            rotator.config().daily_limit
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemini_pool::RotatorConfig;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn rotator(dir: &tempfile::TempDir, n: usize) -> KeyRotator {
        KeyRotator::open(
            CredentialPool::from_keys((0..n).map(|i| format!("AIzaSyAdminKey-{i:04}"))),
            dir.path().join("api_key_usage.json"),
            RotatorConfig {
                daily_limit: 3,
                ..RotatorConfig::default()
            },
        )
    }

    fn run_to_string(rotator: &KeyRotator, command: Command) -> Result<String> {
        let mut out = Vec::new();
        run(rotator, command, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse_args(&args(&["status"])).unwrap().command,
            Command::Status { prometheus: false }
        );
        assert_eq!(
            parse_args(&args(&["status", "--prometheus"])).unwrap().command,
            Command::Status { prometheus: true }
        );
        assert_eq!(parse_args(&args(&["next"])).unwrap().command, Command::Next);
        assert_eq!(
            parse_args(&args(&["success", "2"])).unwrap().command,
            Command::Success(2)
        );
        assert_eq!(
            parse_args(&args(&["exhausted", "0"])).unwrap().command,
            Command::Exhausted(0)
        );
        assert_eq!(
            parse_args(&args(&["invalid", "1"])).unwrap().command,
            Command::Invalid(1)
        );
    }

    #[test]
    fn config_flag_anywhere() {
        let cli = parse_args(&args(&["status", "--config", "/etc/pool.toml"])).unwrap();
        assert_eq!(cli.config_path.as_deref(), Some("/etc/pool.toml"));
        assert_eq!(cli.command, Command::Status { prometheus: false });

        let cli = parse_args(&args(&["--config", "pool.toml", "next"])).unwrap();
        assert_eq!(cli.config_path.as_deref(), Some("pool.toml"));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["reset"])).is_err());
        assert!(parse_args(&args(&["success"])).is_err());
        assert!(parse_args(&args(&["success", "-1"])).is_err());
        assert!(parse_args(&args(&["success", "1", "2"])).is_err());
        assert!(parse_args(&args(&["status", "--config"])).is_err());
    }

    #[test]
    fn status_prints_summary_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = rotator(&dir, 2);

        let out = run_to_string(&rotator, Command::Status { prometheus: false }).unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["status"]["total_keys"], 2);
        assert_eq!(json["status"]["total_remaining"], 6);
        assert_eq!(json["keys"][1]["fingerprint"], "…0001");
        assert!(!out.contains("AIzaSy"));
    }

    #[test]
    fn outcome_commands_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let rotator = rotator(&dir, 3);
            run_to_string(&rotator, Command::Success(0)).unwrap();
            run_to_string(&rotator, Command::Exhausted(1)).unwrap();
            run_to_string(&rotator, Command::Invalid(2)).unwrap();
        }

        let reopened = rotator(&dir, 3);
        let status = reopened.status();
        assert_eq!(status.active_keys, 1);
        assert_eq!(status.exhausted_keys, 1);
        assert_eq!(status.invalid_keys, 1);
        assert_eq!(reopened.usage(0), 1);
    }

    #[test]
    fn next_reports_index_and_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = rotator(&dir, 2);
        rotator.record_success(0);

        let out = run_to_string(&rotator, Command::Next).unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["index"], 0);
        assert_eq!(json["remaining"], 2);
    }

    #[test]
    fn next_fails_when_pool_drained() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = rotator(&dir, 1);
        rotator.mark_invalid(0);

        let err = run_to_string(&rotator, Command::Next).unwrap_err();
        assert!(err.to_string().contains("no API key available"));
    }

    #[test]
    fn out_of_range_index_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = rotator(&dir, 1);
        let err = run_to_string(&rotator, Command::Exhausted(4)).unwrap_err();
        assert!(err.to_string().contains("out of range"), "got: {err}");
        assert_eq!(rotator.status().exhausted_keys, 0);
    }

    #[test]
    fn success_rejected_without_quota() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = rotator(&dir, 2);
        for _ in 0..3 {
            run_to_string(&rotator, Command::Success(0)).unwrap();
        }

        let err = run_to_string(&rotator, Command::Success(0)).unwrap_err();
        assert!(err.to_string().contains("no quota left"), "got: {err}");
        assert_eq!(rotator.usage(0), 3);

        rotator.mark_exhausted(1);
        let err = run_to_string(&rotator, Command::Success(1)).unwrap_err();
        assert!(err.to_string().contains("not available"), "got: {err}");
    }

    #[test]
    fn status_prometheus_renders_gauges() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = rotator(&dir, 2);
        let out = run_to_string(&rotator, Command::Status { prometheus: true }).unwrap();
        assert!(out.contains("gemini_pool_keys"), "got:\n{out}");
        assert!(out.contains("gemini_pool_remaining 6"));
    }
}
