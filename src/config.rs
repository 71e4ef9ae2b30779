use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::enums::ChannelKind;
use crate::triage::engine::DEFAULT_REPLAY_WINDOW_DAYS;
use crate::triage::RetryPolicy;

/// Application-level constants
pub const APP_NAME: &str = "BiCareTriage";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Rule set used when no rules file is configured.
pub const DEFAULT_RULES_JSON: &str = include_str!("../resources/rules/default_rules.json");

const DEFAULT_BIND: &str = "127.0.0.1:8088";
const DEFAULT_DISPATCH_WORKERS: usize = 4;
const DEFAULT_INTAKE_CAPACITY: usize = 1024;

/// Get the application data directory, `~/BiCareTriage/`.
/// Falls back to the working directory when no home is known.
pub fn app_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(APP_NAME),
        None => PathBuf::from(APP_NAME),
    }
}

/// Default location of the alert database.
pub fn default_db_path() -> PathBuf {
    app_data_dir().join("triage.db")
}

/// Default tracing filter, overridden by `RUST_LOG`.
pub fn default_log_filter() -> &'static str {
    "info,bicare_triage=debug"
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings, read from `BICARE_TRIAGE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    /// `None` runs on the built-in rule set; reload is then unavailable.
    pub rules_path: Option<PathBuf>,
    pub bind: SocketAddr,
    pub dispatch_workers: usize,
    pub intake_capacity: usize,
    pub retry: RetryPolicy,
    /// How long processed signals are remembered for replay detection.
    pub replay_window: chrono::Duration,
    /// Webhook endpoints per channel kind. Kinds without one log instead.
    pub webhooks: Vec<(ChannelKind, String)>,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = RetryPolicy::default();

        let db_path = get("BICARE_TRIAGE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(default_db_path);
        let rules_path = get("BICARE_TRIAGE_RULES").map(PathBuf::from);
        let bind = parse_or("BICARE_TRIAGE_BIND", get("BICARE_TRIAGE_BIND"), || {
            DEFAULT_BIND.parse().map_err(|_| "default bind address".to_string())
        })?;
        let dispatch_workers = positive(
            "BICARE_TRIAGE_DISPATCH_WORKERS",
            get("BICARE_TRIAGE_DISPATCH_WORKERS"),
            DEFAULT_DISPATCH_WORKERS,
        )?;
        let intake_capacity = positive(
            "BICARE_TRIAGE_INTAKE_CAPACITY",
            get("BICARE_TRIAGE_INTAKE_CAPACITY"),
            DEFAULT_INTAKE_CAPACITY,
        )?;

        let max_attempts = positive(
            "BICARE_TRIAGE_MAX_ATTEMPTS",
            get("BICARE_TRIAGE_MAX_ATTEMPTS"),
            defaults.max_attempts_per_channel as usize,
        )?;
        let retry = RetryPolicy {
            max_attempts_per_channel: u32::try_from(max_attempts).map_err(|_| {
                ConfigError::Invalid {
                    var: "BICARE_TRIAGE_MAX_ATTEMPTS",
                    value: max_attempts.to_string(),
                    reason: "too large".into(),
                }
            })?,
            base_delay: millis(
                "BICARE_TRIAGE_BACKOFF_BASE_MS",
                get("BICARE_TRIAGE_BACKOFF_BASE_MS"),
                defaults.base_delay,
            )?,
            max_delay: millis(
                "BICARE_TRIAGE_BACKOFF_MAX_MS",
                get("BICARE_TRIAGE_BACKOFF_MAX_MS"),
                defaults.max_delay,
            )?,
            jitter: defaults.jitter,
            send_timeout: millis(
                "BICARE_TRIAGE_SEND_TIMEOUT_MS",
                get("BICARE_TRIAGE_SEND_TIMEOUT_MS"),
                defaults.send_timeout,
            )?,
        };

        let replay_days = positive(
            "BICARE_TRIAGE_REPLAY_WINDOW_DAYS",
            get("BICARE_TRIAGE_REPLAY_WINDOW_DAYS"),
            DEFAULT_REPLAY_WINDOW_DAYS as usize,
        )?;
        let replay_window = i64::try_from(replay_days)
            .ok()
            .and_then(chrono::Duration::try_days)
            .ok_or_else(|| ConfigError::Invalid {
                var: "BICARE_TRIAGE_REPLAY_WINDOW_DAYS",
                value: replay_days.to_string(),
                reason: "too large".into(),
            })?;

        let webhooks = [
            (ChannelKind::Push, "BICARE_TRIAGE_WEBHOOK_PUSH"),
            (ChannelKind::Sms, "BICARE_TRIAGE_WEBHOOK_SMS"),
            (ChannelKind::Voice, "BICARE_TRIAGE_WEBHOOK_VOICE"),
        ]
        .into_iter()
        .filter_map(|(kind, var)| get(var).map(|url| (kind, url)))
        .collect();

        Ok(Self {
            db_path,
            rules_path,
            bind,
            dispatch_workers,
            intake_capacity,
            retry,
            replay_window,
            webhooks,
        })
    }
}

fn parse_or<T, D>(var: &'static str, raw: Option<String>, default: D) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    D: FnOnce() -> Result<T, String>,
{
    match raw {
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
        None => default().map_err(|reason| ConfigError::Invalid {
            var,
            value: String::new(),
            reason,
        }),
    }
}

fn positive(var: &'static str, raw: Option<String>, default: usize) -> Result<usize, ConfigError> {
    let value: usize = parse_or(var, raw, || Ok(default))?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }
    Ok(value)
}

fn millis(var: &'static str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    let ms: u64 = parse_or(var, raw, || Ok(default.as_millis() as u64))?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::triage::RuleSet;

    fn config_from(vars: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn app_data_dir_ends_with_app_name() {
        assert!(app_data_dir().ends_with(APP_NAME));
        assert!(default_db_path().starts_with(app_data_dir()));
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8088".parse::<SocketAddr>().unwrap());
        assert_eq!(config.dispatch_workers, 4);
        assert_eq!(config.rules_path, None);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.replay_window, chrono::Duration::days(7));
        assert!(config.webhooks.is_empty());
    }

    #[test]
    fn env_overrides_are_read() {
        let config = config_from(&[
            ("BICARE_TRIAGE_DB", "/var/lib/triage/alerts.db"),
            ("BICARE_TRIAGE_RULES", "/etc/triage/rules.json"),
            ("BICARE_TRIAGE_BIND", "0.0.0.0:9000"),
            ("BICARE_TRIAGE_DISPATCH_WORKERS", "8"),
            ("BICARE_TRIAGE_MAX_ATTEMPTS", "5"),
            ("BICARE_TRIAGE_SEND_TIMEOUT_MS", "2500"),
            ("BICARE_TRIAGE_REPLAY_WINDOW_DAYS", "30"),
            ("BICARE_TRIAGE_WEBHOOK_SMS", "http://sms-gateway.local/send"),
        ])
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/triage/alerts.db"));
        assert_eq!(config.rules_path, Some(PathBuf::from("/etc/triage/rules.json")));
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.dispatch_workers, 8);
        assert_eq!(config.retry.max_attempts_per_channel, 5);
        assert_eq!(config.retry.send_timeout, Duration::from_millis(2500));
        assert_eq!(config.replay_window, chrono::Duration::days(30));
        assert_eq!(
            config.webhooks,
            vec![(ChannelKind::Sms, "http://sms-gateway.local/send".to_string())]
        );
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config_from(&[("BICARE_TRIAGE_RULES", "  ")]).unwrap();
        assert_eq!(config.rules_path, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = config_from(&[("BICARE_TRIAGE_BIND", "localhost")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BICARE_TRIAGE_BIND", .. }));

        let err = config_from(&[("BICARE_TRIAGE_DISPATCH_WORKERS", "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "BICARE_TRIAGE_DISPATCH_WORKERS",
                ..
            }
        ));
    }

    #[test]
    fn bundled_rules_are_valid() {
        let set = RuleSet::from_json(DEFAULT_RULES_JSON).unwrap();
        assert_eq!(set.version, 1);
        assert!(set.rule("red-flag-symptoms").is_some());
        assert!(set.rule("manual-flag").is_some());
    }
}
