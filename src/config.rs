//! Runtime configuration, read from the environment (and `.env` via `dotenvy`).

use {
    crate::domain::provider::Provider,
    std::{env, net::SocketAddr, str::FromStr, time::Duration},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Upper bound for every configured interval, so clock arithmetic on
/// `DateTime<Utc>` stays in range.
const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Idempotency guard knobs.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub processing_timeout: Duration,
    pub max_attempts: i32,
    pub cache_ttl: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_secs(300),
            max_attempts: 5,
            cache_ttl: Duration::from_secs(3 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_conflict_retries: u32,
    pub conflict_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            conflict_backoff: Duration::from_millis(25),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub sweep_interval: Duration,
    pub batch_size: i64,
    pub retention: Duration,
    pub archive_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            batch_size: 50,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            archive_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Per-provider webhook secrets. A provider without one is disabled.
#[derive(Clone, Default)]
pub struct ProviderSecrets {
    pub stripe: Option<String>,
    pub paystack: Option<String>,
    pub flutterwave: Option<String>,
    /// Base64 Ed25519 public key of the M-Pesa callback relay.
    pub mpesa_public_key: Option<String>,
}

impl std::fmt::Debug for ProviderSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let on = |s: &Option<String>| if s.is_some() { "set" } else { "unset" };
        f.debug_struct("ProviderSecrets")
            .field("stripe", &on(&self.stripe))
            .field("paystack", &on(&self.paystack))
            .field("flutterwave", &on(&self.flutterwave))
            .field("mpesa_public_key", &on(&self.mpesa_public_key))
            .finish()
    }
}

impl ProviderSecrets {
    pub fn enabled(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| match p {
                Provider::Stripe => self.stripe.is_some(),
                Provider::Paystack => self.paystack.is_some(),
                Provider::Flutterwave => self.flutterwave.is_some(),
                Provider::Mpesa => self.mpesa_public_key.is_some(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub max_db_connections: u32,
    pub run_migrations: bool,
    pub request_timeout: Duration,
    pub replay_window: Duration,
    pub guard: GuardConfig,
    pub dispatch: DispatchConfig,
    pub supervisor: SupervisorConfig,
    pub outbox_poll_interval: Duration,
    pub secrets: ProviderSecrets,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let secs = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            parse_or(get(key), key, default).map(Duration::from_secs)
        };

        let guard = GuardConfig {
            processing_timeout: secs("PROCESSING_TIMEOUT_SECS", 300)?,
            max_attempts: parse_or(get("MAX_ATTEMPTS"), "MAX_ATTEMPTS", 5)?,
            cache_ttl: secs("IDEMPOTENCY_CACHE_TTL_SECS", 259_200)?,
        };
        let dispatch = DispatchConfig {
            max_conflict_retries: parse_or(get("MAX_CONFLICT_RETRIES"), "MAX_CONFLICT_RETRIES", 3)?,
            conflict_backoff: Duration::from_millis(parse_or(
                get("CONFLICT_BACKOFF_MS"),
                "CONFLICT_BACKOFF_MS",
                25,
            )?),
        };
        let retention_days: u64 =
            parse_or(get("EVENT_RETENTION_DAYS"), "EVENT_RETENTION_DAYS", 30)?;
        let retention_secs = retention_days
            .checked_mul(24 * 60 * 60)
            .ok_or_else(|| ConfigError::Invalid {
                key: "EVENT_RETENTION_DAYS",
                reason: "out of range".into(),
            })?;
        let supervisor = SupervisorConfig {
            sweep_interval: secs("SWEEP_INTERVAL_SECS", 60)?,
            batch_size: parse_or(get("SWEEP_BATCH_SIZE"), "SWEEP_BATCH_SIZE", 50)?,
            retention: Duration::from_secs(retention_secs),
            archive_interval: Duration::from_secs(60 * 60),
        };

        let config = Self {
            database_url,
            redis_url: get("REDIS_URL"),
            bind_addr: parse_or(
                get("BIND_ADDR"),
                "BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 3000)),
            )?,
            max_db_connections: parse_or(get("DB_MAX_CONNECTIONS"), "DB_MAX_CONNECTIONS", 20)?,
            run_migrations: parse_or(get("RUN_MIGRATIONS"), "RUN_MIGRATIONS", true)?,
            request_timeout: secs("REQUEST_TIMEOUT_SECS", 10)?,
            replay_window: secs("REPLAY_WINDOW_SECS", 300)?,
            guard,
            dispatch,
            supervisor,
            outbox_poll_interval: Duration::from_millis(parse_or(
                get("OUTBOX_POLL_MS"),
                "OUTBOX_POLL_MS",
                500,
            )?),
            secrets: ProviderSecrets {
                stripe: get("STRIPE_WEBHOOK_SECRET"),
                paystack: get("PAYSTACK_SECRET_KEY"),
                flutterwave: get("FLUTTERWAVE_SECRET_HASH"),
                mpesa_public_key: get("MPESA_RELAY_PUBLIC_KEY"),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("PROCESSING_TIMEOUT_SECS", self.guard.processing_timeout),
            ("IDEMPOTENCY_CACHE_TTL_SECS", self.guard.cache_ttl),
            ("CONFLICT_BACKOFF_MS", self.dispatch.conflict_backoff),
            ("SWEEP_INTERVAL_SECS", self.supervisor.sweep_interval),
            ("EVENT_RETENTION_DAYS", self.supervisor.retention),
            ("REQUEST_TIMEOUT_SECS", self.request_timeout),
            ("REPLAY_WINDOW_SECS", self.replay_window),
            ("OUTBOX_POLL_MS", self.outbox_poll_interval),
        ] {
            if value > MAX_DURATION {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("must not exceed {}s", MAX_DURATION.as_secs()),
                });
            }
        }
        if self.guard.max_attempts < 1 {
            return Err(ConfigError::Invalid {
                key: "MAX_ATTEMPTS",
                reason: "must be at least 1".into(),
            });
        }
        if self.guard.processing_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "PROCESSING_TIMEOUT_SECS",
                reason: "must be positive".into(),
            });
        }
        if self.supervisor.batch_size < 1 {
            return Err(ConfigError::Invalid {
                key: "SWEEP_BATCH_SIZE",
                reason: "must be at least 1".into(),
            });
        }
        // Archived rows no longer block duplicates.
        let longest_horizon = Provider::ALL
            .iter()
            .filter_map(|p| p.redelivery_horizon().to_std().ok())
            .max()
            .unwrap_or_default();
        if self.supervisor.retention <= longest_horizon {
            return Err(ConfigError::Invalid {
                key: "EVENT_RETENTION_DAYS",
                reason: format!(
                    "must exceed the longest provider redelivery horizon ({}s)",
                    longest_horizon.as_secs()
                ),
            });
        }
        Ok(())
    }
}

fn parse_or<T>(raw: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap();
        assert_eq!(config.guard.processing_timeout, Duration::from_secs(300));
        assert_eq!(config.guard.max_attempts, 5);
        assert_eq!(config.dispatch.max_conflict_retries, 3);
        assert_eq!(config.supervisor.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.bind_addr.port(), 3000);
        assert!(config.secrets.enabled().is_empty());
    }

    #[test]
    fn database_url_is_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn invalid_numbers_name_the_key() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("MAX_ATTEMPTS", "five"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_ATTEMPTS", .. }));
    }

    #[test]
    fn retention_must_outlive_redelivery() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("EVENT_RETENTION_DAYS", "2"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "EVENT_RETENTION_DAYS", .. }));
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("PROCESSING_TIMEOUT_SECS", "18446744073709551615"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PROCESSING_TIMEOUT_SECS", .. }));

        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("EVENT_RETENTION_DAYS", "300000000000000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "EVENT_RETENTION_DAYS", .. }));

        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("EVENT_RETENTION_DAYS", "100000"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "EVENT_RETENTION_DAYS", .. }));
    }

    #[test]
    fn secrets_enable_providers() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_1"),
            ("MPESA_RELAY_PUBLIC_KEY", "AAAA"),
        ]))
        .unwrap();
        assert_eq!(config.secrets.enabled(), vec![Provider::Stripe, Provider::Mpesa]);
        assert!(!format!("{:?}", config.secrets).contains("whsec_1"));
    }
}
