//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or a
//! tunable does not parse. Sensitive values wrapped in
//! secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};
use crate::reconcile::ReconcileConfig;
use crate::relay::{RelayConfig, RetryPolicy};
use crate::replica::FieldOwnership;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Database holding the replica collection. Defaults to `database_url`.
    pub replica_database_url: SecretString,
    pub db_max_connections: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,

    /// Replica collection and the fields this service owns in it.
    pub collection: String,
    pub owner: String,
    pub owned_fields: Vec<String>,
    pub ownership_schema_version: u32,

    pub workers: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub attempt_timeout: Duration,
    pub max_retries: u32,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,

    pub reconcile_interval: Duration,
    pub lookback: Duration,
    pub stall_threshold: Duration,
    pub max_stall_requeues: u32,
    pub health_threshold: f64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any name → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup: &lookup };

        let database_url = vars.required("DATABASE_URL")?;
        let replica_database_url = vars
            .optional("REPLICA_DATABASE_URL")
            .unwrap_or_else(|| database_url.clone());

        let owned_fields: Vec<String> = vars
            .optional("LEDGERSYNC_OWNED_FIELDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from)
            .collect();

        let config = Self {
            database_url: SecretString::from(database_url),
            replica_database_url: SecretString::from(replica_database_url),
            db_max_connections: vars.parsed("LEDGERSYNC_DB_MAX_CONNECTIONS", 10)?,
            otel_endpoint: vars.optional("OTEL_ENDPOINT"),
            log_level: vars.optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),

            collection: vars
                .optional("LEDGERSYNC_COLLECTION")
                .unwrap_or_else(|| "documents".to_string()),
            owner: vars
                .optional("LEDGERSYNC_OWNER")
                .unwrap_or_else(|| "ledgersync".to_string()),
            owned_fields,
            ownership_schema_version: vars.parsed("LEDGERSYNC_OWNERSHIP_VERSION", 1)?,

            workers: vars.parsed("LEDGERSYNC_WORKERS", 4)?,
            lease: Duration::from_secs(vars.parsed("LEDGERSYNC_LEASE_SECS", 30)?),
            poll_interval: Duration::from_millis(vars.parsed("LEDGERSYNC_POLL_MS", 500)?),
            attempt_timeout: Duration::from_secs(vars.parsed("LEDGERSYNC_ATTEMPT_TIMEOUT_SECS", 10)?),
            max_retries: vars.parsed("LEDGERSYNC_MAX_RETRIES", 5)?,
            backoff_floor: Duration::from_millis(vars.parsed("LEDGERSYNC_BACKOFF_FLOOR_MS", 1_000)?),
            backoff_cap: Duration::from_millis(vars.parsed("LEDGERSYNC_BACKOFF_CAP_MS", 300_000)?),

            reconcile_interval: Duration::from_secs(
                vars.parsed("LEDGERSYNC_RECONCILE_INTERVAL_SECS", 300)?,
            ),
            lookback: Duration::from_secs(vars.parsed::<u64>("LEDGERSYNC_LOOKBACK_HOURS", 24)? * 3600),
            stall_threshold: Duration::from_secs(vars.parsed("LEDGERSYNC_STALL_SECS", 600)?),
            max_stall_requeues: vars.parsed("LEDGERSYNC_MAX_STALL_REQUEUES", 3)?,
            health_threshold: vars.parsed("LEDGERSYNC_HEALTH_THRESHOLD", 0.95)?,
        };

        config.relay_config().validate()?;
        config.reconcile_config().validate()?;
        Ok(config)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            lease_ttl: self.lease,
            poll_interval: self.poll_interval,
            attempt_timeout: self.attempt_timeout,
            retry: RetryPolicy {
                floor: self.backoff_floor,
                cap: self.backoff_cap,
                max_retries: self.max_retries,
            },
            ..RelayConfig::default()
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            interval: self.reconcile_interval,
            lookback: self.lookback,
            stall_threshold: self.stall_threshold,
            max_stall_requeues: self.max_stall_requeues,
            health_threshold: self.health_threshold,
            replica_timeout: self.attempt_timeout,
        }
    }

    /// Field ownership for the replica collection. An empty field set is a
    /// configuration error: there would be nothing to deliver.
    pub fn ownership(&self) -> Result<FieldOwnership> {
        if self.owned_fields.is_empty() {
            return Err(Error::Config(
                "LEDGERSYNC_OWNED_FIELDS must name at least one field".to_string(),
            ));
        }
        Ok(FieldOwnership::new(
            self.owner.clone(),
            self.ownership_schema_version,
            self.owned_fields.iter().cloned(),
        ))
    }
}

struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.optional(name)
            .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
    }

    fn parsed<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        }
    }
}
