//! Configuration for the host agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kiln_reconcile::{
    DEFAULT_DELETE_TIMEOUT, DEFAULT_MAXIMUM_RETRY, DEFAULT_RESYNC_PERIOD, DEFAULT_RETRY_INTERVAL,
};

/// Values the controller is constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Interval between full resyncs.
    pub resync_period: Duration,

    /// Retries after the first failed attempt before a VM is marked failed.
    pub maximum_retry: u32,

    /// Delay before a failed VM is reconciled again.
    pub retry_interval: Duration,

    /// Budget for tearing a VM down, from the first delete attempt.
    pub delete_vm_timeout: Duration,

    /// Serve the API only; never touch the host.
    pub disable_reconcile: bool,

    /// Concurrent passes across distinct VMs.
    pub workers: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            resync_period: DEFAULT_RESYNC_PERIOD,
            maximum_retry: DEFAULT_MAXIMUM_RETRY,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            delete_vm_timeout: DEFAULT_DELETE_TIMEOUT,
            disable_reconcile: false,
            workers: 4,
        }
    }
}

/// Which network adapter the binary wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkBackend {
    Mock,
    Tap,
}

impl FromStr for NetworkBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mock" => Ok(Self::Mock),
            "tap" => Ok(Self::Tap),
            other => bail!("unknown network backend '{other}' (expected mock or tap)"),
        }
    }
}

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Root for per-VM files.
    pub data_dir: PathBuf,

    /// SQLite database holding specs and statuses.
    pub state_db: PathBuf,

    pub reconcile: ReconcileConfig,

    /// Provider used when a spec names none.
    pub default_provider: String,

    /// Bridge TAP devices are attached to.
    pub bridge_name: Option<String>,

    pub network_backend: NetworkBackend,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ReconcileConfig::default();

        let log_level = lookup("KILN_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let data_dir = PathBuf::from(
            lookup("KILN_DATA_DIR").unwrap_or_else(|| "/var/lib/kiln".to_string()),
        );
        let state_db = lookup("KILN_STATE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("state.db"));

        let reconcile = ReconcileConfig {
            resync_period: secs(&lookup, "KILN_RESYNC_PERIOD_SECS", defaults.resync_period)?,
            maximum_retry: parsed(&lookup, "KILN_MAXIMUM_RETRY", defaults.maximum_retry)?,
            retry_interval: secs(&lookup, "KILN_RETRY_INTERVAL_SECS", defaults.retry_interval)?,
            delete_vm_timeout: secs(
                &lookup,
                "KILN_DELETE_VM_TIMEOUT_SECS",
                defaults.delete_vm_timeout,
            )?,
            disable_reconcile: parsed(&lookup, "KILN_DISABLE_RECONCILE", false)?,
            workers: parsed(&lookup, "KILN_RECONCILE_WORKERS", defaults.workers)?,
        };
        if reconcile.workers == 0 {
            bail!("KILN_RECONCILE_WORKERS must be at least 1");
        }
        if reconcile.resync_period.is_zero() {
            bail!("KILN_RESYNC_PERIOD_SECS must be at least 1");
        }

        let default_provider =
            lookup("KILN_DEFAULT_PROVIDER").unwrap_or_else(|| "mock".to_string());

        let bridge_name = lookup("KILN_BRIDGE_NAME").filter(|s| !s.is_empty());

        let network_backend = parsed(&lookup, "KILN_NETWORK_BACKEND", NetworkBackend::Mock)?;

        Ok(Self {
            log_level,
            data_dir,
            state_db,
            reconcile,
            default_provider,
            bridge_name,
            network_backend,
        })
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    parsed(lookup, key, default.as_secs()).map(Duration::from_secs)
}
