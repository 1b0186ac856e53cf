use crate::{Error, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Largest TTL a lease may be granted, in seconds.
pub const MAX_LEASE_TTL: i64 = 9_000_000_000;

/// Deployment policy for the lessor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LessorConfig {
    /// Smallest TTL granted, in seconds. Shorter requests are raised to it.
    pub min_ttl: i64,
    /// Largest TTL granted, in seconds. Longer requests are lowered to it.
    pub max_ttl: i64,
    /// Base period of the expiry scan.
    #[serde(with = "millis")]
    pub check_interval: Duration,
    /// Upper bound of the random delay added to each scan period.
    #[serde(with = "millis")]
    pub check_jitter: Duration,
    /// Capacity of the queue between the expiry scan and the revoke worker.
    pub revoke_queue: usize,
    /// Buffered responses per streaming keep-alive session.
    pub keepalive_buffer: usize,
}

impl Default for LessorConfig {
    fn default() -> Self {
        Self {
            min_ttl: 5,
            max_ttl: MAX_LEASE_TTL,
            check_interval: Duration::from_millis(500),
            check_jitter: Duration::from_millis(100),
            revoke_queue: 1024,
            keepalive_buffer: 16,
        }
    }
}

impl LessorConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid lessor config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `LESSOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_var("LESSOR_MIN_TTL")? {
            config.min_ttl = v;
        }
        if let Some(v) = env_var("LESSOR_MAX_TTL")? {
            config.max_ttl = v;
        }
        if let Some(v) = env_var("LESSOR_CHECK_INTERVAL_MS")? {
            config.check_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_var("LESSOR_CHECK_JITTER_MS")? {
            config.check_jitter = Duration::from_millis(v);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_ttl <= 0 {
            return Err(Error::Config(format!(
                "min_ttl must be positive, got {}",
                self.min_ttl
            )));
        }
        if self.max_ttl < self.min_ttl || self.max_ttl > MAX_LEASE_TTL {
            return Err(Error::Config(format!(
                "max_ttl {} outside [{}, {}]",
                self.max_ttl, self.min_ttl, MAX_LEASE_TTL
            )));
        }
        if self.check_interval.is_zero() {
            return Err(Error::Config("check_interval must be non-zero".to_string()));
        }
        // An expired lease must be noticed before a minimal lease could expire again.
        let worst_case = self.check_interval + self.check_jitter;
        if worst_case >= Duration::from_secs(self.min_ttl as u64) {
            return Err(Error::Config(format!(
                "check_interval + check_jitter ({worst_case:?}) must be below min_ttl ({}s)",
                self.min_ttl
            )));
        }
        if self.revoke_queue == 0 || self.keepalive_buffer == 0 {
            return Err(Error::Config("queue capacities must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Clamps a validated request into `[min_ttl, max_ttl]`.
    pub fn clamp_ttl(&self, requested: i64) -> Result<i64> {
        if requested <= 0 {
            return Err(Error::InvalidTtl { ttl: requested });
        }
        Ok(requested.clamp(self.min_ttl, self.max_ttl))
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}"))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Config(format!("{name}: {e}"))),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
