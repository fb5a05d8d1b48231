//! Connection settings read from the environment.
//!
//! ## Variables
//! - `KEYSTONE_URL`, `ORION_URL`: identity service and broker base URLs
//! - `ORION_SERVICE`, `ORION_SUBSERVICE`: tenant routing
//! - `ORION_USERNAME`, `ORION_PASSWORD`: identity credentials
//! - `ORION_RATE_CALLS` + `ORION_RATE_PERIOD_SECS`: optional client-side rate
//!   limit, both or neither
//! - `ORION_TIMEOUT_SECS`: optional per-request timeout

use std::fmt;
use std::time::Duration;

use crate::error::{OrionError, Result};

/// At most `calls` requests per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub calls: u32,
    pub period: Duration,
}

/// Everything needed to reach and authenticate against a broker.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub keystone_url: String,
    pub orion_url: String,
    pub service: String,
    pub subservice: String,
    pub username: String,
    pub password: String,
    pub rate_limit: Option<RateLimit>,
    pub timeout: Option<Duration>,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| OrionError::Config(format!("{key} is not set")))
        };

        let rate_calls = parse_optional::<u32>(&lookup, "ORION_RATE_CALLS")?;
        let rate_period = parse_optional::<u64>(&lookup, "ORION_RATE_PERIOD_SECS")?;
        let rate_limit = match (rate_calls, rate_period) {
            (Some(calls), Some(secs)) => Some(RateLimit {
                calls,
                period: Duration::from_secs(secs),
            }),
            (None, None) => None,
            _ => {
                return Err(OrionError::Config(
                    "ORION_RATE_CALLS and ORION_RATE_PERIOD_SECS must be set together".to_string(),
                ))
            }
        };
        let timeout =
            parse_optional::<u64>(&lookup, "ORION_TIMEOUT_SECS")?.map(Duration::from_secs);

        Ok(Self {
            keystone_url: required("KEYSTONE_URL")?.trim_end_matches('/').to_string(),
            orion_url: required("ORION_URL")?.trim_end_matches('/').to_string(),
            service: required("ORION_SERVICE")?,
            subservice: required("ORION_SUBSERVICE")?,
            username: required("ORION_USERNAME")?,
            password: required("ORION_PASSWORD")?,
            rate_limit,
            timeout,
        })
    }
}

fn parse_optional<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| OrionError::Config(format!("{key} has invalid value {raw:?}"))),
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("keystone_url", &self.keystone_url)
            .field("orion_url", &self.orion_url)
            .field("service", &self.service)
            .field("subservice", &self.subservice)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("rate_limit", &self.rate_limit)
            .field("timeout", &self.timeout)
            .finish()
    }
}
