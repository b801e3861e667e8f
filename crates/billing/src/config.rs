//! Licensing configuration

use std::env;

use crate::error::BillingError;

pub const DEFAULT_LOCK_REASON: &str = "Property detached from subscription";
pub const DEFAULT_RECONCILE_CRON: &str = "0 */30 * * * *";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_RECONCILE_MAX_RETRIES: usize = 3;

/// Runtime settings loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicensingConfig {
    // Database
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Lifecycle
    /// Lock reason recorded when a detach supplies none
    pub default_lock_reason: String,

    // Reconciliation
    pub reconcile_cron: String,
    pub reconcile_max_retries: usize,
}

impl Default for LicensingConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: DEFAULT_MAX_CONNECTIONS,
            default_lock_reason: DEFAULT_LOCK_REASON.to_string(),
            reconcile_cron: DEFAULT_RECONCILE_CRON.to_string(),
            reconcile_max_retries: DEFAULT_RECONCILE_MAX_RETRIES,
        }
    }
}

impl LicensingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_max_connections = match non_blank("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => parse_positive("DATABASE_MAX_CONNECTIONS", &raw)?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let reconcile_max_retries = match non_blank("LICENSE_RECONCILE_MAX_RETRIES") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("LICENSE_RECONCILE_MAX_RETRIES", raw))?,
            None => DEFAULT_RECONCILE_MAX_RETRIES,
        };

        let reconcile_cron =
            non_blank("LICENSE_RECONCILE_CRON").unwrap_or_else(|| DEFAULT_RECONCILE_CRON.to_string());
        // Six-field cron: sec min hour day month weekday
        if reconcile_cron.split_whitespace().count() != 6 {
            return Err(ConfigError::Invalid("LICENSE_RECONCILE_CRON", reconcile_cron));
        }

        Ok(Self {
            database_url: non_blank("DATABASE_URL"),
            database_max_connections,
            default_lock_reason: non_blank("LICENSE_DEFAULT_LOCK_REASON")
                .unwrap_or_else(|| DEFAULT_LOCK_REASON.to_string()),
            reconcile_cron,
            reconcile_max_retries,
        })
    }

    /// The database URL, which only Postgres-backed deployments need
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

fn parse_positive(var: &'static str, raw: &str) -> Result<u32, ConfigError> {
    match raw.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid(var, raw.to_string())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}

impl From<ConfigError> for BillingError {
    fn from(err: ConfigError) -> Self {
        BillingError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = LicensingConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, LicensingConfig::default());
        assert!(matches!(
            config.require_database_url(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    fn test_reads_overrides() {
        let config = LicensingConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/condo"),
            ("DATABASE_MAX_CONNECTIONS", "12"),
            ("LICENSE_DEFAULT_LOCK_REASON", "Contrato encerrado"),
            ("LICENSE_RECONCILE_CRON", "0 0 * * * *"),
            ("LICENSE_RECONCILE_MAX_RETRIES", "5"),
        ]))
        .unwrap();
        assert_eq!(config.require_database_url().unwrap(), "postgres://localhost/condo");
        assert_eq!(config.database_max_connections, 12);
        assert_eq!(config.default_lock_reason, "Contrato encerrado");
        assert_eq!(config.reconcile_cron, "0 0 * * * *");
        assert_eq!(config.reconcile_max_retries, 5);
    }

    #[test]
    fn test_blank_lock_reason_falls_back() {
        let config =
            LicensingConfig::from_lookup(lookup(&[("LICENSE_DEFAULT_LOCK_REASON", "  ")])).unwrap();
        assert_eq!(config.default_lock_reason, DEFAULT_LOCK_REASON);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            LicensingConfig::from_lookup(lookup(&[("DATABASE_MAX_CONNECTIONS", "0")])),
            Err(ConfigError::Invalid("DATABASE_MAX_CONNECTIONS", _))
        ));
        assert!(matches!(
            LicensingConfig::from_lookup(lookup(&[("LICENSE_RECONCILE_MAX_RETRIES", "many")])),
            Err(ConfigError::Invalid("LICENSE_RECONCILE_MAX_RETRIES", _))
        ));
        assert!(matches!(
            LicensingConfig::from_lookup(lookup(&[("LICENSE_RECONCILE_CRON", "*/5 * * * *")])),
            Err(ConfigError::Invalid("LICENSE_RECONCILE_CRON", _))
        ));
    }
}
