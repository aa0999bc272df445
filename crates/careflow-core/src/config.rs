//! Core runtime configuration.
//!
//! Configuration is resolved once at startup and passed into services. Services
//! never read the process environment themselves.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::DEFAULT_BUSY_TIMEOUT;
use crate::error::{LedgerError, LedgerResult};
use crate::models::keys::is_valid_stage;

pub const ENV_DB_PATH: &str = "CAREFLOW_DB_PATH";
pub const ENV_BUSY_TIMEOUT_MS: &str = "CAREFLOW_BUSY_TIMEOUT_MS";
pub const ENV_DEFAULT_STAGE: &str = "CAREFLOW_DEFAULT_STAGE";
pub const ENV_PAGE_SIZE: &str = "CAREFLOW_PAGE_SIZE";

const DEFAULT_DB_PATH: &str = "careflow.db";
const DEFAULT_FIRST_STAGE: &str = "onboarding";
const DEFAULT_SCHEME: &str = "Unknown";
const DEFAULT_PAGE_SIZE: usize = 200;
/// Largest page a caller may configure; store queries fetch one row past it.
pub const MAX_PAGE_SIZE_LIMIT: usize = 10_000;

/// Core configuration resolved at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct CoreConfig {
    database_path: PathBuf,
    busy_timeout: Duration,
    default_first_stage: String,
    default_scheme: String,
    max_page_size: usize,
    scan_page_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DB_PATH),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            default_first_stage: DEFAULT_FIRST_STAGE.to_string(),
            default_scheme: DEFAULT_SCHEME.to_string(),
            max_page_size: DEFAULT_PAGE_SIZE,
            scan_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    pub fn new(
        database_path: PathBuf,
        busy_timeout: Duration,
        default_first_stage: String,
        max_page_size: usize,
    ) -> LedgerResult<Self> {
        if !is_valid_stage(&default_first_stage) {
            return Err(LedgerError::Validation(format!(
                "invalid default first stage: {:?}",
                default_first_stage
            )));
        }
        if max_page_size == 0 {
            return Err(LedgerError::Validation(
                "max_page_size must be positive".into(),
            ));
        }
        if max_page_size > MAX_PAGE_SIZE_LIMIT {
            return Err(LedgerError::Validation(format!(
                "max_page_size must be at most {}",
                MAX_PAGE_SIZE_LIMIT
            )));
        }

        Ok(Self {
            database_path,
            busy_timeout,
            default_first_stage,
            max_page_size,
            scan_page_size: max_page_size,
            ..Self::default()
        })
    }

    /// Resolve configuration from a key lookup (usually the process environment).
    ///
    /// Unset or blank keys fall back to defaults; malformed values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LedgerResult<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let database_path = get(ENV_DB_PATH)
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let busy_timeout = match get(ENV_BUSY_TIMEOUT_MS) {
            Some(v) => Duration::from_millis(v.parse::<u64>().map_err(|_| {
                LedgerError::Validation(format!("{} must be milliseconds, got {:?}", ENV_BUSY_TIMEOUT_MS, v))
            })?),
            None => defaults.busy_timeout,
        };

        let default_first_stage = get(ENV_DEFAULT_STAGE).unwrap_or(defaults.default_first_stage);

        let max_page_size = match get(ENV_PAGE_SIZE) {
            Some(v) => v.parse::<usize>().map_err(|_| {
                LedgerError::Validation(format!("{} must be a number, got {:?}", ENV_PAGE_SIZE, v))
            })?,
            None => defaults.max_page_size,
        };

        Self::new(database_path, busy_timeout, default_first_stage, max_page_size)
    }

    /// Resolve configuration from the process environment.
    pub fn from_env() -> LedgerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    /// Stage a new patient's first segment opens at.
    pub fn default_first_stage(&self) -> &str {
        &self.default_first_stage
    }

    /// Scheme recorded for history entries that carry none.
    pub fn default_scheme(&self) -> &str {
        &self.default_scheme
    }

    pub fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    /// Page size used for internal reverse scans.
    pub fn scan_page_size(&self) -> usize {
        self.scan_page_size
    }

    /// Clamp a caller-supplied page size into `1..=max_page_size`.
    pub fn clamp_page(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.max_page_size)
            .clamp(1, self.max_page_size)
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
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.default_first_stage(), "onboarding");
        assert_eq!(config.default_scheme(), "Unknown");
        assert_eq!(config.max_page_size(), 200);
        assert_eq!(config.busy_timeout(), DEFAULT_BUSY_TIMEOUT);
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn test_lookup_overrides() {
        let config = CoreConfig::from_lookup(lookup(&[
            (ENV_DB_PATH, "/tmp/ledger.db"),
            (ENV_BUSY_TIMEOUT_MS, "250"),
            (ENV_DEFAULT_STAGE, "triage"),
            (ENV_PAGE_SIZE, " 50 "),
        ]))
        .unwrap();
        assert_eq!(config.database_path(), Path::new("/tmp/ledger.db"));
        assert_eq!(config.busy_timeout(), Duration::from_millis(250));
        assert_eq!(config.default_first_stage(), "triage");
        assert_eq!(config.max_page_size(), 50);
    }

    #[test]
    fn test_rejects_malformed_values() {
        assert!(CoreConfig::from_lookup(lookup(&[(ENV_PAGE_SIZE, "lots")])).is_err());
        assert!(CoreConfig::from_lookup(lookup(&[(ENV_PAGE_SIZE, "0")])).is_err());
        assert!(CoreConfig::from_lookup(lookup(&[(ENV_DEFAULT_STAGE, "a:b")])).is_err());
        assert!(CoreConfig::from_lookup(lookup(&[(ENV_BUSY_TIMEOUT_MS, "-1")])).is_err());
    }

    #[test]
    fn test_rejects_oversized_page() {
        let huge = usize::MAX.to_string();
        let err = CoreConfig::from_lookup(lookup(&[(ENV_PAGE_SIZE, huge.as_str())])).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let limit = MAX_PAGE_SIZE_LIMIT.to_string();
        let config = CoreConfig::from_lookup(lookup(&[(ENV_PAGE_SIZE, limit.as_str())])).unwrap();
        assert_eq!(config.clamp_page(Some(usize::MAX)), MAX_PAGE_SIZE_LIMIT);
    }

    #[test]
    fn test_clamp_page() {
        let config = CoreConfig::default();
        assert_eq!(config.clamp_page(None), 200);
        assert_eq!(config.clamp_page(Some(0)), 1);
        assert_eq!(config.clamp_page(Some(1000)), 200);
        assert_eq!(config.clamp_page(Some(25)), 25);
    }
}
