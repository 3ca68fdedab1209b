//! Trigger tuning options and host-style settings parsing.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use trigger_core::ConfigurationError;

pub const MAX_BATCH_SIZE_SETTING: &str = "Sql_Trigger_MaxBatchSize";
/// Deprecated alias of [`MAX_BATCH_SIZE_SETTING`].
pub const BATCH_SIZE_SETTING: &str = "Sql_Trigger_BatchSize";
pub const POLLING_INTERVAL_SETTING: &str = "Sql_Trigger_PollingIntervalMs";
pub const MAX_CHANGES_PER_WORKER_SETTING: &str = "Sql_Trigger_MaxChangesPerWorker";

pub const DEFAULT_MAX_BATCH_SIZE: u32 = 100;
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_CHANGES_PER_WORKER: u32 = 1000;
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_APP_LOCK_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_ATTEMPT_COUNT: u32 = 5;
pub const DEFAULT_MAX_LEASE_RENEWAL_COUNT: u32 = 5;
pub const DEFAULT_TABLE_INFO_CACHE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerOptions {
    /// Upper bound on changes leased per tick and per delivery.
    pub max_batch_size: u32,
    pub polling_interval: Duration,
    /// Backlog one worker is expected to absorb; drives scale decisions.
    pub max_changes_per_worker: u32,
    pub lease_duration: Duration,
    pub app_lock_timeout: Duration,
    /// Changes that failed this many times are no longer leased.
    pub max_attempt_count: u32,
    /// Renewals granted to one dispatch before its executor is cancelled.
    pub max_lease_renewal_count: u32,
    pub table_info_cache_timeout: Duration,
    /// Overrides the derived `Leases_{function}_{table}` name.
    pub leases_table_name: Option<String>,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            max_changes_per_worker: DEFAULT_MAX_CHANGES_PER_WORKER,
            lease_duration: DEFAULT_LEASE_DURATION,
            app_lock_timeout: DEFAULT_APP_LOCK_TIMEOUT,
            max_attempt_count: DEFAULT_MAX_ATTEMPT_COUNT,
            max_lease_renewal_count: DEFAULT_MAX_LEASE_RENEWAL_COUNT,
            table_info_cache_timeout: DEFAULT_TABLE_INFO_CACHE_TIMEOUT,
            leases_table_name: None,
        }
    }
}

impl TriggerOptions {
    /// Read options from host settings, falling back to defaults for absent keys.
    pub fn from_settings<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        let batch_size = match lookup(MAX_BATCH_SIZE_SETTING) {
            Some(value) => Some((MAX_BATCH_SIZE_SETTING, value)),
            None => lookup(BATCH_SIZE_SETTING).map(|value| {
                tracing::warn!(
                    "Setting '{BATCH_SIZE_SETTING}' is deprecated, use '{MAX_BATCH_SIZE_SETTING}'"
                );
                (BATCH_SIZE_SETTING, value)
            }),
        };
        if let Some((key, value)) = batch_size {
            options.max_batch_size = parse_positive_i32(key, &value)?;
        }
        if let Some(value) = lookup(POLLING_INTERVAL_SETTING) {
            let ms = parse_positive_i32(POLLING_INTERVAL_SETTING, &value)?;
            options.polling_interval = Duration::from_millis(u64::from(ms));
        }
        if let Some(value) = lookup(MAX_CHANGES_PER_WORKER_SETTING) {
            options.max_changes_per_worker =
                parse_positive_i32(MAX_CHANGES_PER_WORKER_SETTING, &value)?;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        check_count("max_batch_size", self.max_batch_size)?;
        check_count("max_changes_per_worker", self.max_changes_per_worker)?;
        check_count("max_attempt_count", self.max_attempt_count)?;
        check_count("max_lease_renewal_count", self.max_lease_renewal_count)?;
        check_duration("polling_interval", self.polling_interval)?;
        check_duration("lease_duration", self.lease_duration)?;
        check_duration("app_lock_timeout", self.app_lock_timeout)?;
        check_duration("table_info_cache_timeout", self.table_info_cache_timeout)?;
        if let Some(name) = &self.leases_table_name {
            if name.trim().is_empty() {
                return Err(invalid("leases_table_name", name, "must not be empty"));
            }
        }
        Ok(())
    }

    /// Interval at which an in-flight dispatch renews its leases.
    pub fn lease_renewal_interval(&self) -> Duration {
        self.lease_duration / 2
    }
}

fn invalid(key: &str, value: impl ToString, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a setting that must be a positive 32-bit integer.
pub fn parse_positive_i32(key: &str, value: &str) -> Result<u32, ConfigurationError> {
    let parsed: i32 = value
        .trim()
        .parse()
        .map_err(|_| invalid(key, value, "expected a 32-bit integer"))?;
    if parsed <= 0 {
        return Err(invalid(key, value, "must be greater than zero"));
    }
    Ok(parsed.unsigned_abs())
}

fn check_count(key: &str, value: u32) -> Result<(), ConfigurationError> {
    if value == 0 || value > i32::MAX.unsigned_abs() {
        return Err(invalid(key, value, "must be a positive 32-bit integer"));
    }
    Ok(())
}

fn check_duration(key: &str, value: Duration) -> Result<(), ConfigurationError> {
    if value.is_zero() {
        return Err(invalid(key, format!("{value:?}"), "must be greater than zero"));
    }
    if value.as_millis() > u128::from(i32::MAX.unsigned_abs()) {
        return Err(invalid(key, format!("{value:?}"), "exceeds the 32-bit millisecond range"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let options = TriggerOptions::from_settings(|_| None).unwrap();
        assert_eq!(options, TriggerOptions::default());
        assert_eq!(options.max_batch_size, 100);
        assert_eq!(options.polling_interval, Duration::from_millis(1000));
        assert_eq!(options.max_changes_per_worker, 1000);
        assert_eq!(options.lease_renewal_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_settings_override_defaults() {
        let map = settings(&[
            (MAX_BATCH_SIZE_SETTING, "250"),
            (POLLING_INTERVAL_SETTING, "500"),
            (MAX_CHANGES_PER_WORKER_SETTING, "20"),
        ]);
        let options = TriggerOptions::from_settings(|k| map.get(k).cloned()).unwrap();
        assert_eq!(options.max_batch_size, 250);
        assert_eq!(options.polling_interval, Duration::from_millis(500));
        assert_eq!(options.max_changes_per_worker, 20);
    }

    #[test]
    fn test_deprecated_batch_size_alias() {
        let map = settings(&[(BATCH_SIZE_SETTING, "42")]);
        let options = TriggerOptions::from_settings(|k| map.get(k).cloned()).unwrap();
        assert_eq!(options.max_batch_size, 42);

        let map = settings(&[(BATCH_SIZE_SETTING, "42"), (MAX_BATCH_SIZE_SETTING, "7")]);
        let options = TriggerOptions::from_settings(|k| map.get(k).cloned()).unwrap();
        assert_eq!(options.max_batch_size, 7);
    }

    #[test]
    fn test_invalid_numeric_settings() {
        for bad in ["0", "-5", "abc", "3000000000", ""] {
            let map = settings(&[(POLLING_INTERVAL_SETTING, bad)]);
            let err = TriggerOptions::from_settings(|k| map.get(k).cloned()).unwrap_err();
            assert!(
                matches!(err, ConfigurationError::InvalidSetting { ref key, .. } if key == POLLING_INTERVAL_SETTING),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let options = TriggerOptions {
            lease_duration: Duration::ZERO,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = TriggerOptions {
            leases_table_name: Some("  ".into()),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
