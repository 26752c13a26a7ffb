//! Monitor settings, normally taken from `SOLCON_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use log::info;
use once_cell::sync::Lazy;

use crate::error::{MonitorError, Result};

pub const PERIOD_ENV: &str = "SOLCON_MONITOR_PERIOD_MS";
pub const EDT_FIELDS_ENV: &str = "SOLCON_EDT_FIELDS";
pub const SHARED_FIELDS_ENV: &str = "SOLCON_SHARED_FIELDS";
pub const LOCKSET_FIELDS_ENV: &str = "SOLCON_LOCKSET_FIELDS";
pub const TRACKED_FIELDS_ENV: &str = "SOLCON_TRACKED_FIELDS";
pub const FIELDS_FILE_ENV: &str = "SOLCON_FIELDS_FILE";
pub const GC_POLL_ENV: &str = "SOLCON_GC_POLL_MS";

const DEFAULT_PERIOD_MS: u64 = 1000;
const DEFAULT_GC_POLL_MS: u64 = 250;
const MIN_MS: u64 = 1;

static DEFAULT: Lazy<MonitorConfig> = Lazy::new(|| MonitorConfig {
    period: Duration::from_millis(DEFAULT_PERIOD_MS),
    edt_fields: String::new(),
    shared_fields: String::new(),
    lock_set_fields: String::new(),
    tracked_fields: String::new(),
    fields_file: None,
    gc_poll: Duration::from_millis(DEFAULT_GC_POLL_MS),
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between analysis ticks.
    pub period: Duration,
    pub edt_fields: String,
    pub shared_fields: String,
    pub lock_set_fields: String,
    /// Fields whose accesses are recorded at all. Empty tracks nothing.
    pub tracked_fields: String,
    pub fields_file: Option<PathBuf>,
    /// How often the GC thread looks for collected objects.
    pub gc_poll: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        DEFAULT.clone()
    }
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        info!("monitor config: {config:?}");
        Ok(config)
    }

    /// Reads options through `lookup`; a missing or empty value keeps the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();
        if let Some(v) = get(PERIOD_ENV) {
            config.period = parse_millis(PERIOD_ENV, &v)?;
        }
        if let Some(v) = get(GC_POLL_ENV) {
            config.gc_poll = parse_millis(GC_POLL_ENV, &v)?;
        }
        if let Some(v) = lookup(EDT_FIELDS_ENV) {
            config.edt_fields = v;
        }
        if let Some(v) = lookup(SHARED_FIELDS_ENV) {
            config.shared_fields = v;
        }
        if let Some(v) = lookup(LOCKSET_FIELDS_ENV) {
            config.lock_set_fields = v;
        }
        if let Some(v) = lookup(TRACKED_FIELDS_ENV) {
            config.tracked_fields = v;
        }
        config.fields_file = get(FIELDS_FILE_ENV).map(PathBuf::from);
        Ok(config)
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(Duration::from_millis(MIN_MS));
        self
    }

    pub fn with_gc_poll(mut self, poll: Duration) -> Self {
        self.gc_poll = poll.max(Duration::from_millis(MIN_MS));
        self
    }

    pub fn with_alerts(mut self, edt: &str, shared: &str, lock_set: &str) -> Self {
        self.edt_fields = edt.to_owned();
        self.shared_fields = shared.to_owned();
        self.lock_set_fields = lock_set.to_owned();
        self
    }

    pub fn with_tracked_fields(mut self, pattern: &str) -> Self {
        self.tracked_fields = pattern.to_owned();
        self
    }

    pub fn with_fields_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.fields_file = Some(path.into());
        self
    }
}

fn parse_millis(key: &'static str, value: &str) -> Result<Duration> {
    let ms: u64 = value.trim().parse().map_err(|_| MonitorError::InvalidConfig {
        key,
        value: value.to_owned(),
    })?;
    Ok(Duration::from_millis(ms.max(MIN_MS)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = MonitorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, MonitorConfig::default());
        assert_eq!(config.period, Duration::from_millis(1000));
        assert!(config.tracked_fields.is_empty());
        assert!(config.fields_file.is_none());
    }

    #[test]
    fn reads_every_option() {
        let config = MonitorConfig::from_lookup(lookup(&[
            (PERIOD_ENV, "50"),
            (GC_POLL_ENV, "10"),
            (EDT_FIELDS_ENV, "ui\\..*"),
            (SHARED_FIELDS_ENV, "a\\.B\\.c"),
            (LOCKSET_FIELDS_ENV, ".*"),
            (TRACKED_FIELDS_ENV, ".*"),
            (FIELDS_FILE_ENV, "/tmp/fields.txt"),
        ]))
        .unwrap();
        assert_eq!(config.period, Duration::from_millis(50));
        assert_eq!(config.gc_poll, Duration::from_millis(10));
        assert_eq!(config.edt_fields, "ui\\..*");
        assert_eq!(config.lock_set_fields, ".*");
        assert_eq!(config.fields_file, Some(PathBuf::from("/tmp/fields.txt")));
    }

    #[test]
    fn period_is_clamped_to_minimum() {
        let config = MonitorConfig::from_lookup(lookup(&[(PERIOD_ENV, "0")])).unwrap();
        assert_eq!(config.period, Duration::from_millis(1));
        let config = MonitorConfig::default().with_period(Duration::ZERO);
        assert_eq!(config.period, Duration::from_millis(1));
    }

    #[test]
    fn bad_number_is_rejected() {
        let err = MonitorConfig::from_lookup(lookup(&[(PERIOD_ENV, "soon")])).unwrap_err();
        assert!(matches!(err, MonitorError::InvalidConfig { key: PERIOD_ENV, .. }));
    }
}
