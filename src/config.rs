use std::{env, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::error::ConfigError;


pub const SAMPLE_INTERVAL_ENV: &str = "DOCTOR_SAMPLE_INTERVAL";
pub const DATA_PATH_ENV: &str = "DOCTOR_DATA_PATH";
pub const ENTRY_SOURCE_ENV: &str = "DOCTOR_ENTRY_SOURCE";
pub const DEFER_INTERRUPT_ENV: &str = "DOCTOR_DEFER_INTERRUPT";

pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 10;


#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub sample_interval_ms: u64,
    pub data_path: PathBuf,
    pub entry_source: Option<PathBuf>,
    /// Host already orchestrates SIGINT, the probe must not react to it.
    pub defer_interrupt: bool,
}

impl Default for Config {
    fn default() -> Self {
        get_default_config()
    }
}

impl Config {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = get_default_config();

        if let Some(raw) = lookup(SAMPLE_INTERVAL_ENV) {
            config.sample_interval_ms = parse_sample_interval(&raw)?;
        }

        if let Some(path) = lookup(DATA_PATH_ENV).filter(|p| !p.is_empty()) {
            config.data_path = PathBuf::from(path);
        }

        config.entry_source = lookup(ENTRY_SOURCE_ENV)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        config.defer_interrupt = lookup(DEFER_INTERRUPT_ENV)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(config)
    }
}

/// Sample spacing is a contract for downstream analysis, so anything other
/// than a positive integer is rejected instead of replaced by the default.
pub fn parse_sample_interval(raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(ConfigError::InvalidSampleInterval(raw.to_string())),
    }
}


pub fn get_default_config() -> Config {
    Config {
        sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
        data_path: PathBuf::from("."),
        entry_source: None,
        defer_interrupt: false,
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, get_default_config());
        assert_eq!(config.sample_interval(), Duration::from_millis(10));
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            (SAMPLE_INTERVAL_ENV, "1"),
            (DATA_PATH_ENV, "/tmp/doctor"),
            (ENTRY_SOURCE_ENV, "main.js"),
            (DEFER_INTERRUPT_ENV, "true"),
        ]))
        .unwrap();

        assert_eq!(config.sample_interval_ms, 1);
        assert_eq!(config.data_path, PathBuf::from("/tmp/doctor"));
        assert_eq!(config.entry_source, Some(PathBuf::from("main.js")));
        assert!(config.defer_interrupt);
    }

    #[test]
    fn invalid_interval_is_fatal() {
        for raw in ["", "0", "-5", "ten", "1.5"] {
            let err = Config::from_lookup(lookup_from(&[(SAMPLE_INTERVAL_ENV, raw)])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidSampleInterval(ref r) if r == raw), "{raw:?}");
        }
    }

    #[test]
    fn interval_tolerates_whitespace() {
        assert_eq!(parse_sample_interval(" 25\n").unwrap(), 25);
    }
}
