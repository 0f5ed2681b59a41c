//! Environment configuration
//!
//! Read once at startup, after `dotenv`.

use crate::calendar::MAX_WINDOW_DAYS;
use crate::error::OrchestrationError;
use crate::memory::DEFAULT_MEMORY_CAPACITY;
use crate::publication::DEFAULT_DELIVERY_ACTION;
use crate::verification::DEFAULT_ALERT_WINDOW_DAYS;
use crate::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub jurisdiction: String,
    pub memory_capacity: usize,
    pub memory_path: Option<PathBuf>,
    pub webhook_url: Option<String>,
    pub delivery_action: String,
    pub calendar_seed_path: Option<PathBuf>,
    pub tax_rules_path: Option<PathBuf>,
    pub collector_url: Option<String>,
    pub collector_max_attempts: u32,
    pub collector_backoff: Duration,
    pub alert_window_days: u32,
    pub api_port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            jurisdiction: "QC".to_string(),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            memory_path: None,
            webhook_url: None,
            delivery_action: DEFAULT_DELIVERY_ACTION.to_string(),
            calendar_seed_path: None,
            tax_rules_path: None,
            collector_url: None,
            collector_max_attempts: 3,
            collector_backoff: Duration::from_millis(250),
            alert_window_days: DEFAULT_ALERT_WINDOW_DAYS,
            api_port: 8080,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let alert_window_days =
            parse(&get, "COMPLIANCE_WINDOW_DAYS")?.unwrap_or(defaults.alert_window_days);
        if alert_window_days > MAX_WINDOW_DAYS {
            return Err(OrchestrationError::ConfigurationError(format!(
                "COMPLIANCE_WINDOW_DAYS={} exceeds {}",
                alert_window_days, MAX_WINDOW_DAYS
            )));
        }

        Ok(Self {
            jurisdiction: get("TAX_JURISDICTION")
                .map(|v| v.to_uppercase())
                .unwrap_or(defaults.jurisdiction),
            memory_capacity: parse(&get, "MEMORY_CAPACITY")?.unwrap_or(defaults.memory_capacity),
            memory_path: get("MEMORY_PATH").map(PathBuf::from),
            webhook_url: get("MAKE_WEBHOOK_URL"),
            delivery_action: get("DELIVERY_ACTION").unwrap_or(defaults.delivery_action),
            calendar_seed_path: get("CALENDAR_SEED_PATH").map(PathBuf::from),
            tax_rules_path: get("TAX_RULES_PATH").map(PathBuf::from),
            collector_url: get("COLLECTOR_URL"),
            collector_max_attempts: parse(&get, "COLLECTOR_MAX_ATTEMPTS")?
                .unwrap_or(defaults.collector_max_attempts),
            collector_backoff: parse::<u64, _>(&get, "COLLECTOR_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.collector_backoff),
            alert_window_days,
            api_port: match parse(&get, "PORT")? {
                Some(port) => port,
                None => parse(&get, "API_PORT")?.unwrap_or(defaults.api_port),
            },
        })
    }
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| {
                OrchestrationError::ConfigurationError(format!("{}='{}' is invalid: {}", key, raw, e))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.jurisdiction, "QC");
        assert_eq!(config.api_port, 8080);
    }

    #[test]
    fn test_values_are_read() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("TAX_JURISDICTION", "ca"),
            ("MEMORY_CAPACITY", "25"),
            ("MAKE_WEBHOOK_URL", "https://hook.example.com/x"),
            ("COLLECTOR_BACKOFF_MS", "10"),
            ("TAX_RULES_PATH", "/etc/fiscal/tax_rules.json"),
            ("API_PORT", "9000"),
            ("DELIVERY_ACTION", "  "),
        ]))
        .unwrap();

        assert_eq!(config.jurisdiction, "CA");
        assert_eq!(config.memory_capacity, 25);
        assert_eq!(config.webhook_url.as_deref(), Some("https://hook.example.com/x"));
        assert_eq!(config.collector_backoff, Duration::from_millis(10));
        assert_eq!(config.tax_rules_path, Some(PathBuf::from("/etc/fiscal/tax_rules.json")));
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.delivery_action, DEFAULT_DELIVERY_ACTION);
    }

    #[test]
    fn test_port_wins_over_api_port() {
        let config =
            OrchestratorConfig::from_lookup(lookup(&[("PORT", "3000"), ("API_PORT", "9000")])).unwrap();
        assert_eq!(config.api_port, 3000);
    }

    #[test]
    fn test_unparsable_value_is_configuration_error() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("MEMORY_CAPACITY", "lots")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("MEMORY_CAPACITY"));
    }

    #[test]
    fn test_window_beyond_maximum_is_configuration_error() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("COMPLIANCE_WINDOW_DAYS", "4294967295")]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
