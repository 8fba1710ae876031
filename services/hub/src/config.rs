use anyhow::{Context, Result};
use herald_common::{DEFAULT_EVENT_CAPACITY, DEFAULT_QUERY_LIMIT, HubConfig};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

// Hub service configuration sourced from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    // Capacity of the hub's failure-event broadcast channel.
    pub event_capacity: usize,
    // Messages returned by a query that sets no limit.
    pub default_query_limit: usize,
    // JSON array of `[channel, payload]` entries replayed at startup.
    pub seed_path: Option<PathBuf>,
    // Channel that receives one message per stdin line; stdin is ignored when unset.
    pub stdin_channel: Option<String>,
    // Route whose deliveries are logged at info level.
    pub log_route: Option<String>,
    // Channel that receives subscriber failure reports.
    pub error_channel: Option<String>,
    // Route and size of the history dump printed on shutdown.
    pub dump_route: String,
    pub dump_limit: usize,
}

const DEFAULT_DUMP_ROUTE: &str = "*";
const DEFAULT_DUMP_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
struct ServiceConfigOverride {
    event_capacity: Option<usize>,
    default_query_limit: Option<usize>,
    seed_path: Option<PathBuf>,
    stdin_channel: Option<String>,
    log_route: Option<String>,
    error_channel: Option<String>,
    dump_route: Option<String>,
    dump_limit: Option<usize>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            default_query_limit: DEFAULT_QUERY_LIMIT,
            seed_path: None,
            stdin_channel: None,
            log_route: None,
            error_channel: None,
            dump_route: DEFAULT_DUMP_ROUTE.to_string(),
            dump_limit: DEFAULT_DUMP_LIMIT,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let event_capacity = match lookup("HERALD_EVENT_CAPACITY") {
            Some(value) => value
                .parse::<usize>()
                .with_context(|| "parse HERALD_EVENT_CAPACITY")?,
            None => defaults.event_capacity,
        };
        let default_query_limit = lookup("HERALD_QUERY_LIMIT")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(defaults.default_query_limit);
        let seed_path = lookup("HERALD_SEED").map(PathBuf::from);
        let stdin_channel = lookup("HERALD_STDIN_CHANNEL").filter(|value| !value.is_empty());
        let log_route = lookup("HERALD_LOG_ROUTE").filter(|value| !value.is_empty());
        let error_channel = lookup("HERALD_ERROR_CHANNEL").filter(|value| !value.is_empty());
        let dump_route = lookup("HERALD_DUMP_ROUTE")
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.dump_route);
        let dump_limit = lookup("HERALD_DUMP_LIMIT")
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(defaults.dump_limit);
        Ok(Self {
            event_capacity,
            default_query_limit,
            seed_path,
            stdin_channel,
            log_route,
            error_channel,
            dump_route,
            dump_limit,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("HERALD_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read HERALD_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    /// Overlay fields present in a YAML document.
    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: ServiceConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse hub config yaml")?;
        if let Some(value) = override_cfg.event_capacity {
            self.event_capacity = value;
        }
        if let Some(value) = override_cfg.default_query_limit {
            self.default_query_limit = value;
        }
        if let Some(value) = override_cfg.seed_path {
            self.seed_path = Some(value);
        }
        if let Some(value) = override_cfg.stdin_channel {
            self.stdin_channel = Some(value);
        }
        if let Some(value) = override_cfg.log_route {
            self.log_route = Some(value);
        }
        if let Some(value) = override_cfg.error_channel {
            self.error_channel = Some(value);
        }
        if let Some(value) = override_cfg.dump_route
            && !value.is_empty()
        {
            self.dump_route = value;
        }
        if let Some(value) = override_cfg.dump_limit {
            self.dump_limit = value;
        }
        Ok(())
    }

    pub fn hub_config(&self) -> Result<HubConfig> {
        let config = HubConfig {
            event_capacity: self.event_capacity,
            default_query_limit: self.default_query_limit,
        };
        config.validate().with_context(|| "validate hub config")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = ServiceConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.dump_route, "*");
        let hub = config.hub_config().expect("hub config");
        assert_eq!(hub.default_query_limit, 1);
    }

    #[test]
    fn env_values_are_read() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("HERALD_EVENT_CAPACITY", "8"),
            ("HERALD_QUERY_LIMIT", "5"),
            ("HERALD_SEED", "/tmp/seed.json"),
            ("HERALD_STDIN_CHANNEL", "input"),
            ("HERALD_LOG_ROUTE", "orders.*"),
            ("HERALD_DUMP_LIMIT", "3"),
        ]))
        .expect("config");
        assert_eq!(config.event_capacity, 8);
        assert_eq!(config.default_query_limit, 5);
        assert_eq!(config.seed_path, Some(PathBuf::from("/tmp/seed.json")));
        assert_eq!(config.stdin_channel.as_deref(), Some("input"));
        assert_eq!(config.log_route.as_deref(), Some("orders.*"));
        assert_eq!(config.dump_limit, 3);
    }

    #[test]
    fn bad_capacity_is_an_error() {
        let err = ServiceConfig::from_lookup(lookup(&[("HERALD_EVENT_CAPACITY", "lots")]))
            .expect_err("invalid");
        assert!(err.to_string().contains("HERALD_EVENT_CAPACITY"));
    }

    #[test]
    fn zero_capacity_fails_validation() {
        let config = ServiceConfig::from_lookup(lookup(&[("HERALD_EVENT_CAPACITY", "0")]))
            .expect("config");
        assert!(config.hub_config().is_err());
    }

    #[test]
    fn yaml_overrides_env() {
        let mut config =
            ServiceConfig::from_lookup(lookup(&[("HERALD_DUMP_LIMIT", "3")])).expect("config");
        config
            .apply_yaml("dump_limit: 10\nerror_channel: herald.errors\ndump_route: ''\n")
            .expect("yaml");
        assert_eq!(config.dump_limit, 10);
        assert_eq!(config.error_channel.as_deref(), Some("herald.errors"));
        assert_eq!(config.dump_route, "*");
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let mut config = ServiceConfig::default();
        assert!(config.apply_yaml("dump_limit: [").is_err());
    }
}
