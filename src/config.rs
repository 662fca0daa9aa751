use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineOptions;

/// Server settings, read once from `FREESLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    pub chained_merge: bool,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            port: parse_var(&lookup, "FREESLOT_PORT").unwrap_or(5433),
            bind: lookup("FREESLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("FREESLOT_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("FREESLOT_PASSWORD").unwrap_or_else(|| "freeslot".into()),
            max_connections: parse_var(&lookup, "FREESLOT_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parse_var(&lookup, "FREESLOT_COMPACT_THRESHOLD").unwrap_or(1000),
            lock_timeout: Duration::from_millis(parse_var(&lookup, "FREESLOT_LOCK_TIMEOUT_MS").unwrap_or(5000)),
            chained_merge: lookup("FREESLOT_CHAINED_MERGE").is_some_and(|v| is_truthy(&v)),
            metrics_port: parse_var(&lookup, "FREESLOT_METRICS_PORT"),
            tls_cert: lookup("FREESLOT_TLS_CERT"),
            tls_key: lookup("FREESLOT_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            chained_merge: self.chained_merge,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.password, "freeslot");
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.lock_timeout, Duration::from_millis(5000));
        assert!(!config.chained_merge);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.tls_cert, None);
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("FREESLOT_PORT", "6000"),
            ("FREESLOT_BIND", "127.0.0.1"),
            ("FREESLOT_LOCK_TIMEOUT_MS", "250"),
            ("FREESLOT_CHAINED_MERGE", "true"),
            ("FREESLOT_METRICS_PORT", "9100"),
        ]);
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert!(config.engine_options().chained_merge);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn garbage_numbers_fall_back() {
        let config = config_from(&[
            ("FREESLOT_PORT", "not-a-port"),
            ("FREESLOT_MAX_CONNECTIONS", "-3"),
            ("FREESLOT_CHAINED_MERGE", "maybe"),
        ]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert!(!config.chained_merge);
    }
}
