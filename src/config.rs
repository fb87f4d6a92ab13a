use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;

use crate::engine::EngineConfig;
use crate::limits::MAX_HOLD_SECONDS;

pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;

/// Server settings, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// TOML users file. Without one, a single client account is served.
    pub users_file: Option<PathBuf>,
    /// Password of the built-in client account.
    pub password: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.var, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            users_file: None,
            password: "slotbook".into(),
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut c = Config::default();

        if let Some(v) = get("SLOTBOOK_BIND") {
            c.bind = v;
        }
        c.port = parsed(&get, "SLOTBOOK_PORT")?.unwrap_or(c.port);
        if let Some(v) = get("SLOTBOOK_DATA_DIR") {
            c.data_dir = PathBuf::from(v);
        }
        c.max_connections = parsed(&get, "SLOTBOOK_MAX_CONNECTIONS")?.unwrap_or(c.max_connections);
        if c.max_connections == 0 {
            return Err(invalid("SLOTBOOK_MAX_CONNECTIONS", "must be at least 1"));
        }
        c.compact_threshold =
            parsed(&get, "SLOTBOOK_COMPACT_THRESHOLD")?.unwrap_or(c.compact_threshold);
        c.users_file = get("SLOTBOOK_USERS_FILE").map(PathBuf::from);
        if let Some(v) = get("SLOTBOOK_PASSWORD") {
            c.password = v;
        }
        c.tls_cert = get("SLOTBOOK_TLS_CERT").map(PathBuf::from);
        c.tls_key = get("SLOTBOOK_TLS_KEY").map(PathBuf::from);
        c.metrics_port = parsed(&get, "SLOTBOOK_METRICS_PORT")?;

        if let Some(secs) = parsed::<u32>(&get, "SLOTBOOK_HOLD_SECONDS")? {
            if secs == 0 || secs > MAX_HOLD_SECONDS {
                return Err(invalid(
                    "SLOTBOOK_HOLD_SECONDS",
                    format!("must be between 1 and {MAX_HOLD_SECONDS}"),
                ));
            }
            c.engine.hold_seconds = secs;
        }
        if let Some(hours) = parsed::<u32>(&get, "SLOTBOOK_LEAD_TIME_HOURS")? {
            c.engine.lead_time_ms = hours as i64 * 3_600_000;
        }
        if let Some(tz) = get("SLOTBOOK_TIMEZONE") {
            c.engine.default_timezone = tz
                .parse::<Tz>()
                .map_err(|_| invalid("SLOTBOOK_TIMEZONE", format!("unknown timezone {tz:?}")))?;
        }
        Ok(c)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

fn parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|v| v.trim().parse::<T>().map_err(|e| invalid(var, format!("{v:?}: {e}"))))
        .transpose()
}

fn invalid(var: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError {
        var,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let c = from(&[]).unwrap();
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(c.engine.hold_seconds, 1800);
        assert_eq!(c.engine.lead_time_ms, 24 * 3_600_000);
        assert_eq!(c.engine.default_timezone, chrono_tz::America::Los_Angeles);
        assert!(c.users_file.is_none());
        assert_eq!(c.wal_path(), PathBuf::from("./data/slotbook.wal"));
    }

    #[test]
    fn overrides_apply() {
        let c = from(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_HOLD_SECONDS", "90"),
            ("SLOTBOOK_LEAD_TIME_HOURS", "2"),
            ("SLOTBOOK_TIMEZONE", "Europe/Berlin"),
            ("SLOTBOOK_USERS_FILE", "/etc/slotbook/users.toml"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.engine.hold_seconds, 90);
        assert_eq!(c.engine.lead_time_ms, 2 * 3_600_000);
        assert_eq!(c.engine.default_timezone, chrono_tz::Europe::Berlin);
        assert_eq!(c.users_file, Some(PathBuf::from("/etc/slotbook/users.toml")));
        assert_eq!(c.metrics_port, Some(9100));
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = from(&[("SLOTBOOK_PORT", "http")]).unwrap_err();
        assert_eq!(err.var, "SLOTBOOK_PORT");
        let err = from(&[("SLOTBOOK_HOLD_SECONDS", "0")]).unwrap_err();
        assert_eq!(err.var, "SLOTBOOK_HOLD_SECONDS");
        let err = from(&[("SLOTBOOK_TIMEZONE", "Atlantis/Capital")]).unwrap_err();
        assert_eq!(err.var, "SLOTBOOK_TIMEZONE");
        let err = from(&[("SLOTBOOK_MAX_CONNECTIONS", "0")]).unwrap_err();
        assert_eq!(err.var, "SLOTBOOK_MAX_CONNECTIONS");
    }
}
