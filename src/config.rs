use std::io::{self, ErrorKind};
use std::path::PathBuf;

use chrono::FixedOffset;

use crate::engine::EngineSettings;
use crate::model::ScopeMode;

/// Server configuration, read once at startup from `AGENDA_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub staff_users: Vec<String>,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset variables fall back to defaults; set but malformed ones are errors.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let port = parse_or(&get, "AGENDA_PORT", 5433)?;
        let bind = get("AGENDA_BIND").unwrap_or_else(|| "0.0.0.0".into());
        let data_dir = PathBuf::from(get("AGENDA_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let password = get("AGENDA_PASSWORD").unwrap_or_else(|| "agenda".into());
        let max_connections = parse_or(&get, "AGENDA_MAX_CONNECTIONS", 256)?;
        let compact_threshold = parse_or(&get, "AGENDA_COMPACT_THRESHOLD", 1000)?;
        let metrics_port = get("AGENDA_METRICS_PORT")
            .map(|v| parse_value("AGENDA_METRICS_PORT", &v))
            .transpose()?;

        let staff_users = get("AGENDA_STAFF_USERS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let scope_mode = match get("AGENDA_SCOPE_MODE") {
            Some(v) => v.parse::<ScopeMode>().map_err(invalid)?,
            None => ScopeMode::Global,
        };
        let offset_minutes: i32 = parse_or(&get, "AGENDA_UTC_OFFSET_MINUTES", 0)?;
        let utc_offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| {
            invalid(format!("AGENDA_UTC_OFFSET_MINUTES out of range: {offset_minutes}"))
        })?;

        Ok(Self {
            port,
            bind,
            data_dir,
            password,
            max_connections,
            compact_threshold,
            metrics_port,
            tls_cert: get("AGENDA_TLS_CERT"),
            tls_key: get("AGENDA_TLS_KEY"),
            staff_users,
            engine: EngineSettings {
                scope_mode,
                utc_offset,
            },
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> io::Result<T> {
    match get(key) {
        Some(v) => parse_value(key, &v),
        None => Ok(default),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> io::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(format!("invalid {key}: {value}")))
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg)
}
