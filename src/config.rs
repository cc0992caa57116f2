use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::auth::{AdminAllowlist, AdminListError};
use crate::engine::AvailabilityPolicy;

/// Server settings, read once at startup from `CHAIRTIME_*` environment variables.
/// Unparsable numbers and flags fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<(PathBuf, PathBuf)>,
    pub admins: AdminAllowlist,
    pub fail_open: bool,
    pub fallback_closed_weekday: u8,
    pub log: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("both CHAIRTIME_TLS_CERT and CHAIRTIME_TLS_KEY must be set, or neither")]
    IncompleteTls,
    #[error("CHAIRTIME_ADMIN_USERS: {0}")]
    AdminUsers(#[from] AdminListError),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "chairtime".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls: None,
            admins: AdminAllowlist::default(),
            fail_open: true,
            fallback_closed_weekday: 1,
            log: "info".into(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let var = |key: &str| lookup(&format!("CHAIRTIME_{key}"));

        let tls = match (var("TLS_CERT"), var("TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            _ => return Err(ConfigError::IncompleteTls),
        };

        Ok(Self {
            port: parsed(var("PORT"), defaults.port),
            bind: var("BIND").unwrap_or(defaults.bind),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: var("PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(var("MAX_CONNECTIONS"), defaults.max_connections).max(1),
            compact_threshold: parsed(var("COMPACT_THRESHOLD"), defaults.compact_threshold),
            metrics_port: var("METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            tls,
            admins: var("ADMIN_USERS")
                .map(|list| AdminAllowlist::parse(&list))
                .transpose()?
                .unwrap_or_default(),
            fail_open: var("FAIL_OPEN")
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.fail_open),
            fallback_closed_weekday: var("FALLBACK_CLOSED_WEEKDAY")
                .and_then(|s| s.trim().parse::<u8>().ok())
                .filter(|d| *d <= 6)
                .unwrap_or(defaults.fallback_closed_weekday),
            log: var("LOG").unwrap_or(defaults.log),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        self.tls
            .as_ref()
            .map(|(cert, key)| (cert.as_path(), key.as_path()))
    }

    pub fn availability_policy(&self) -> AvailabilityPolicy {
        AvailabilityPolicy {
            fail_open: self.fail_open,
            fallback_closed_weekday: self.fallback_closed_weekday,
        }
    }
}

fn parsed<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
