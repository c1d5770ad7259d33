use crate::route::{UpstreamMap, UpstreamTarget};
use serde::Deserialize;
use std::env;
use thiserror::Error;

pub const ENV_LISTEN_HOST: &str = "PROXY_LISTEN_HOST";
pub const ENV_PG_PORT: &str = "PROXY_PG_PORT";
pub const ENV_MYSQL_PORT: &str = "PROXY_MYSQL_PORT";
pub const ENV_SQLSERVER_PORT: &str = "PROXY_SQLSERVER_PORT";
pub const ENV_POSTGRES_UPSTREAMS: &str = "PROXY_POSTGRES_UPSTREAMS";
pub const ENV_MYSQL_UPSTREAMS: &str = "PROXY_MYSQL_UPSTREAMS";
pub const ENV_SQLSERVER_UPSTREAMS: &str = "PROXY_SQLSERVER_UPSTREAMS";

pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_PG_PORT: u16 = 55432;
pub const DEFAULT_MYSQL_PORT: u16 = 53306;
pub const DEFAULT_SQLSERVER_PORT: u16 = 51433;

/// Fatal at startup; the process exits non-zero instead of serving with a
/// partial route table.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{env_name} must be a JSON object of upstream targets: {source}")]
    Json {
        env_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{env_name} keys must be non-empty")]
    EmptyKey { env_name: &'static str },
    #[error("{env_name}.{key}.host is required")]
    EmptyHost { env_name: &'static str, key: String },
    #[error("{env_name}.{key}.port must be > 0")]
    InvalidPort { env_name: &'static str, key: String },
    #[error("{env_name} must be a port number, got '{value}'")]
    ListenPort {
        env_name: &'static str,
        value: String,
    },
}

/// Upstream maps and listen addresses, loaded once at process start and then
/// threaded by value into each protocol server.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub listen_host: String,
    pub pg_port: u16,
    pub mysql_port: u16,
    pub sqlserver_port: u16,
    pub postgres_upstreams: UpstreamMap,
    pub mysql_upstreams: UpstreamMap,
    pub sqlserver_upstreams: UpstreamMap,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            listen_host: env::var(ENV_LISTEN_HOST).unwrap_or_else(|_| DEFAULT_LISTEN_HOST.into()),
            pg_port: env_port(ENV_PG_PORT, DEFAULT_PG_PORT)?,
            mysql_port: env_port(ENV_MYSQL_PORT, DEFAULT_MYSQL_PORT)?,
            sqlserver_port: env_port(ENV_SQLSERVER_PORT, DEFAULT_SQLSERVER_PORT)?,
            postgres_upstreams: env_upstreams(ENV_POSTGRES_UPSTREAMS)?,
            mysql_upstreams: env_upstreams(ENV_MYSQL_UPSTREAMS)?,
            sqlserver_upstreams: env_upstreams(ENV_SQLSERVER_UPSTREAMS)?,
        })
    }

    pub fn pg_listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.pg_port)
    }

    pub fn mysql_listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.mysql_port)
    }

    pub fn sqlserver_listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.sqlserver_port)
    }
}

fn env_port(env_name: &'static str, default: u16) -> Result<u16, ConfigError> {
    match env::var(env_name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::ListenPort {
                    env_name,
                    value: raw,
                })
        }
        _ => Ok(default),
    }
}

fn env_upstreams(env_name: &'static str) -> Result<UpstreamMap, ConfigError> {
    match env::var(env_name) {
        Ok(raw) if !raw.trim().is_empty() => parse_upstreams(env_name, &raw),
        _ => Ok(UpstreamMap::default()),
    }
}

/// Wire shape of one upstream entry. Unknown fields are rejected up front so
/// a typo in the deployment JSON fails the boot instead of silently dropping
/// a route override.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    host: String,
    port: u16,
    #[serde(default)]
    database: Option<String>,
}

/// Decode one `PROXY_*_UPSTREAMS` JSON object.
///
/// Expected format:
/// `{ "<tenant or tenant__source or *>": {"host": "...", "port": 5432, "database": "optional"} }`
///
/// Keys are trimmed and lowercased; an empty `database` string means no
/// override.
pub fn parse_upstreams(env_name: &'static str, raw: &str) -> Result<UpstreamMap, ConfigError> {
    let parsed: hashbrown::HashMap<String, RawTarget> =
        serde_json::from_str(raw).map_err(|source| ConfigError::Json { env_name, source })?;

    let mut result = UpstreamMap::with_capacity(parsed.len());
    for (key, value) in parsed {
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            return Err(ConfigError::EmptyKey { env_name });
        }
        let host = value.host.trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::EmptyHost { env_name, key });
        }
        if value.port == 0 {
            return Err(ConfigError::InvalidPort { env_name, key });
        }
        let database = value
            .database
            .map(|db| db.trim().to_string())
            .filter(|db| !db.is_empty());
        result.insert(
            key,
            UpstreamTarget {
                host,
                port: value.port,
                database,
            },
        );
    }
    Ok(result)
}
