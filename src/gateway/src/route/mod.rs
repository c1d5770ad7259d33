use hashbrown::HashMap;
use itertools::Itertools;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Separates tenant from source inside a database identifier.
pub const IDENTITY_SEPARATOR: &str = "__";
/// Last-resort shared upstream key.
pub const WILDCARD_KEY: &str = "*";

/// Frontend protocol a route table belongs to. One table per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbKind {
    Postgres,
    MySql,
    SqlServer,
}

impl DbKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbKind::Postgres => "postgres",
            DbKind::MySql => "mysql",
            DbKind::SqlServer => "sqlserver",
        }
    }
}

impl fmt::Display for DbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved upstream database instance.
///
/// `database`, when present, replaces the database field of the outbound
/// handshake before it is forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub database: Option<String>,
}

impl UpstreamTarget {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub type UpstreamMap = HashMap<String, UpstreamTarget>;

/// Tenant/source pair recovered from the login frame. Built per connection,
/// consumed by a single lookup, then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingIdentity {
    pub tenant: String,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown tenant/source for {db_kind}: db='{db_name}' user='{user_name}'")]
pub struct RouteError {
    pub db_kind: DbKind,
    pub db_name: String,
    pub user_name: String,
}

fn normalize(value: Option<&str>) -> String {
    value.unwrap_or("").trim().to_lowercase()
}

/// Recover the tenant/source identity from database and user values.
///
/// The database token wins when present, supporting `tenant` and
/// `tenant__source`. Otherwise the username is treated as a delimited bag of
/// `key:value` segments where only `tenant` and `source` are recognized.
pub fn parse_routing_identity(db_name: Option<&str>, user_name: Option<&str>) -> RoutingIdentity {
    let db_token = normalize(db_name);
    if !db_token.is_empty() {
        if let Some((tenant, source)) = db_token.split_once(IDENTITY_SEPARATOR) {
            return RoutingIdentity {
                tenant: tenant.to_string(),
                source: (!source.is_empty()).then(|| source.to_string()),
            };
        }
        return RoutingIdentity {
            tenant: db_token,
            source: None,
        };
    }

    let user_token = normalize(user_name);
    if !user_token.is_empty() {
        let mut tenant: Option<String> = None;
        let mut source: Option<String> = None;
        for segment in user_token.replace(['|', ','], ";").split(';') {
            let Some((key, value)) = segment.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key {
                "tenant" => tenant = Some(value.to_string()),
                "source" => source = Some(value.to_string()),
                _ => {}
            }
        }
        if let Some(tenant) = tenant {
            return RoutingIdentity { tenant, source };
        }
    }

    RoutingIdentity {
        tenant: String::new(),
        source: None,
    }
}

fn candidates(lowered_db: &str, identity: &RoutingIdentity) -> Vec<String> {
    let compound = match (&identity.tenant, &identity.source) {
        (tenant, Some(source)) if !tenant.is_empty() => {
            format!("{tenant}{IDENTITY_SEPARATOR}{source}")
        }
        _ => String::new(),
    };
    [lowered_db.to_string(), compound, identity.tenant.clone()]
        .into_iter()
        .filter(|candidate| !candidate.is_empty())
        .unique()
        .collect()
}

/// Select the upstream for the identity observed on the wire.
///
/// Exact keys win over prefixes so that `tenant__source` entries override a
/// bare `tenant` entry. Prefix matching (longest key first) is kept for
/// connection strings that append a suffix to a tenant id. The `*` entry is
/// the configured fallback.
pub fn resolve<'a>(
    upstreams: &'a UpstreamMap,
    db_kind: DbKind,
    db_name: &str,
    user_name: Option<&str>,
) -> Result<&'a UpstreamTarget, RouteError> {
    let identity = parse_routing_identity(Some(db_name), user_name);
    let lowered = normalize(Some(db_name));
    let candidates = candidates(&lowered, &identity);

    for candidate in &candidates {
        if let Some(exact) = upstreams.get(candidate) {
            return Ok(exact);
        }
    }

    let prefixes = upstreams
        .iter()
        .sorted_by(|a, b| b.0.len().cmp(&a.0.len()))
        .collect_vec();
    for candidate in &candidates {
        for (prefix, upstream) in &prefixes {
            if candidate.starts_with(prefix.as_str()) {
                return Ok(upstream);
            }
        }
    }

    if let Some(wildcard) = upstreams.get(WILDCARD_KEY) {
        return Ok(wildcard);
    }

    Err(RouteError {
        db_kind,
        db_name: db_name.to_string(),
        user_name: user_name.unwrap_or("").to_string(),
    })
}
