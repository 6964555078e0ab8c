//! Service configuration from the environment
//!
//! Two database profiles:
//! - managed: `DATABASE_URL` is set; TLS is expected and connections are
//!   recycled after `DB_MAX_USES` queries
//! - local: discrete `PG*` variables with development defaults
//!
//! Everything is read through a lookup function so tests never touch the
//! process environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use gcms_db::PoolConfig;
use sqlx::postgres::PgSslMode;
use thiserror::Error;

const DEFAULT_PORT: u16 = 5001;
const MANAGED_MAX_USES: u64 = 7500;
const DEV_CORS_ORIGINS: &[&str] = &["http://localhost:3000", "http://localhost:3001"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("DATABASE_SSL_MODE must be set explicitly for a managed database in production")]
    SslModeRequired,
}

impl ConfigError {
    fn invalid(var: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// `production` (any case) selects production; anything else is development.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("production") => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum DatabaseProfile {
    Managed {
        url: String,
    },
    Local {
        host: String,
        port: u16,
        user: String,
        password: Option<String>,
        database: String,
    },
}

impl DatabaseProfile {
    pub fn is_managed(&self) -> bool {
        matches!(self, Self::Managed { .. })
    }
}

impl std::fmt::Debug for DatabaseProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Managed { url } => f
                .debug_struct("Managed")
                .field("url", &redact_url(url))
                .finish(),
            Self::Local {
                host,
                port,
                user,
                password,
                database,
            } => f
                .debug_struct("Local")
                .field("host", host)
                .field("port", port)
                .field("user", user)
                .field("password", &password.as_ref().map(|_| "***"))
                .field("database", database)
                .finish(),
        }
    }
}

/// Database connection and pool settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub profile: DatabaseProfile,
    /// `None` keeps whatever the connection URL asks for
    pub ssl_mode: Option<PgSslMode>,
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Allowed cross-origin callers; empty means same-origin only
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            cors_origins: DEV_CORS_ORIGINS.iter().map(|o| o.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
}

impl AppConfig {
    /// Load from the process environment (call `dotenvy` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = Environment::parse(get("APP_ENV").or_else(|| get("NODE_ENV")).as_deref());
        let server = server_config(&get, environment)?;
        let database = database_config(&get, environment)?;

        Ok(Self {
            environment,
            server,
            database,
        })
    }
}

fn server_config<G>(get: &G, environment: Environment) -> Result<ServerConfig, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let port = parse_var(get, "PORT")?.unwrap_or(DEFAULT_PORT);
    // not HOST: shells export that as the machine's hostname
    let host = match get("GCMS_HOST") {
        Some(raw) => raw
            .trim()
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::invalid("GCMS_HOST", e.to_string()))?,
        None if environment.is_production() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        None => IpAddr::V4(Ipv4Addr::LOCALHOST),
    };

    let cors_origins = match get("CORS_ORIGINS") {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_owned)
            .collect(),
        None if environment.is_production() => Vec::new(),
        None => DEV_CORS_ORIGINS.iter().map(|o| o.to_string()).collect(),
    };

    Ok(ServerConfig {
        bind_addr: SocketAddr::new(host, port),
        cors_origins,
    })
}

fn database_config<G>(get: &G, environment: Environment) -> Result<DatabaseConfig, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let explicit_ssl = match get("DATABASE_SSL_MODE") {
        Some(raw) => Some(
            raw.trim()
                .parse::<PgSslMode>()
                .map_err(|e| ConfigError::invalid("DATABASE_SSL_MODE", e.to_string()))?,
        ),
        None => None,
    };

    let (profile, ssl_mode) = match get("DATABASE_URL") {
        Some(url) => {
            let ssl_mode = match explicit_ssl {
                Some(mode) => Some(mode),
                None if url.contains("sslmode=") => None,
                None if environment.is_production() => return Err(ConfigError::SslModeRequired),
                None => {
                    tracing::warn!(
                        "DATABASE_SSL_MODE not set; using `require` (encrypted, certificate not verified)"
                    );
                    Some(PgSslMode::Require)
                }
            };
            (DatabaseProfile::Managed { url }, ssl_mode)
        }
        None => {
            let profile = DatabaseProfile::Local {
                host: get("PGHOST").unwrap_or_else(|| "localhost".into()),
                port: parse_var(get, "PGPORT")?.unwrap_or(5432),
                user: get("PGUSER").unwrap_or_else(|| "postgres".into()),
                password: get("PGPASSWORD"),
                database: get("PGDATABASE").unwrap_or_else(|| "gcms".into()),
            };
            (profile, Some(explicit_ssl.unwrap_or(PgSslMode::Prefer)))
        }
    };

    let defaults = PoolConfig::default();
    let max_uses = match parse_var::<u64, _>(get, "DB_MAX_USES")? {
        Some(0) => None,
        Some(n) => Some(n),
        None if profile.is_managed() => Some(MANAGED_MAX_USES),
        None => None,
    };
    let pool = PoolConfig::default()
        .with_max_connections(parse_var(get, "DB_POOL_MAX")?.unwrap_or(defaults.max_connections))
        .with_idle_timeout(match parse_var::<u64, _>(get, "DB_IDLE_TIMEOUT_MS")? {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.idle_timeout,
        })
        .with_acquire_timeout(
            parse_var(get, "DB_ACQUIRE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquire_timeout),
        )
        .with_max_uses(max_uses);

    if pool.max_connections == 0 {
        return Err(ConfigError::invalid("DB_POOL_MAX", "must be at least 1"));
    }

    Ok(DatabaseConfig {
        profile,
        ssl_mode,
        pool,
    })
}

fn parse_var<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::invalid(var, format!("{raw:?}: {e}")))
        })
        .transpose()
}

/// Hide the password in a connection URL.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return "***".into();
    };
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };
    let (scheme, rest) = base.split_at(scheme_end + 3);

    let mut out = scheme.to_owned();
    match rest.rfind('@') {
        Some(at) => {
            let userinfo = &rest[..at];
            let user = userinfo.split_once(':').map_or(userinfo, |(user, _)| user);
            out.push_str(user);
            out.push_str(":***");
            out.push_str(&rest[at..]);
        }
        None => out.push_str(rest),
    }

    if let Some(query) = query {
        let params: Vec<String> = query
            .split('&')
            .map(|pair| match pair.split_once('=') {
                Some((key, _)) if key.to_ascii_lowercase().contains("password") => {
                    format!("{key}=***")
                }
                _ => pair.to_owned(),
            })
            .collect();
        out.push('?');
        out.push_str(&params.join("&"));
    }
    out
}
