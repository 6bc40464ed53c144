use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub allowed_origin: String,
    pub store_timeout: Duration,
    pub token_ttl: chrono::Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = lookup("PARLEY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("PARLEY_JWT_SECRET is unset or still a placeholder");
        }

        let host = var("PARLEY_HOST", "0.0.0.0");
        let port: u16 = var("PARLEY_PORT", "3001")
            .parse()
            .context("PARLEY_PORT is not a port number")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let store_timeout_ms: u64 = var("PARLEY_STORE_TIMEOUT_MS", "5000")
            .parse()
            .context("PARLEY_STORE_TIMEOUT_MS must be milliseconds")?;
        if store_timeout_ms == 0 {
            bail!("PARLEY_STORE_TIMEOUT_MS must be positive");
        }

        let token_ttl_days: i64 = var("PARLEY_TOKEN_TTL_DAYS", "30")
            .parse()
            .context("PARLEY_TOKEN_TTL_DAYS must be a whole number of days")?;
        if token_ttl_days <= 0 {
            bail!("PARLEY_TOKEN_TTL_DAYS must be positive");
        }

        Ok(Self {
            jwt_secret,
            db_path: var("PARLEY_DB_PATH", "parley.db").into(),
            addr,
            allowed_origin: var("PARLEY_ALLOWED_ORIGIN", "http://localhost:3000"),
            store_timeout: Duration::from_millis(store_timeout_ms),
            token_ttl: chrono::Duration::days(token_ttl_days),
        })
    }
}
