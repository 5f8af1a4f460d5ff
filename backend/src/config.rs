use std::collections::HashSet;
use std::env;

use anyhow::{Context, Result};

/// Process settings, read from the environment (and `.env` via dotenvy).
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: String,
    pub bind_addr: String,
    pub port: u16,
    pub api_prefix: String,
    pub device_keys: DeviceKeys,
    pub cors_origins: Vec<String>,
    pub pool_size: u32,
}

/// Bearer keys a field device may present to the ingest endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceKeys(HashSet<String>);

impl DeviceKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| -> String {
            match lookup(key) {
                Some(value) if !value.trim().is_empty() => value.trim().to_string(),
                _ => default.to_string(),
            }
        };

        let port = var("PORT", "8000");
        let pool_size = var("DB_POOL_SIZE", "8");
        let mut api_prefix = var("API_V1_PREFIX", "/api/v1");
        if !api_prefix.starts_with('/') {
            api_prefix.insert(0, '/');
        }

        Ok(Self {
            database_url: var("DATABASE_URL", "airiq.db"),
            bind_addr: var("BIND_ADDR", "127.0.0.1"),
            port: port
                .parse()
                .with_context(|| format!("PORT must be a port number, got {port:?}"))?,
            api_prefix: api_prefix.trim_end_matches('/').to_string(),
            device_keys: DeviceKeys::new(split_list(&var("DEVICE_API_KEYS", ""))),
            cors_origins: split_list(&var("CORS_ORIGINS", "*")).collect(),
            pool_size: pool_size
                .parse()
                .with_context(|| format!("DB_POOL_SIZE must be a number, got {pool_size:?}"))?,
        })
    }
}
