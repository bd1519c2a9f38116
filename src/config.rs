use std::{net::SocketAddr, str::FromStr};

use axum::http::HeaderValue;
use thiserror::Error;
use time::UtcOffset;

const DEFAULT_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "https://flammesup.netlify.app",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub auth_secret: String,
    pub session_inactivity_minutes: i64,
    pub display_offset: UtcOffset,
    pub cors_origins: Vec<HeaderValue>,
    pub max_db_connections: u32,
    pub connection_buffer: usize,
}

impl Config {
    /// Reads the process environment, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| dotenv::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let offset_minutes: i32 = parse(&lookup, "DISPLAY_UTC_OFFSET_MINUTES", 60)?;
        let display_offset = UtcOffset::from_whole_seconds(offset_minutes * 60).map_err(|e| ConfigError::Invalid {
            name: "DISPLAY_UTC_OFFSET_MINUTES",
            value: offset_minutes.to_string(),
            reason: e.to_string(),
        })?;

        let cors_origins = match lookup("CORS_ORIGINS") {
            Some(origins) => origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(|origin| {
                    HeaderValue::from_str(origin).map_err(|e| ConfigError::Invalid {
                        name: "CORS_ORIGINS",
                        value: origin.to_owned(),
                        reason: e.to_string(),
                    })
                })
                .collect::<Result<_, _>>()?,
            None => DEFAULT_ORIGINS.iter().copied().map(HeaderValue::from_static).collect(),
        };

        Ok(Config {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://flammes.db?mode=rwc".to_owned()),
            bind_addr: parse(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 5000)))?,
            auth_secret: lookup("AUTH_SECRET")
                .filter(|secret| !secret.is_empty())
                .ok_or(ConfigError::Missing("AUTH_SECRET"))?,
            session_inactivity_minutes: parse(&lookup, "SESSION_INACTIVITY_MINUTES", 30 * 24 * 60)?,
            display_offset,
            cors_origins,
            max_db_connections: parse(&lookup, "MAX_DB_CONNECTIONS", 16)?,
            connection_buffer: parse(&lookup, "CONNECTION_BUFFER", 64)?,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}
