use std::str::FromStr;

use serde::Deserialize;

/// Deployment mode; controls error verbosity and the cookie `Secure` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => anyhow::bail!("unknown APP_ENV value: {other}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub cookie_ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub environment: Environment,
    pub reset_ttl_minutes: i64,
    pub public_url: String,
}

/// Upper bounds on configured lifetimes: ten years for sessions and cookies,
/// one day for reset tokens.
const MAX_SESSION_MINUTES: i64 = 60 * 24 * 365 * 10;
const MAX_COOKIE_DAYS: i64 = 365 * 10;
const MAX_RESET_MINUTES: i64 = 60 * 24;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "tourbook".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "tourbook-users".into()),
            ttl_minutes: env_or("JWT_EXPIRES_IN_MINUTES", 60 * 24 * 90),
            cookie_ttl_days: env_or("JWT_COOKIE_EXPIRES_IN_DAYS", 90),
        };
        let environment = match std::env::var("APP_ENV") {
            Ok(v) => v.parse()?,
            Err(_) => Environment::Development,
        };
        let public_url = std::env::var("PUBLIC_URL")
            .unwrap_or_else(|_| "http://localhost:8080".into())
            .trim_end_matches('/')
            .to_string();

        let config = Self {
            database_url,
            jwt,
            environment,
            reset_ttl_minutes: env_or("PASSWORD_RESET_TTL_MINUTES", 10),
            public_url,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects lifetimes that are non-positive or too large to add to a timestamp.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=MAX_SESSION_MINUTES).contains(&self.jwt.ttl_minutes),
            "JWT_EXPIRES_IN_MINUTES must be between 1 and {MAX_SESSION_MINUTES}"
        );
        anyhow::ensure!(
            (1..=MAX_COOKIE_DAYS).contains(&self.jwt.cookie_ttl_days),
            "JWT_COOKIE_EXPIRES_IN_DAYS must be between 1 and {MAX_COOKIE_DAYS}"
        );
        anyhow::ensure!(
            (1..=MAX_RESET_MINUTES).contains(&self.reset_ttl_minutes),
            "PASSWORD_RESET_TTL_MINUTES must be between 1 and {MAX_RESET_MINUTES}"
        );
        Ok(())
    }
}
