//! Configuration management for Identity Service
//!
//! Loads settings from:
//! 1. Environment variables
//! 2. .env file (local development)
//!
//! # Example
//!
//! ```no_run
//! use identity_service::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     println!("JWT issuer: {}", settings.jwt.issuer);
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use std::env;
use std::fmt;
use tracing::info;

/// Failed logins that lock an account
pub const MAX_ACCESS_ATTEMPTS: i32 = 5;

/// Digits in a password reset code
pub const RESET_CODE_DIGITS: u32 = 6;

/// Bytes of random salt per password
pub const SALT_SIZE: usize = 32;

/// Application settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// `None` runs against the in-memory store
    pub database: Option<DatabaseSettings>,
    pub jwt: JwtSettings,
}

impl Settings {
    pub fn load() -> Result<Self> {
        // Load .env file in development
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
            info!("Loaded .env file for development");
        }

        Ok(Settings {
            database: DatabaseSettings::from_env()?,
            jwt: JwtSettings::from_env()?,
        })
    }
}

/// Database connection settings
#[derive(Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: u64,
}

impl DatabaseSettings {
    fn from_env() -> Result<Option<Self>> {
        let url = match env::var("DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => url,
            _ => return Ok(None),
        };

        Ok(Some(Self {
            url,
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("Invalid DATABASE_MAX_CONNECTIONS")?,
            min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("Invalid DATABASE_MIN_CONNECTIONS")?,
            acquire_timeout: env::var("DATABASE_ACQUIRE_TIMEOUT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid DATABASE_ACQUIRE_TIMEOUT")?,
        }))
    }
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

/// JWT signing settings. Refresh tokens use their own secret and audience.
#[derive(Clone)]
pub struct JwtSettings {
    pub secret_key: String,
    pub issuer: String,
    pub audience: String,
    pub refresh_secret_key: String,
    pub refresh_audience: String,
}

impl JwtSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            secret_key: env::var("JWT_SECRET_KEY").context("JWT_SECRET_KEY must be set")?,
            issuer: env::var("JWT_ISSUER").context("JWT_ISSUER must be set")?,
            audience: env::var("JWT_AUDIENCE").context("JWT_AUDIENCE must be set")?,
            refresh_secret_key: env::var("JWT_REFRESH_SECRET_KEY")
                .context("JWT_REFRESH_SECRET_KEY must be set")?,
            refresh_audience: env::var("JWT_REFRESH_AUDIENCE")
                .context("JWT_REFRESH_AUDIENCE must be set")?,
        })
    }
}

impl fmt::Debug for JwtSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtSettings")
            .field("secret_key", &"[REDACTED]")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("refresh_secret_key", &"[REDACTED]")
            .field("refresh_audience", &self.refresh_audience)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const JWT_VARS: [(&str, &str); 5] = [
        ("JWT_SECRET_KEY", "test-secret-key"),
        ("JWT_ISSUER", "test-issuer"),
        ("JWT_AUDIENCE", "test-web"),
        ("JWT_REFRESH_SECRET_KEY", "test-refresh-secret"),
        ("JWT_REFRESH_AUDIENCE", "test-refresh"),
    ];

    fn set_jwt_vars() {
        for (key, value) in JWT_VARS {
            env::set_var(key, value);
        }
    }

    fn clear_jwt_vars() {
        for (key, _) in JWT_VARS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_jwt_settings_from_env() {
        set_jwt_vars();

        let settings = JwtSettings::from_env().unwrap();

        assert_eq!(settings.secret_key, "test-secret-key");
        assert_eq!(settings.issuer, "test-issuer");
        assert_eq!(settings.audience, "test-web");
        assert_eq!(settings.refresh_secret_key, "test-refresh-secret");
        assert_eq!(settings.refresh_audience, "test-refresh");

        clear_jwt_vars();
    }

    #[test]
    #[serial]
    fn test_missing_refresh_secret_fails() {
        set_jwt_vars();
        env::remove_var("JWT_REFRESH_SECRET_KEY");

        let err = JwtSettings::from_env().unwrap_err();
        assert!(err.to_string().contains("JWT_REFRESH_SECRET_KEY"));

        clear_jwt_vars();
    }

    #[test]
    #[serial]
    fn test_database_settings_optional() {
        env::remove_var("DATABASE_URL");
        assert!(DatabaseSettings::from_env().unwrap().is_none());
    }

    #[test]
    #[serial]
    fn test_database_settings_from_env() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("DATABASE_MAX_CONNECTIONS", "100");

        let settings = DatabaseSettings::from_env().unwrap().unwrap();

        assert_eq!(settings.url, "postgres://localhost/test");
        assert_eq!(settings.max_connections, 100);
        assert_eq!(settings.min_connections, 2); // Default
        assert_eq!(settings.acquire_timeout, 10); // Default

        env::remove_var("DATABASE_URL");
        env::remove_var("DATABASE_MAX_CONNECTIONS");
    }

    #[test]
    #[serial]
    fn test_invalid_pool_size_rejected() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("DATABASE_MAX_CONNECTIONS", "many");

        assert!(DatabaseSettings::from_env().is_err());

        env::remove_var("DATABASE_URL");
        env::remove_var("DATABASE_MAX_CONNECTIONS");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let jwt = JwtSettings {
            secret_key: "s3cr3t".to_string(),
            issuer: "issuer".to_string(),
            audience: "aud".to_string(),
            refresh_secret_key: "r3fr3sh".to_string(),
            refresh_audience: "raud".to_string(),
        };
        let db = DatabaseSettings {
            url: "postgres://user:pw@host/db".to_string(),
            max_connections: 1,
            min_connections: 1,
            acquire_timeout: 1,
        };

        let rendered = format!("{jwt:?} {db:?}");
        assert!(!rendered.contains("s3cr3t"));
        assert!(!rendered.contains("r3fr3sh"));
        assert!(!rendered.contains("pw@host"));
    }
}
