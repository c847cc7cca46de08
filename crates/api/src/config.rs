//! Server configuration loaded from the environment

use std::env;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";
const DEFAULT_JWT_EXPIRY_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone)]
pub struct Config {
    /// Unset means run against the in-memory store
    pub database_url: Option<String>,
    pub bind_address: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub redis_url: Option<String>,
    pub wave_webhook_secret: String,
    pub orange_money_webhook_secret: String,
    pub free_money_webhook_secret: String,
    pub payment_gateway_url: Option<String>,
    pub payment_gateway_api_key: Option<String>,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

// Secrets stay out of logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_configured", &self.database_url.is_some())
            .field("bind_address", &self.bind_address)
            .field("jwt_expiry_hours", &self.jwt_expiry_hours)
            .field("redis_configured", &self.redis_url.is_some())
            .field("payment_gateway_url", &self.payment_gateway_url)
            .field("allowed_origins", &self.allowed_origins)
            .field("run_migrations", &self.run_migrations)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = non_empty("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let jwt_expiry_hours = match non_empty("JWT_EXPIRY_HOURS") {
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|h| *h > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "JWT_EXPIRY_HOURS",
                    reason: format!("'{}' is not a positive number of hours", raw),
                })?,
            None => DEFAULT_JWT_EXPIRY_HOURS,
        };

        let run_migrations = match non_empty("RUN_MIGRATIONS") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
                name: "RUN_MIGRATIONS",
                reason: format!("'{}' is not a boolean", raw),
            })?,
            None => true,
        };

        let allowed_origins = non_empty("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            bind_address: non_empty("BIND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            jwt_secret,
            jwt_expiry_hours,
            redis_url: non_empty("REDIS_URL"),
            wave_webhook_secret: non_empty("WAVE_WEBHOOK_SECRET").unwrap_or_default(),
            orange_money_webhook_secret: non_empty("ORANGE_MONEY_WEBHOOK_SECRET")
                .unwrap_or_default(),
            free_money_webhook_secret: non_empty("FREE_MONEY_WEBHOOK_SECRET").unwrap_or_default(),
            payment_gateway_url: non_empty("PAYMENT_GATEWAY_URL"),
            payment_gateway_api_key: non_empty("PAYMENT_GATEWAY_API_KEY"),
            allowed_origins,
            run_migrations,
        })
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 12] = [
        "DATABASE_URL",
        "BIND_ADDRESS",
        "JWT_SECRET",
        "JWT_EXPIRY_HOURS",
        "REDIS_URL",
        "WAVE_WEBHOOK_SECRET",
        "ORANGE_MONEY_WEBHOOK_SECRET",
        "FREE_MONEY_WEBHOOK_SECRET",
        "PAYMENT_GATEWAY_URL",
        "PAYMENT_GATEWAY_API_KEY",
        "ALLOWED_ORIGINS",
        "RUN_MIGRATIONS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_missing_jwt_secret_is_rejected() {
        clear_env();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("JWT_SECRET")));
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        env::set_var("JWT_SECRET", "test-secret");

        let config = Config::from_env().unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.jwt_expiry_hours, 24);
        assert!(config.run_migrations);
        assert_eq!(config.allowed_origins.len(), 2);
        assert!(config.wave_webhook_secret.is_empty());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_blank_values_count_as_unset() {
        clear_env();
        env::set_var("JWT_SECRET", "test-secret");
        env::set_var("REDIS_URL", "   ");
        env::set_var("PAYMENT_GATEWAY_URL", "");

        let config = Config::from_env().unwrap();
        assert!(config.redis_url.is_none());
        assert!(config.payment_gateway_url.is_none());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_run_migrations() {
        clear_env();
        env::set_var("JWT_SECRET", "test-secret");
        env::set_var("RUN_MIGRATIONS", "maybe");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "RUN_MIGRATIONS",
                ..
            }
        ));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_debug_hides_secrets() {
        clear_env();
        env::set_var("JWT_SECRET", "super-secret-value");
        env::set_var("WAVE_WEBHOOK_SECRET", "wave-secret-value");

        let config = Config::from_env().unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret-value"));
        assert!(!rendered.contains("wave-secret-value"));

        clear_env();
    }
}
