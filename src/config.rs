//! Environment-based Configuration
//!
//! Deployment configuration loaded from environment variables. Key
//! material always comes from the environment, never from hardcoded
//! values; public protocol parameters get development defaults so a local
//! instance starts with no setup.
//!
//! # Environment Variables
//!
//! ## Deployment
//! - `KTLOG_ENV` - "production" or "development" (default: "development")
//! - `KTLOG_DB_PATH` - SQLite database path; empty selects in-memory storage
//! - `KTLOG_PORT` - REST API port (default: 3001)
//! - `KTLOG_LOG_LEVEL` - Logging level (debug, info, warn, error)
//!
//! ## Keys (hex-encoded 32-byte seeds; required in production)
//! - `KTLOG_SIGNING_SEED` - Tree-head signing key seed
//! - `KTLOG_VRF_SEED` - VRF key seed
//!
//! ## Protocol parameters (milliseconds)
//! - `KTLOG_MAX_AHEAD` - Tolerated clock skew ahead (default: 1 minute)
//! - `KTLOG_MAX_BEHIND` - Tolerated staleness (default: 1 hour)
//! - `KTLOG_MONITORING_WINDOW` - Reasonable monitoring window (default: 1 day)
//! - `KTLOG_MAX_LIFETIME` - Entry lifetime; 0 disables expiry (default: 0)

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            _ => Err(ConfigError::InvalidValue(
                "KTLOG_ENV".to_string(),
                format!("unknown environment: {}", s),
            )),
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct KtConfig {
    /// Deployment environment
    pub environment: Environment,

    /// SQLite database path; None selects the in-memory store
    pub db_path: Option<String>,

    /// REST API port
    pub port: u16,

    /// Log level
    pub log_level: String,

    /// Tree-head signing key seed
    pub signing_seed: Option<[u8; 32]>,

    /// VRF key seed
    pub vrf_seed: Option<[u8; 32]>,

    /// Tolerated clock skew ahead of local time, milliseconds
    pub max_ahead: u64,

    /// Tolerated staleness behind local time, milliseconds
    pub max_behind: u64,

    /// Reasonable monitoring window, milliseconds
    pub reasonable_monitoring_window: u64,

    /// Maximum entry lifetime, milliseconds; None disables expiry
    pub maximum_lifetime: Option<u64>,
}

impl KtConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment: Environment = env::var("KTLOG_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .parse()?;

        let db_path = env::var("KTLOG_DB_PATH").ok().filter(|p| !p.is_empty());

        let port = parse_or("KTLOG_PORT", 3001u16)?;
        let log_level = env::var("KTLOG_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let signing_seed = read_seed("KTLOG_SIGNING_SEED", environment)?;
        let vrf_seed = read_seed("KTLOG_VRF_SEED", environment)?;

        let max_ahead = parse_or("KTLOG_MAX_AHEAD", 60_000u64)?;
        let max_behind = parse_or("KTLOG_MAX_BEHIND", 3_600_000u64)?;
        let reasonable_monitoring_window =
            parse_or("KTLOG_MONITORING_WINDOW", 86_400_000u64)?;
        let maximum_lifetime = match parse_or("KTLOG_MAX_LIFETIME", 0u64)? {
            0 => None,
            ms => Some(ms),
        };

        Ok(Self {
            environment,
            db_path,
            port,
            log_level,
            signing_seed,
            vrf_seed,
            max_ahead,
            max_behind,
            reasonable_monitoring_window,
            maximum_lifetime,
        })
    }

    /// Validate configuration for production readiness
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        if self.signing_seed.is_none() {
            return Err(ConfigError::MissingEnvVar("KTLOG_SIGNING_SEED".to_string()));
        }
        if self.vrf_seed.is_none() {
            return Err(ConfigError::MissingEnvVar("KTLOG_VRF_SEED".to_string()));
        }
        if self.db_path.is_none() {
            return Err(ConfigError::MissingEnvVar("KTLOG_DB_PATH".to_string()));
        }
        Ok(())
    }

    /// Print configuration summary (hiding key material)
    pub fn print_summary(&self) {
        println!("=== ktlog Configuration ===");
        println!("Environment: {:?}", self.environment);
        println!(
            "Database: {}",
            self.db_path.as_deref().unwrap_or("(in-memory)")
        );
        println!("Port: {}", self.port);
        println!("Signing key: {}", seed_status(&self.signing_seed));
        println!("VRF key: {}", seed_status(&self.vrf_seed));
        println!("Max ahead: {} ms", self.max_ahead);
        println!("Max behind: {} ms", self.max_behind);
        println!(
            "Monitoring window: {} ms",
            self.reasonable_monitoring_window
        );
        match self.maximum_lifetime {
            Some(ms) => println!("Max lifetime: {} ms", ms),
            None => println!("Max lifetime: disabled"),
        }
        println!("Log level: {}", self.log_level);
        println!("===========================");
    }
}

fn seed_status(seed: &Option<[u8; 32]>) -> &'static str {
    if seed.is_some() {
        "from environment"
    } else {
        "ephemeral (generated at startup)"
    }
}

fn parse_or<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(var.to_string(), raw)),
    }
}

/// Read a hex-encoded 32-byte seed; required only in production.
fn read_seed(var: &str, environment: Environment) -> Result<Option<[u8; 32]>, ConfigError> {
    match env::var(var) {
        Err(_) => {
            if environment == Environment::Production {
                Err(ConfigError::MissingEnvVar(var.to_string()))
            } else {
                Ok(None)
            }
        }
        Ok(raw) => {
            let bytes = hex::decode(&raw)
                .map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string()))?;
            let seed: [u8; 32] = bytes.try_into().map_err(|_| {
                ConfigError::InvalidValue(var.to_string(), "expected 32 bytes".to_string())
            })?;
            Ok(Some(seed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert!(matches!(
            "production".parse::<Environment>(),
            Ok(Environment::Production)
        ));
        assert!(matches!(
            "dev".parse::<Environment>(),
            Ok(Environment::Development)
        ));
        assert!("staging".parse::<Environment>().is_err());
    }
}
