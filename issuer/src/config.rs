//! Issuer configuration.

use cards_common::{Currency, IssuerError, Result};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
}

/// Main issuer configuration.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Currencies cards may be loaded and billed in.
    pub currencies: Vec<Currency>,
    /// PostgreSQL store. `None` runs against the in-memory ledger.
    pub database: Option<DatabaseConfig>,
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            currencies: vec![Currency::brl(), Currency::eur(), Currency::gbp(), Currency::usd()],
            database: None,
            log_level: "info".to_string(),
        }
    }
}

impl IssuerConfig {
    /// Default pool size.
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(currencies) = std::env::var("ISSUER_CURRENCIES") {
            config.currencies = parse_currencies(&currencies);
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::DEFAULT_MAX_CONNECTIONS);
            config.database = Some(DatabaseConfig {
                url,
                max_connections,
            });
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.currencies.is_empty() {
            return Err(IssuerError::Configuration(
                "At least one currency must be configured".to_string(),
            ));
        }

        if let Some(bad) = self
            .currencies
            .iter()
            .find(|c| !Currency::is_iso_code(c.code()))
        {
            return Err(IssuerError::Configuration(format!(
                "\"{}\" is not a 3-letter currency code",
                bad
            )));
        }

        if let Some(db) = &self.database {
            if db.url.is_empty() {
                return Err(IssuerError::Configuration(
                    "Database URL cannot be empty".to_string(),
                ));
            }
            if db.max_connections == 0 {
                return Err(IssuerError::Configuration(
                    "Database pool needs at least one connection".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Whether `code` is one of the configured currencies.
    pub fn supports(&self, code: &str) -> bool {
        self.currencies.iter().any(|c| c.code() == code)
    }
}

fn parse_currencies(raw: &str) -> Vec<Currency> {
    raw.split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(Currency::new)
        .collect()
}
