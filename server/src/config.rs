//! Configuration management for the server.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use pos_sync_engine::LedgerLimits;

const DEFAULT_PERSISTED_TABLES: &str = "order_header,order_line,order_payment";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL; the in-memory durable store is used without one
    pub database_url: Option<String>,
    /// Upper bound on pooled Postgres connections
    pub db_max_connections: u32,
    /// Identifier stamped on every sync payload
    pub server_id: String,
    /// Write-through cache TTL in milliseconds
    pub hybrid_cache_ttl_ms: u64,
    /// Tables backed by durable storage
    pub persisted_tables: Vec<String>,
    pub trans_history_limit: usize,
    pub trans_mutation_history_limit: usize,
    /// Cached sync states kept before the oldest is evicted
    pub sync_state_limit: usize,
    /// JSON schema definition, built-in POS schema when unset
    pub schema_path: Option<PathBuf>,
    /// JSON sequence rules, built-in invoice rule when unset
    pub sequence_rules_path: Option<PathBuf>,
    /// JSON `{moduleId: {table: [rows]}}` loaded into new datasets and on reset
    pub seed_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: None,
            db_max_connections: 10,
            server_id: uuid::Uuid::new_v4().to_string(),
            hybrid_cache_ttl_ms: 1500,
            persisted_tables: parse_list(DEFAULT_PERSISTED_TABLES),
            trans_history_limit: 500,
            trans_mutation_history_limit: 25,
            sync_state_limit: 1024,
            schema_path: None,
            sequence_rules_path: None,
            seed_path: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = env::var("HOST").unwrap_or(defaults.host);

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty());

        let server_id = env::var("SERVER_ID")
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or(defaults.server_id);

        let persisted_tables = env::var("PERSISTED_TABLES")
            .map(|raw| parse_list(&raw))
            .unwrap_or(defaults.persisted_tables);

        Ok(Self {
            host,
            port,
            database_url,
            db_max_connections: number_var("DB_MAX_CONNECTIONS", defaults.db_max_connections)?.max(1),
            server_id,
            hybrid_cache_ttl_ms: number_var("HYBRID_CACHE_TTL_MS", defaults.hybrid_cache_ttl_ms)?
                .max(100),
            persisted_tables,
            trans_history_limit: number_var("TRANS_HISTORY_LIMIT", defaults.trans_history_limit)?,
            trans_mutation_history_limit: number_var(
                "TRANS_MUTATION_HISTORY_LIMIT",
                defaults.trans_mutation_history_limit,
            )?,
            sync_state_limit: number_var("SYNC_STATE_LIMIT", defaults.sync_state_limit)?.max(1),
            schema_path: env::var("SCHEMA_PATH").ok().map(PathBuf::from),
            sequence_rules_path: env::var("SEQUENCE_RULES_PATH").ok().map(PathBuf::from),
            seed_path: env::var("SEED_PATH").ok().map(PathBuf::from),
        })
    }

    /// Dedup ledger bounds, clamped to their minimums.
    pub fn ledger_limits(&self) -> LedgerLimits {
        LedgerLimits::new(self.trans_history_limit, self.trans_mutation_history_limit)
    }
}

fn number_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            parse_number(&raw).ok_or(ConfigError::InvalidNumber { name, value: raw })
        }
        _ => Ok(default),
    }
}

fn parse_number<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

/// Split a comma separated list, dropping blanks and duplicates.
pub fn parse_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if !out.iter().any(|existing| existing == entry) {
            out.push(entry.to_string());
        }
    }
    out
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid {name} value: {value}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parsing() {
        assert_eq!(
            parse_list(" order_header, ,order_line,order_header "),
            vec!["order_header".to_string(), "order_line".to_string()]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn number_parsing() {
        assert_eq!(parse_number::<u64>(" 2500 "), Some(2500));
        assert_eq!(parse_number::<usize>("many"), None);
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.persisted_tables.len(), 3);
        assert_eq!(config.hybrid_cache_ttl_ms, 1500);
        assert_eq!(config.ledger_limits(), LedgerLimits::new(500, 25));
        assert!(config.database_url.is_none());
    }
}
