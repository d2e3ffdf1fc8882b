use crate::error::{LatticeError, Result};
use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_max_lifetime_secs() -> u64 {
    1800
}

/// Engine configuration: connection string, pool tuning, and the decision
/// cache toggle. Deserializable so deployments can load it from a config
/// document; `from_env` covers the common case.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    /// Enable the in-process decision cache.
    #[serde(default)]
    pub decision_cache: bool,
}

impl EngineSettings {
    pub fn new(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
            decision_cache: false,
        }
    }

    /// Read the connection string from `DATABASE_URL`.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| LatticeError::Storage("DATABASE_URL is not set".to_string()))?;
        Ok(Self::new(&url))
    }

    /// Build the connection pool described by these settings.
    pub async fn connect(&self) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(self.max_lifetime_secs))
            .connect(&self.database_url)
            .await
            .map_err(|e| LatticeError::Storage(format!("failed to connect: {}", e)))?;

        info!("database connection pool created");
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"database_url": "postgresql://localhost/lattice"}"#).unwrap();
        assert_eq!(settings.max_connections, 20);
        assert_eq!(settings.min_connections, 2);
        assert!(!settings.decision_cache);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let settings: EngineSettings = serde_json::from_str(
            r#"{"database_url": "postgresql://localhost/lattice", "max_connections": 5, "decision_cache": true}"#,
        )
        .unwrap();
        assert_eq!(settings.max_connections, 5);
        assert!(settings.decision_cache);
    }
}
